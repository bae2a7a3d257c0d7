//! Links message attachments to files found in the case index.
//!
//! Messages are handled in fixed-size batches so each tier issues one bounded
//! query per batch:
//!
//! 1. declared sha-256 hashes, all at once;
//! 2. for messages without a hash, file name plus exact size;
//! 3. optionally, for hash misses, file name plus a size up to 15 bytes
//!    larger, accepted only when the extra bytes are all zero (some
//!    containers pad encrypted media).

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, SeekFrom};

use tracing::{debug, trace};

use crate::config::CorrelatorConfig;
use crate::model::types::basename;
use crate::model::{Item, Message};
use crate::search::{self, Query, SearchIndex, query};

/// Largest zero padding accepted by the fallback tier.
pub const MAX_PADDING: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Resolving chats that will be reported: matched items are kept on the
    /// messages.
    Report,
    /// Whole-database pass that only needs to know what is missing; item
    /// references are not retained.
    DatabaseScan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// Messages that received a link in this pass.
    pub linked: usize,
    /// Declared hashes no tier could match.
    pub missing_hashes: BTreeSet<String>,
}

impl ResolveOutcome {
    pub fn absorb(&mut self, other: ResolveOutcome) {
        self.linked += other.linked;
        self.missing_hashes.extend(other.missing_hashes);
    }
}

pub struct MediaResolver<'a> {
    index: &'a dyn SearchIndex,
    batch_size: usize,
    padded_fallback: bool,
}

impl<'a> MediaResolver<'a> {
    pub fn new(index: &'a dyn SearchIndex, batch_size: usize, padded_fallback: bool) -> Self {
        Self {
            index,
            batch_size: batch_size.max(1),
            padded_fallback,
        }
    }

    pub fn from_config(index: &'a dyn SearchIndex, config: &CorrelatorConfig) -> Self {
        Self::new(
            index,
            config.search_batch_size,
            config.link_media_by_name_and_approx_size_fallback,
        )
    }

    pub fn resolve(&self, messages: &mut [Message], mode: ResolveMode) -> ResolveOutcome {
        let candidates: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.media_hash().is_some() || m.media_name().is_some())
            .map(|(i, _)| i)
            .collect();

        let mut outcome = ResolveOutcome::default();
        for batch in candidates.chunks(self.batch_size) {
            outcome.absorb(self.resolve_batch(messages, batch, mode));
        }
        if outcome.linked > 0 {
            debug!(linked = outcome.linked, missing = outcome.missing_hashes.len(), "media resolved");
        }
        outcome
    }

    fn resolve_batch(
        &self,
        messages: &mut [Message],
        batch: &[usize],
        mode: ResolveMode,
    ) -> ResolveOutcome {
        let mut outcome = ResolveOutcome::default();
        let mut by_hash: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut by_name_size: BTreeMap<(String, u64), Vec<usize>> = BTreeMap::new();

        for &i in batch {
            let m = &messages[i];
            if m.is_resolved() {
                continue;
            }
            if let Some(hash) = m.media_hash() {
                by_hash.entry(hash.to_string()).or_default().push(i);
            } else if let Some(name) = m.media_name()
                && m.media.size > 0
            {
                by_name_size
                    .entry((basename(name).to_string(), m.media.size))
                    .or_default()
                    .push(i);
            }
        }

        // Tier 1: hashes.
        if !by_hash.is_empty() {
            let q = Query::any_of(query::SHA256, by_hash.keys().cloned(), false);
            for item in search::search_or_empty(self.index, &q) {
                let Some(hash) = item.sha256.as_deref() else {
                    continue;
                };
                let Some(key) = by_hash
                    .keys()
                    .find(|k| k.eq_ignore_ascii_case(hash))
                    .cloned()
                else {
                    continue;
                };
                if let Some(list) = by_hash.remove(&key) {
                    let recorded = Query::exact(query::SHA256, &key);
                    outcome.linked += self.bind(messages, &list, &item, &recorded, mode);
                }
            }
        }

        // Tier 2: name and exact size.
        if !by_name_size.is_empty() {
            let q = Query::Or(
                by_name_size
                    .keys()
                    .map(|(name, size)| Query::name_and_length(name, *size))
                    .collect(),
            );
            for item in search::search_or_empty(self.index, &q) {
                let Some(len) = item.length.filter(|l| *l > 0) else {
                    continue;
                };
                if item.name.is_empty() {
                    continue;
                }
                let key = (basename(&item.name).to_string(), len);
                if let Some(list) = by_name_size.get(&key) {
                    let recorded = Query::name_and_length(&key.0, len);
                    outcome.linked += self.bind(messages, list, &item, &recorded, mode);
                }
            }
        }

        // Tier 3: hash misses that may be zero padded.
        let mut padded_hits: BTreeSet<String> = BTreeSet::new();
        if self.padded_fallback && !by_hash.is_empty() {
            let mut by_name: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for list in by_hash.values() {
                for &i in list {
                    if let Some(name) = messages[i].media_name() {
                        by_name.entry(basename(name).to_string()).or_default().push(i);
                    }
                }
            }
            if !by_name.is_empty() {
                let q = Query::any_of(query::NAME, by_name.keys().cloned(), true);
                for item in search::search_or_empty(self.index, &q) {
                    let Some(len) = item.length.filter(|l| *l > 0) else {
                        continue;
                    };
                    let Some(list) = by_name.get(basename(&item.name)) else {
                        continue;
                    };
                    let accepted: Vec<usize> = list
                        .iter()
                        .copied()
                        .filter(|&i| {
                            let size = messages[i].media.size;
                            is_within_padding(size, len)
                                && ends_with_zeros(self.index, &item, size)
                        })
                        .collect();
                    if accepted.is_empty() {
                        continue;
                    }
                    let recorded = match item.hash.as_deref().or(item.sha256.as_deref()) {
                        Some(hash) => Query::exact(query::HASH, hash),
                        None => Query::name_and_length(basename(&item.name), len),
                    };
                    outcome.linked += self.bind(messages, &accepted, &item, &recorded, mode);
                    for i in accepted {
                        if let Some(h) = messages[i].media_hash() {
                            padded_hits.insert(h.to_string());
                        }
                    }
                }
            }
        }

        outcome.missing_hashes = by_hash
            .into_keys()
            .filter(|h| !padded_hits.contains(h))
            .collect();
        outcome
    }

    /// Link `item` to the listed messages that are still unresolved.
    fn bind(
        &self,
        messages: &mut [Message],
        list: &[usize],
        item: &Item,
        recorded: &Query,
        mode: ResolveMode,
    ) -> usize {
        let rendered = self.index.render(recorded);
        let mut linked = 0;
        for &i in list {
            let m = &mut messages[i];
            if m.is_resolved() {
                continue;
            }
            m.set_media_query(rendered.clone());
            if mode == ResolveMode::Report {
                m.bind_media_item(item.clone());
            }
            linked += 1;
        }
        trace!(item = %item.path, linked, query = %rendered, "bound media item");
        linked
    }
}

/// Candidate length is 1..=15 bytes larger than the declared size.
pub fn is_within_padding(declared: u64, actual: u64) -> bool {
    actual > declared && actual - declared <= MAX_PADDING
}

/// Every byte from `offset` to the end of the item is zero.
///
/// Unreadable items never match.
pub fn ends_with_zeros(index: &dyn SearchIndex, item: &Item, offset: u64) -> bool {
    let Ok(mut reader) = index.open(item) else {
        return false;
    };
    if reader.seek(SeekFrom::Start(offset)).is_err() {
        return false;
    }
    let mut tail = Vec::with_capacity(MAX_PADDING as usize + 1);
    if reader
        .take(MAX_PADDING + 1)
        .read_to_end(&mut tail)
        .is_err()
    {
        return false;
    }
    tail.len() as u64 <= MAX_PADDING && tail.iter().all(|b| *b == 0)
}
