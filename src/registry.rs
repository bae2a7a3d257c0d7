//! Case-wide registry of discovered message stores.
//!
//! Every message store seen during a case run gets one [`DatabaseContext`],
//! keyed by artifact id. The first registration for an id wins; later
//! registrations get the same context back. Each context decodes its chat
//! list at most once, under its own lock, so unrelated databases never wait
//! on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard, RwLock};
use regex::Regex;
use tracing::{debug, info};

use crate::artifact::{MSG_STORE, MSG_STORE_READY};
use crate::error::DecodeError;
use crate::model::{Chat, Item};
use crate::search::{self, Query, SearchIndex, query};

/// Dated backups written by the app, e.g. `msgstore-2023-01-31.1.db.crypt14`.
static DATED_BACKUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"msgstore-\d{4}-\d{2}-\d{2}").expect("valid backup name regex"));

/// Path fragment of encrypted backup containers.
const ENCRYPTED_BACKUP_FRAGMENT: &str = "msgstore.db.crypt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not usable as main or backup (e.g. failed to decode).
    Unknown,
    Main,
    /// Named or stored like a backup; confirmed once merged into a main.
    Backup,
}

/// Classify an artifact from its file name and evidence path.
pub fn classify(name: &str, path: &str) -> Classification {
    if DATED_BACKUP.is_match(name) || path.contains(ENCRYPTED_BACKUP_FRAGMENT) {
        Classification::Backup
    } else {
        Classification::Main
    }
}

#[derive(Debug)]
struct ContextState {
    classification: Classification,
    backup_of: Option<Item>,
    released: bool,
    /// Added by the index scan rather than by its own first stage.
    backfilled: bool,
}

/// One discovered message store.
#[derive(Debug)]
pub struct DatabaseContext {
    item: Item,
    state: Mutex<ContextState>,
    chats: Mutex<Option<Vec<Chat>>>,
    merge_gate: Mutex<()>,
}

impl DatabaseContext {
    pub fn new(item: Item) -> Self {
        let classification = classify(&item.name, &item.path);
        Self {
            item,
            state: Mutex::new(ContextState {
                classification,
                backup_of: None,
                released: false,
                backfilled: false,
            }),
            chats: Mutex::new(None),
            merge_gate: Mutex::new(()),
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn id(&self) -> u64 {
        self.item.id
    }

    pub fn name(&self) -> &str {
        &self.item.name
    }

    pub fn classification(&self) -> Classification {
        self.state.lock().classification
    }

    pub fn set_classification(&self, classification: Classification) {
        self.state.lock().classification = classification;
    }

    pub fn is_main(&self) -> bool {
        self.classification() == Classification::Main
    }

    /// The main database this one was merged into, if any.
    pub fn backup_of(&self) -> Option<Item> {
        self.state.lock().backup_of.clone()
    }

    /// Record that this database was merged into `main`. Returns false when
    /// it was already linked to a main.
    pub fn mark_backup_of(&self, main: &Item) -> bool {
        let mut state = self.state.lock();
        state.classification = Classification::Backup;
        if state.backup_of.is_some() {
            return false;
        }
        state.backup_of = Some(main.clone());
        true
    }

    pub fn is_decoded(&self) -> bool {
        self.chats.lock().is_some()
    }

    /// Decode the chat list unless it is already present.
    ///
    /// Callers racing on the same context block until the first decode
    /// finishes. A failed decode leaves the list absent. Returns whether this
    /// call did the decoding.
    pub fn ensure_decoded<F>(&self, decode: F) -> Result<bool, DecodeError>
    where
        F: FnOnce(&Item) -> Result<Vec<Chat>, DecodeError>,
    {
        let mut chats = self.chats.lock();
        if chats.is_some() {
            return Ok(false);
        }
        let decoded = decode(&self.item)?;
        debug!(db = %self.item.path, chats = decoded.len(), "decoded chat list");
        *chats = Some(decoded);
        Ok(true)
    }

    /// Copy of the chat list, if decoded.
    pub fn chats_snapshot(&self) -> Option<Vec<Chat>> {
        self.chats.lock().clone()
    }

    pub fn with_chats<R>(&self, f: impl FnOnce(&[Chat]) -> R) -> Option<R> {
        self.chats.lock().as_deref().map(f)
    }

    pub fn with_chats_mut<R>(&self, f: impl FnOnce(&mut Vec<Chat>) -> R) -> Option<R> {
        self.chats.lock().as_mut().map(f)
    }

    /// Serializes merges into this context while the guard lives.
    pub fn merge_gate(&self) -> MutexGuard<'_, ()> {
        self.merge_gate.lock()
    }

    /// Drop the decoded payload but keep the context marked as decoded.
    pub fn release_chats(&self) {
        let mut chats = self.chats.lock();
        if let Some(list) = chats.as_mut() {
            list.clear();
            list.shrink_to_fit();
        }
        self.state.lock().released = true;
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn is_backfilled(&self) -> bool {
        self.state.lock().backfilled
    }

    fn mark_backfilled(&self) {
        self.state.lock().backfilled = true;
    }
}

#[derive(Debug, Default)]
pub struct DatabaseRegistry {
    contexts: RwLock<HashMap<u64, Arc<DatabaseContext>>>,
    /// `Some(added)` once the backfill scan ran.
    backfill: Mutex<Option<usize>>,
    backups_merged: AtomicUsize,
    /// Backfilled contexts dropped again because they could not be decoded.
    discarded_backfilled: AtomicUsize,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an artifact; returns its context and whether it was new.
    pub fn register(&self, item: &Item) -> (Arc<DatabaseContext>, bool) {
        if let Some(ctx) = self.contexts.read().get(&item.id) {
            return (Arc::clone(ctx), false);
        }
        let mut contexts = self.contexts.write();
        if let Some(ctx) = contexts.get(&item.id) {
            return (Arc::clone(ctx), false);
        }
        let ctx = Arc::new(DatabaseContext::new(item.clone()));
        contexts.insert(item.id, Arc::clone(&ctx));
        debug!(
            db = %item.path,
            classification = ?ctx.classification(),
            "registered message store"
        );
        (ctx, true)
    }

    pub fn get(&self, id: u64) -> Option<Arc<DatabaseContext>> {
        self.contexts.read().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<DatabaseContext>> {
        self.contexts.write().remove(&id)
    }

    /// Drop a context whose database could not be decoded.
    ///
    /// The context is marked unknown for anyone still holding it and is never
    /// offered for merging or decoding again. Returns false when it was
    /// already gone.
    pub fn discard(&self, id: u64) -> bool {
        let Some(ctx) = self.remove(id) else {
            return false;
        };
        ctx.set_classification(Classification::Unknown);
        if ctx.is_backfilled() {
            self.discarded_backfilled.fetch_add(1, Ordering::SeqCst);
        }
        debug!(db = %ctx.item().path, "discarded undecodable message store");
        true
    }

    /// Backfilled contexts that were discarded.
    pub fn discarded_backfilled(&self) -> usize {
        self.discarded_backfilled.load(Ordering::SeqCst)
    }

    /// Snapshot of all contexts, sorted by descending artifact name so that
    /// newer dated backups come first.
    pub fn contexts_newest_first(&self) -> Vec<Arc<DatabaseContext>> {
        let mut all: Vec<_> = self.contexts.read().values().cloned().collect();
        all.sort_by(|a, b| b.name().cmp(a.name()).then_with(|| b.id().cmp(&a.id())));
        all
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    /// Register every message store the index already knows about.
    ///
    /// Needed when a run is resumed and earlier registrations are gone. Runs
    /// once per registry; later calls return 0 without querying.
    pub fn backfill_from_index(&self, index: Option<&dyn SearchIndex>) -> usize {
        let mut gate = self.backfill.lock();
        if gate.is_some() {
            return 0;
        }
        let mut added = 0;
        if let Some(index) = index {
            let q = Query::any_of(query::CONTENT_TYPE, [MSG_STORE, MSG_STORE_READY], true);
            for item in search::search_or_empty(index, &q) {
                let (ctx, new) = self.register(&item);
                if new {
                    ctx.mark_backfilled();
                    added += 1;
                }
            }
            info!(added, "backfilled message stores from case index");
        }
        *gate = Some(added);
        added
    }

    pub fn backfilled(&self) -> usize {
        self.backfill.lock().unwrap_or(0)
    }

    pub fn record_backup_merged(&self) {
        self.backups_merged.fetch_add(1, Ordering::SeqCst);
    }

    pub fn backups_merged(&self) -> usize {
        self.backups_merged.load(Ordering::SeqCst)
    }

    /// Once only merged backups (and backfilled entries) remain, free their
    /// decoded chat lists. Returns whether anything was released.
    pub fn release_if_only_backups_left(&self) -> bool {
        let expected = (self.backups_merged() + self.backfilled())
            .saturating_sub(self.discarded_backfilled());
        if self.len() != expected {
            return false;
        }
        info!("clearing remaining decoded message stores from cache");
        for ctx in self.contexts.read().values() {
            if ctx.is_decoded() {
                ctx.release_chats();
            }
        }
        true
    }
}
