//! In-memory case index.
//!
//! Evaluates [`Query`] trees directly against a list of items. Used by tests
//! and by embedders that already hold the case file list in memory.

use std::collections::HashMap;
use std::io::Cursor;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};

use super::query::{self, Query};
use super::{ReadSeek, SearchIndex};
use crate::model::Item;

#[derive(Debug, Default)]
pub struct MemoryIndex {
    items: RwLock<Vec<Item>>,
    contents: RwLock<HashMap<u64, Vec<u8>>>,
    /// Every query served, rendered without escaping.
    log: Mutex<Vec<String>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, item: Item) {
        self.items.write().push(item);
    }

    /// Add an item whose content is served from memory by [`SearchIndex::open`].
    pub fn add_with_content(&self, mut item: Item, content: Vec<u8>) {
        if item.length.is_none() {
            item.length = Some(content.len() as u64);
        }
        self.contents.write().insert(item.id, content);
        self.add(item);
    }

    pub fn queries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn query_count(&self) -> usize {
        self.log.lock().len()
    }

    fn matches(item: &Item, q: &Query) -> bool {
        match q {
            Query::Phrase { field, value } | Query::Exact { field, value } => {
                field_matches(item, field, value)
            }
            Query::Prefix { field, value } => field_value(item, field)
                .map(|v| v.starts_with(value.as_str()))
                .unwrap_or(false),
            Query::AnyOf { field, values, .. } => {
                values.iter().any(|v| field_matches(item, field, v))
            }
            Query::And(parts) => parts.iter().all(|p| Self::matches(item, p)),
            Query::Or(parts) => parts.iter().any(|p| Self::matches(item, p)),
        }
    }
}

fn field_value(item: &Item, field: &str) -> Option<String> {
    match field {
        query::NAME => Some(item.name.clone()),
        query::PATH => Some(item.path.clone()),
        query::LENGTH => item.length.map(|l| l.to_string()),
        query::CONTENT_TYPE => item.content_type.clone(),
        query::SHA256 => item.sha256.clone(),
        query::HASH => item.hash.clone(),
        _ => None,
    }
}

fn field_matches(item: &Item, field: &str, value: &str) -> bool {
    let Some(actual) = field_value(item, field) else {
        return false;
    };
    match field {
        query::SHA256 | query::HASH => actual.eq_ignore_ascii_case(value),
        // A path term selects everything stored under that directory.
        query::PATH => {
            actual == value
                || actual
                    .strip_prefix(value)
                    .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('\\'))
        }
        _ => actual == value,
    }
}

impl SearchIndex for MemoryIndex {
    fn search(&self, query: &Query) -> Result<Vec<Item>> {
        self.log.lock().push(query.to_string());
        Ok(self
            .items
            .read()
            .iter()
            .filter(|item| Self::matches(item, query))
            .cloned()
            .collect())
    }

    fn open(&self, item: &Item) -> Result<Box<dyn ReadSeek>> {
        if let Some(bytes) = self.contents.read().get(&item.id) {
            return Ok(Box::new(Cursor::new(bytes.clone())));
        }
        let path = item
            .local_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("item {} has no content", item.path))?;
        Ok(Box::new(std::fs::File::open(path)?))
    }
}
