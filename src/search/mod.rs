//! Case index contract.
//!
//! - **[`query`]**: query tree and its rendering to the index grammar.
//! - **[`memory`]**: in-memory index evaluating query trees directly.
//!
//! The correlator never owns the index; the surrounding pipeline hands one in
//! through [`SearchIndex`].

pub mod memory;
pub mod query;

use std::io::{Read, Seek};

use anyhow::{Context, Result};

use crate::model::Item;

pub use memory::MemoryIndex;
pub use query::Query;

/// Readable, seekable item content.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub trait SearchIndex: Send + Sync {
    /// Items matching `query`.
    fn search(&self, query: &Query) -> Result<Vec<Item>>;

    /// Escape a raw value for embedding in a rendered query.
    fn escape(&self, value: &str) -> String {
        query::escape_query_value(value)
    }

    /// Open the content of an item for random access.
    fn open(&self, item: &Item) -> Result<Box<dyn ReadSeek>> {
        let path = item
            .local_path
            .as_ref()
            .with_context(|| format!("item {} has no local content", item.path))?;
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Box::new(file))
    }

    /// Render `query` using this index's escaping.
    fn render(&self, query: &Query) -> String {
        query.render(&|v: &str| self.escape(v))
    }
}

/// Read the whole content of an item.
pub fn read_all(index: &dyn SearchIndex, item: &Item) -> std::io::Result<Vec<u8>> {
    let mut reader = index
        .open(item)
        .map_err(|e| std::io::Error::other(format!("{e:#}")))?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Run a query, logging and swallowing index failures.
///
/// A failed lookup is treated like an empty result: missing evidence links
/// are not fatal for the artifact being processed.
pub fn search_or_empty(index: &dyn SearchIndex, query: &Query) -> Vec<Item> {
    match index.search(query) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(query = %index.render(query), "index query failed: {e:#}");
            Vec::new()
        }
    }
}
