//! Contacts directories and account lookup.
//!
//! Every message store is decoded against the contacts database that sits in
//! the same folder. Looking that database up and decoding it is expensive, so
//! directories are memoized per folder for the whole case run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::artifact::{Decoders, SourceVariant};
use crate::error::DecodeError;
use crate::model::types::parent_dir;
use crate::model::{Account, ContactsDirectory, Item};
use crate::search::{self, Query, SearchIndex, query};

#[derive(Debug, Default)]
pub struct ContactsCache {
    dirs: RwLock<HashMap<String, Arc<ContactsDirectory>>>,
}

impl ContactsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory for the folder holding `artifact_path`, built on first use.
    ///
    /// Concurrent first lookups may both build; the first one stored wins and
    /// everyone shares it.
    pub fn directory_for(
        &self,
        artifact_path: &str,
        index: Option<&dyn SearchIndex>,
        variant: SourceVariant,
        decoders: &Decoders,
    ) -> Result<Arc<ContactsDirectory>, DecodeError> {
        let key = parent_dir(artifact_path);
        if let Some(dir) = self.dirs.read().get(key) {
            return Ok(Arc::clone(dir));
        }

        let built = Arc::new(load_directory(key, index, variant, decoders)?);
        let mut dirs = self.dirs.write();
        Ok(Arc::clone(dirs.entry(key.to_string()).or_insert(built)))
    }

    /// Directory for a folder without consulting the index; empty when new.
    ///
    /// Used when the contacts database itself is being processed and its rows
    /// are merged into whatever the folder already has.
    pub fn directory_for_folder_of(&self, artifact_path: &str) -> Arc<ContactsDirectory> {
        let key = parent_dir(artifact_path);
        if let Some(dir) = self.dirs.read().get(key) {
            return Arc::clone(dir);
        }
        let mut dirs = self.dirs.write();
        Arc::clone(dirs.entry(key.to_string()).or_default())
    }

    pub fn len(&self) -> usize {
        self.dirs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.read().is_empty()
    }
}

fn load_directory(
    folder: &str,
    index: Option<&dyn SearchIndex>,
    variant: SourceVariant,
    decoders: &Decoders,
) -> Result<ContactsDirectory, DecodeError> {
    let Some(index) = index else {
        return Ok(ContactsDirectory::new());
    };
    let q = Query::phrase(query::PATH, folder).and(Query::any_of(
        query::CONTENT_TYPE,
        variant.contacts_content_types(),
        true,
    ));
    let items = search::search_or_empty(index, &q);
    let Some(item) = items.first() else {
        debug!(folder, "no contacts database next to message store");
        return Ok(ContactsDirectory::new());
    };
    debug!(folder, contacts_db = %item.path, "decoding contacts directory");
    variant.decode_contacts(decoders, item)
}

/// Locate and decode the device owner's account.
///
/// Picks the account file closest to `db_path` and falls back to the
/// unknown-account placeholder when none can be read.
pub fn lookup_account(
    index: Option<&dyn SearchIndex>,
    db_path: &str,
    variant: SourceVariant,
    decoders: &Decoders,
) -> Account {
    if let Some(index) = index {
        let q = Query::phrase(query::NAME, variant.account_file_name());
        let items = search::search_or_empty(index, &q);
        if let Some(item) = best_item(&items, db_path) {
            match search::read_all(index, item)
                .map_err(DecodeError::from)
                .and_then(|bytes| variant.decoder(decoders).decode_account(&bytes))
            {
                Ok(account) => return account,
                Err(e) => warn!(account_file = %item.path, "could not decode account: {e}"),
            }
        }
    }
    Account::unknown()
}

/// The candidate sharing the deepest ancestor directory with `path`.
pub fn best_item<'a>(items: &'a [Item], path: &str) -> Option<&'a Item> {
    let mut current = path;
    loop {
        current = parent_dir(current);
        if current.is_empty() {
            break;
        }
        if let Some(item) = items.iter().find(|i| i.path.starts_with(current)) {
            return Some(item);
        }
    }
    // Reaching the root: any absolute candidate shares it.
    if path.starts_with('/') {
        return items.iter().find(|i| i.path.starts_with('/'));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u64, path: &str) -> Item {
        let name = path.rsplit('/').next().unwrap_or(path);
        Item::new(id, name, path)
    }

    #[test]
    fn best_item_prefers_closest_ancestor() {
        let items = vec![
            item(1, "/img/other/shared_prefs/com.whatsapp_preferences.xml"),
            item(2, "/img/user0/com.whatsapp/shared_prefs/com.whatsapp_preferences.xml"),
        ];
        let best = best_item(&items, "/img/user0/com.whatsapp/databases/msgstore.db").unwrap();
        assert_eq!(best.id, 2);
    }

    #[test]
    fn best_item_none_for_relative_paths_without_overlap() {
        let items = vec![item(1, "/a/b.xml")];
        assert!(best_item(&items, "msgstore.db").is_none());
    }

    #[test]
    fn folder_directory_is_shared() {
        let cache = ContactsCache::new();
        let a = cache.directory_for_folder_of("/d/wa.db");
        let b = cache.directory_for_folder_of("/d/msgstore.db");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }
}
