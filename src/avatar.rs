//! Contact avatar lookup in the case index.

use chrono::Utc;
use tracing::debug;

use crate::model::Contact;
use crate::model::types::basename;
use crate::search::{self, Query, SearchIndex, query};

/// Messenger initial release (2009-01-01), as a Unix timestamp.
const FIRST_RELEASE_SECS: i64 = 1_230_768_000;

/// Attach the contact's avatar picture when one can be found in the case.
///
/// Tries, in order: `<full id>.j*`, the stored avatar file name with `.jpg`
/// and `.thumb`, then any `<id>…` picture that looks like a timestamped
/// avatar, newest first. Contacts that already have an avatar are left alone.
pub fn resolve_avatar(index: &dyn SearchIndex, contact: &mut Contact) {
    if contact.avatar.is_some() {
        return;
    }

    let mut result = search::search_or_empty(
        index,
        &Query::prefix(query::NAME, format!("{}.j", contact.full_id())),
    );

    if result.is_empty()
        && let Some(hint) = contact.avatar_path.as_deref()
    {
        let base = basename(hint);
        result = search::search_or_empty(index, &Query::phrase(query::NAME, format!("{base}.jpg")));
        if result.is_empty() {
            result =
                search::search_or_empty(index, &Query::phrase(query::NAME, format!("{base}.thumb")));
        }
    }

    if result.is_empty() && !contact.id.is_empty() {
        let candidates = search::search_or_empty(index, &Query::prefix(query::NAME, &*contact.id));
        let now = Utc::now().timestamp();
        result = candidates
            .into_iter()
            .filter(|item| is_avatar_name(&item.name, &contact.id, now))
            .collect();
        result.sort_by(|a, b| b.name.cmp(&a.name));
    }

    let Some(item) = result.first() else {
        return;
    };
    match search::read_all(index, item) {
        Ok(bytes) => contact.avatar = Some(bytes),
        Err(e) => debug!(contact = %contact.id, avatar = %item.path, "could not read avatar: {e}"),
    }
}

/// `<id>.jpg`, `<id>.thumb` or `<id>-<unix time>.<ext>`; group avatars and
/// unrelated pictures sharing the prefix are rejected.
fn is_avatar_name(name: &str, id: &str, now_secs: i64) -> bool {
    let Some(rest) = name.strip_prefix(id) else {
        return false;
    };
    if name.split('-').count() >= 3 {
        return false;
    }
    if let Some(stamped) = rest.strip_prefix('-') {
        let Some(dot) = stamped.find('.') else {
            return false;
        };
        return stamped[..dot]
            .parse::<i64>()
            .is_ok_and(|t| t > FIRST_RELEASE_SECS && t < now_secs);
    }
    rest == ".thumb" || rest == ".jpg"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Item;
    use crate::search::MemoryIndex;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn avatar_names_filter_groups_and_bad_stamps() {
        assert!(is_avatar_name("5511.jpg", "5511", NOW));
        assert!(is_avatar_name("5511.thumb", "5511", NOW));
        assert!(is_avatar_name("5511-1600000000.jpg", "5511", NOW));
        assert!(!is_avatar_name("5511-1000.jpg", "5511", NOW));
        assert!(!is_avatar_name("5511-1600000000-1.jpg", "5511", NOW));
        assert!(!is_avatar_name("5511.png", "5511", NOW));
        assert!(!is_avatar_name("99.jpg", "5511", NOW));
    }

    #[test]
    fn resolves_by_full_id_first() {
        let idx = MemoryIndex::new();
        idx.add_with_content(
            Item::new(1, "5511@s.whatsapp.net.j", "/avatars/5511@s.whatsapp.net.j"),
            vec![0xff, 0xd8],
        );
        let mut c = Contact::new("5511");
        resolve_avatar(&idx, &mut c);
        assert_eq!(c.avatar, Some(vec![0xff, 0xd8]));
        assert_eq!(idx.query_count(), 1);
    }

    #[test]
    fn falls_back_to_newest_timestamped_picture() {
        let idx = MemoryIndex::new();
        idx.add_with_content(Item::new(1, "5511-1600000000.jpg", "/p/5511-1600000000.jpg"), vec![1]);
        idx.add_with_content(Item::new(2, "5511-1650000000.jpg", "/p/5511-1650000000.jpg"), vec![2]);
        let mut c = Contact::new("5511");
        resolve_avatar(&idx, &mut c);
        assert_eq!(c.avatar, Some(vec![2]));
    }

    #[test]
    fn existing_avatar_is_kept() {
        let idx = MemoryIndex::new();
        let mut c = Contact::new("5511");
        c.avatar = Some(vec![9]);
        resolve_avatar(&idx, &mut c);
        assert_eq!(c.avatar, Some(vec![9]));
        assert_eq!(idx.query_count(), 0);
    }
}
