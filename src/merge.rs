//! Backup detection and merge of recovered messages.
//!
//! Chats are paired by remote contact id. Two messages are the same message
//! when direction, timestamp and content identity agree; content identity is
//! the body, else the media hash, else the media name and message type.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::model::{Chat, Message, MessageType};

/// Share of candidate messages that must already exist in the reference
/// chats (strictly exceeded) before the candidate counts as a backup.
pub const BACKUP_OVERLAP_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ContentKey {
    Body(String),
    MediaHash(String),
    Untyped {
        media_name: Option<String>,
        message_type: MessageType,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MessageKey {
    from_me: bool,
    timestamp: i64,
    content: ContentKey,
}

impl MessageKey {
    fn of(m: &Message) -> Self {
        let content = if let Some(body) = m.body.as_deref().filter(|b| !b.is_empty()) {
            ContentKey::Body(body.to_string())
        } else if let Some(hash) = m.media_hash() {
            ContentKey::MediaHash(hash.to_string())
        } else {
            ContentKey::Untyped {
                media_name: m.media_name().map(str::to_string),
                message_type: m.message_type,
            }
        };
        Self {
            from_me: m.from_me,
            timestamp: m.timestamp,
            content,
        }
    }
}

fn keys_by_remote(chats: &[Chat]) -> HashMap<&str, HashSet<MessageKey>> {
    let mut map: HashMap<&str, HashSet<MessageKey>> = HashMap::new();
    for chat in chats {
        map.entry(chat.remote.id.as_str())
            .or_default()
            .extend(chat.messages.iter().map(MessageKey::of));
    }
    map
}

/// Whether `candidate` looks like an older snapshot of `against`.
///
/// Every candidate chat must exist in `against`, and more than
/// [`BACKUP_OVERLAP_THRESHOLD`] of the candidate's messages must already be
/// there. Anything ambiguous is "not a backup", so the copy is reported on
/// its own instead of being folded in.
pub fn is_backup(candidate: &[Chat], against: &[Chat]) -> bool {
    if candidate.is_empty() {
        return false;
    }
    let reference = keys_by_remote(against);
    let mut total = 0usize;
    let mut matched = 0usize;
    for chat in candidate {
        let Some(keys) = reference.get(chat.remote.id.as_str()) else {
            debug!(remote = %chat.remote.id, "candidate has a chat unknown to the reference");
            return false;
        };
        for m in &chat.messages {
            total += 1;
            if keys.contains(&MessageKey::of(m)) {
                matched += 1;
            }
        }
    }
    if total == 0 {
        return false;
    }
    let ratio = matched as f64 / total as f64;
    debug!(matched, total, ratio, "backup overlap");
    ratio > BACKUP_OVERLAP_THRESHOLD
}

/// Insert messages found only in `backup` into the matching chats of `main`.
///
/// Inserted messages land after the last main message with a timestamp not
/// later than theirs. Existing messages, titles and group members are left
/// untouched. Returns the number of inserted messages; merging the same
/// backup again inserts nothing.
pub fn merge(main: &mut [Chat], backup: &[Chat]) -> usize {
    let positions: HashMap<String, usize> = main
        .iter()
        .enumerate()
        .map(|(i, c)| (c.remote.id.clone(), i))
        .collect();

    let mut recovered = 0;
    for backup_chat in backup {
        let Some(&idx) = positions.get(&backup_chat.remote.id) else {
            continue;
        };
        let chat = &mut main[idx];
        let mut known: HashSet<MessageKey> = chat.messages.iter().map(MessageKey::of).collect();
        for m in &backup_chat.messages {
            let key = MessageKey::of(m);
            if known.contains(&key) {
                continue;
            }
            let pos = chat.messages.partition_point(|e| e.timestamp <= m.timestamp);
            chat.messages.insert(pos, m.clone());
            known.insert(key);
            recovered += 1;
        }
    }
    recovered
}
