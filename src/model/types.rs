//! Normalized entity structs.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Domain appended to bare user identifiers.
pub const USER_DOMAIN: &str = "@s.whatsapp.net";

/// Identifier used for the placeholder account when no account artifact exists.
pub const UNKNOWN_ACCOUNT_ID: &str = "unknownAccount";

/// The device owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub status: Option<String>,
    #[serde(default, skip_serializing)]
    pub avatar: Option<Vec<u8>>,
    #[serde(default)]
    pub unknown: bool,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Placeholder owner used when no account artifact could be located.
    pub fn unknown() -> Self {
        Self {
            id: UNKNOWN_ACCOUNT_ID.to_string(),
            unknown: true,
            ..Default::default()
        }
    }

    pub fn full_id(&self) -> String {
        full_id(&self.id)
    }

    pub fn title(&self) -> String {
        format!("WhatsApp Account: {}", self.id)
    }
}

/// A remote party.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: String,
    pub name: Option<String>,
    pub status: Option<String>,
    #[serde(default, skip_serializing)]
    pub avatar: Option<Vec<u8>>,
    /// File name hint for the avatar picture, as stored by the source app.
    pub avatar_path: Option<String>,
}

impl Contact {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn full_id(&self) -> String {
        full_id(&self.id)
    }

    pub fn title(&self) -> String {
        format!("WhatsApp Contact: {}", self.id)
    }
}

fn full_id(id: &str) -> String {
    if id.contains('@') {
        id.to_string()
    } else {
        format!("{id}{USER_DOMAIN}")
    }
}

/// Contacts of one source directory.
///
/// Shared between every chat decoded under that directory, so it is
/// internally synchronized and mostly read.
#[derive(Debug, Default)]
pub struct ContactsDirectory {
    contacts: RwLock<HashMap<String, Contact>>,
}

impl ContactsDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_contacts(contacts: impl IntoIterator<Item = Contact>) -> Self {
        let dir = Self::new();
        dir.put_all(contacts);
        dir
    }

    pub fn get(&self, id: &str) -> Option<Contact> {
        self.contacts.read().get(id).cloned()
    }

    pub fn put(&self, contact: Contact) {
        self.contacts.write().insert(contact.id.clone(), contact);
    }

    pub fn put_all(&self, contacts: impl IntoIterator<Item = Contact>) {
        let mut map = self.contacts.write();
        for c in contacts {
            map.insert(c.id.clone(), c);
        }
    }

    /// Attach an avatar to a known contact. Returns false when the contact is unknown.
    pub fn set_avatar(&self, id: &str, avatar: Vec<u8>) -> bool {
        match self.contacts.write().get_mut(id) {
            Some(c) => {
                c.avatar = Some(avatar);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all contacts, sorted by id for stable output.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.contacts.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }
}

/// A conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub remote: Contact,
    pub title: String,
    pub group: bool,
    pub group_members: Vec<Contact>,
    pub messages: Vec<Message>,
}

impl Chat {
    pub fn new(id: i64, remote: Contact) -> Self {
        let title = remote
            .name
            .clone()
            .unwrap_or_else(|| remote.id.clone());
        Self {
            id,
            remote,
            title,
            group: false,
            group_members: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn is_group_chat(&self) -> bool {
        self.group
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Document,
    Contact,
    Location,
    ShareLocation,
    VoiceCall,
    VideoCall,
    System,
    Deleted,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT_MESSAGE",
            Self::Image => "IMAGE_MESSAGE",
            Self::Audio => "AUDIO_MESSAGE",
            Self::Video => "VIDEO_MESSAGE",
            Self::Document => "APP_MESSAGE",
            Self::Contact => "CONTACT_MESSAGE",
            Self::Location => "LOCATION_MESSAGE",
            Self::ShareLocation => "SHARE_LOCATION_MESSAGE",
            Self::VoiceCall => "VOICE_CALL",
            Self::VideoCall => "VIDEO_CALL",
            Self::System => "SYSTEM_MESSAGE",
            Self::Deleted => "MESSAGE_DELETED",
            Self::Unknown => "UNKNOWN_MESSAGE",
        }
    }

    pub fn is_location(&self) -> bool {
        matches!(self, Self::Location | Self::ShareLocation)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Received,
    Delivered,
    Read,
    Played,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sent => "MESSAGE_SENT",
            Self::Received => "MESSAGE_RECEIVED",
            Self::Delivered => "MESSAGE_DELIVERED",
            Self::Read => "MESSAGE_VIEWED",
            Self::Played => "MESSAGE_PLAYED",
            Self::Failed => "MESSAGE_FAILED",
        };
        write!(f, "{s}")
    }
}

/// Attachment metadata as declared by the source database.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaDescriptor {
    /// Hex-encoded sha-256 of the plain file, when the source stores one.
    pub hash: Option<String>,
    pub name: Option<String>,
    pub mime: Option<String>,
    #[serde(default)]
    pub size: u64,
    pub caption: Option<String>,
    /// Seconds, for audio/video/calls.
    #[serde(default)]
    pub duration: u64,
}

/// One chat entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
    pub from_me: bool,
    pub message_type: MessageType,
    pub body: Option<String>,
    pub url: Option<String>,
    /// Sender identifier inside group chats.
    pub remote_resource: Option<String>,
    #[serde(default)]
    pub media: MediaDescriptor,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub vcards: Vec<String>,
    #[serde(skip)]
    media_item: Option<Item>,
    #[serde(skip)]
    media_query: Option<String>,
}

impl Message {
    pub fn new(id: i64, timestamp: i64, from_me: bool) -> Self {
        Self {
            id,
            timestamp,
            from_me,
            ..Default::default()
        }
    }

    pub fn text(id: i64, timestamp: i64, from_me: bool, body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::new(id, timestamp, from_me)
        }
    }

    pub fn media_hash(&self) -> Option<&str> {
        self.media.hash.as_deref().filter(|h| !h.is_empty())
    }

    pub fn media_name(&self) -> Option<&str> {
        self.media.name.as_deref().filter(|n| !n.is_empty())
    }

    pub fn media_item(&self) -> Option<&Item> {
        self.media_item.as_ref()
    }

    pub fn media_query(&self) -> Option<&str> {
        self.media_query.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.media_item.is_some()
    }

    /// Bind the resolved item. A message that already has one keeps it.
    pub fn bind_media_item(&mut self, item: Item) -> bool {
        if self.media_item.is_some() {
            return false;
        }
        self.media_item = Some(item);
        true
    }

    pub fn set_media_query(&mut self, query: impl Into<String>) {
        self.media_query = Some(query.into());
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::VoiceCall | MessageType::VideoCall
        )
    }

    pub fn is_system_message(&self) -> bool {
        self.message_type == MessageType::System
    }
}

/// A file indexed somewhere in the case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub id: u64,
    pub name: String,
    /// Logical path inside the case (evidence path, not the local disk).
    pub path: String,
    pub length: Option<u64>,
    pub sha256: Option<String>,
    /// Generic hash attribute used by the index for identity queries.
    pub hash: Option<String>,
    pub content_type: Option<String>,
    /// On-disk copy of the content, when one exists.
    pub local_path: Option<PathBuf>,
}

impl Item {
    pub fn new(id: u64, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Directory part of the logical path; handles both separator styles.
    pub fn parent_path(&self) -> &str {
        parent_dir(&self.path)
    }
}

/// Everything before the last path separator, or "" when there is none.
pub fn parent_dir(path: &str) -> &str {
    if let Some(idx) = path.rfind('/') {
        &path[..idx]
    } else if let Some(idx) = path.rfind('\\') {
        &path[..idx]
    } else {
        ""
    }
}

/// Everything after the last `/`.
pub fn basename(name: &str) -> &str {
    match name.rfind('/') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}
