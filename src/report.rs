//! Report assembly: turning decoded chats, contacts and accounts into units
//! handed to the surrounding pipeline.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::artifact::{
    self, ACCOUNT, ATTACHMENT, CALL, CHAT, CONTACT, MESSAGE, SQLITE_TABLES, VCARD,
};
use crate::error::DecodeError;
use crate::model::{Account, Chat, Contact, ContactsDirectory, Item, Message};

/// Attribute keys set on report units.
pub mod attr {
    pub const VIRTUAL_ID: &str = "virtual_id";
    pub const PARENT_VIRTUAL_ID: &str = "parent_virtual_id";
    pub const PARENT_VIEW_POSITION: &str = "parent_view_position";
    pub const DECODED_DATA: &str = "decoded_data";
    pub const DOWNLOADED_DATA: &str = "downloaded_data";
    pub const HAS_CHILD: &str = "has_child";
    pub const PARTICIPANTS: &str = "participants";
    pub const GROUP_ID: &str = "group_id";
    pub const LINKED_ITEMS: &str = "linked_items";
    pub const SHARED_HASHES: &str = "shared_hashes";
    pub const LOCATIONS: &str = "locations";
    pub const MESSAGE_FROM: &str = "message_from";
    pub const MESSAGE_TO: &str = "message_to";
    pub const MESSAGE_DATE: &str = "message_date";
    pub const MESSAGE_BODY: &str = "message_body";
    pub const MESSAGE_STATUS: &str = "message_status";
    pub const URL: &str = "url";
    pub const MEDIA_NAME: &str = "media_name";
    pub const MEDIA_MIME: &str = "media_mime";
    pub const MEDIA_SIZE: &str = "media_size";
    pub const DURATION: &str = "duration";
    pub const USER_NAME: &str = "user_name";
    pub const USER_PHONE: &str = "user_phone";
    pub const USER_ACCOUNT: &str = "user_account";
    pub const USER_ACCOUNT_TYPE: &str = "user_account_type";
    pub const USER_NOTES: &str = "user_notes";
    pub const CONTACT_OF_ACCOUNT: &str = "contact_of_account";
    pub const THUMBNAIL_BASE64: &str = "thumbnail_base64";
    pub const IS_BACKUP_FROM: &str = "is_backup_from";
    pub const TABLE: &str = "table";
}

pub const ACCOUNT_TYPE: &str = "WhatsApp";

/// Prefix of the body placeholder for messages without text.
const MESSAGE_TYPE_PREFIX: &str = "! ";

/// One output document with its attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportUnit {
    pub title: String,
    pub content_type: Option<String>,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl ReportUnit {
    pub fn new(title: impl Into<String>, content_type: &str) -> Self {
        Self {
            title: title.into(),
            content_type: Some(content_type.to_string()),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    /// Replace all values of `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.attributes.insert(key.to_string(), vec![value.into()]);
    }

    pub fn set_opt(&mut self, key: &str, value: Option<impl Into<String>>) {
        if let Some(v) = value {
            self.set(key, v);
        }
    }

    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.attributes
            .entry(key.to_string())
            .or_default()
            .push(value.into());
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn values(&self, key: &str) -> &[String] {
        self.attributes.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A media file fetched from the network.
    pub fn downloaded(n: usize, content: Vec<u8>) -> Self {
        let mut unit = Self {
            title: format!("Downloaded_item_{n}"),
            content,
            ..Default::default()
        };
        unit.set(attr::DOWNLOADED_DATA, "true");
        unit
    }

    /// Notice attached to a backup whose messages were merged into `main`.
    pub fn backup_notice(backup: &Item, main: &Item) -> Self {
        let mut unit = Self {
            title: backup.name.clone(),
            content_type: Some("text/plain".to_string()),
            content: format!("Backup from {}", main.path).into_bytes(),
            ..Default::default()
        };
        unit.set(attr::IS_BACKUP_FROM, main.id.to_string());
        unit
    }
}

/// Receives report units. Write-only.
pub trait ReportSink: Send + Sync {
    fn emit(&self, unit: ReportUnit);
}

/// Collects units in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    units: Mutex<Vec<ReportUnit>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> Vec<ReportUnit> {
        self.units.lock().clone()
    }

    pub fn units_of_type(&self, content_type: &str) -> Vec<ReportUnit> {
        self.units
            .lock()
            .iter()
            .filter(|u| u.content_type.as_deref() == Some(content_type))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, unit: ReportUnit) {
        self.units.lock().push(unit);
    }
}

/// One rendered piece of a chat and the messages it covers.
#[derive(Debug, Clone)]
pub struct ChatFragment {
    pub content: Vec<u8>,
    pub messages: Range<usize>,
}

/// Renders a chat into one or more fragments covering its messages in order.
pub trait ChatRenderer: Send + Sync {
    fn render(
        &self,
        chat: &Chat,
        contacts: &ContactsDirectory,
        account: &Account,
    ) -> anyhow::Result<Vec<ChatFragment>>;
}

/// JSON rendering, split every `max_messages_per_fragment` messages.
#[derive(Debug, Clone)]
pub struct JsonChatRenderer {
    pub max_messages_per_fragment: usize,
}

impl Default for JsonChatRenderer {
    fn default() -> Self {
        Self {
            max_messages_per_fragment: 5000,
        }
    }
}

#[derive(Serialize)]
struct JsonFragment<'a> {
    title: &'a str,
    account: String,
    remote: String,
    group: bool,
    members: Vec<String>,
    first_message: usize,
    messages: &'a [Message],
}

impl ChatRenderer for JsonChatRenderer {
    fn render(
        &self,
        chat: &Chat,
        _contacts: &ContactsDirectory,
        account: &Account,
    ) -> anyhow::Result<Vec<ChatFragment>> {
        let step = self.max_messages_per_fragment.max(1);
        let total = chat.messages.len();
        let mut ranges: Vec<Range<usize>> = (0..total)
            .step_by(step)
            .map(|start| start..(start + step).min(total))
            .collect();
        if ranges.is_empty() {
            ranges.push(0..0);
        }
        ranges
            .into_iter()
            .map(|range| {
                let doc = JsonFragment {
                    title: &chat.title,
                    account: account.full_id(),
                    remote: chat.remote.full_id(),
                    group: chat.is_group_chat(),
                    members: chat.group_members.iter().map(Contact::full_id).collect(),
                    first_message: range.start,
                    messages: &chat.messages[range.clone()],
                };
                Ok(ChatFragment {
                    content: serde_json::to_vec_pretty(&doc)?,
                    messages: range,
                })
            })
            .collect()
    }
}

/// Anything that can appear as a chat participant.
pub trait Participant {
    fn id(&self) -> &str;
    fn name(&self) -> Option<&str>;
    fn full_id(&self) -> String;
}

impl Participant for Contact {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn full_id(&self) -> String {
        Contact::full_id(self)
    }
}

impl Participant for Account {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn full_id(&self) -> String {
        Account::full_id(self)
    }
}

/// `+<digits>` when the identifier is a bare phone number.
pub fn international_phone(id: &str) -> Option<String> {
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| format!("+{id}"))
}

pub fn format_mm_ss(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

fn format_timestamp(millis: i64) -> Option<String> {
    DateTime::from_timestamp_millis(millis).map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Unit describing the device owner.
pub fn account_unit(account: &Account) -> ReportUnit {
    let mut unit = ReportUnit::new(account.title(), ACCOUNT);
    unit.set_opt(attr::USER_NAME, account.name.clone());
    unit.set_opt(attr::USER_PHONE, international_phone(&account.id));
    unit.set(attr::USER_ACCOUNT, account.full_id());
    unit.set(attr::USER_ACCOUNT_TYPE, ACCOUNT_TYPE);
    unit.set_opt(attr::USER_NOTES, account.status.clone());
    unit.set(attr::DECODED_DATA, "true");
    if let Some(avatar) = &account.avatar {
        unit.set(attr::THUMBNAIL_BASE64, BASE64.encode(avatar));
    }
    unit
}

/// Unit describing one contact of `account`.
pub fn contact_unit(contact: &Contact, account: &Account) -> ReportUnit {
    let mut unit = ReportUnit::new(contact.title(), CONTACT);
    unit.set_opt(attr::USER_NAME, contact.name.clone());
    unit.set_opt(attr::USER_PHONE, international_phone(&contact.id));
    unit.set(attr::USER_ACCOUNT, contact.full_id());
    unit.set(attr::USER_ACCOUNT_TYPE, ACCOUNT_TYPE);
    unit.set(attr::CONTACT_OF_ACCOUNT, account.full_id());
    unit.set_opt(attr::USER_NOTES, contact.status.clone());
    unit.set(attr::DECODED_DATA, "true");
    if let Some(avatar) = &contact.avatar {
        unit.set(attr::THUMBNAIL_BASE64, BASE64.encode(avatar));
    }
    unit
}

/// Fallback listing of the tables in a database that could not be decoded.
pub fn sqlite_table_listing(item: &Item, path: &Path) -> Result<ReportUnit, DecodeError> {
    let conn = artifact::open_read_only(path)?;
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut content = String::new();
    let mut unit = ReportUnit::new(item.name.clone(), SQLITE_TABLES);
    for name in names {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", name.replace('"', "\"\"")),
            [],
            |row| row.get(0),
        )?;
        content.push_str(&format!("{name}\t{count}\n"));
        unit.add(attr::TABLE, name);
    }
    Ok(unit.with_content(content.into_bytes()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportStats {
    pub chats: usize,
    pub fragments: usize,
    pub messages: usize,
}

/// Emits chat and message units for one database.
///
/// Display names are memoized for the lifetime of the report.
pub struct ChatReport<'a> {
    sink: &'a dyn ReportSink,
    renderer: &'a dyn ChatRenderer,
    contacts: &'a ContactsDirectory,
    account: &'a Account,
    extract_messages: bool,
    names: HashMap<String, String>,
    virtual_id: usize,
}

impl<'a> ChatReport<'a> {
    pub fn new(
        sink: &'a dyn ReportSink,
        renderer: &'a dyn ChatRenderer,
        contacts: &'a ContactsDirectory,
        account: &'a Account,
        extract_messages: bool,
    ) -> Self {
        Self {
            sink,
            renderer,
            contacts,
            account,
            extract_messages,
            names: HashMap::new(),
            virtual_id: 0,
        }
    }

    /// `full_id` when the name is missing or just repeats the id, otherwise
    /// `name (full_id)`.
    pub fn format_contact(&mut self, who: &dyn Participant) -> String {
        if let Some(cached) = self.names.get(who.id()) {
            return cached.clone();
        }
        let formatted = match who.name().map(str::trim) {
            Some(name) if name != who.id() => format!("{name} ({})", who.full_id()),
            _ => who.full_id(),
        };
        self.names.insert(who.id().to_string(), formatted.clone());
        formatted
    }

    pub fn emit_chat(&mut self, chat: &Chat, stats: &mut ReportStats) -> Result<(), DecodeError> {
        let fragments = self.renderer.render(chat, self.contacts, self.account)?;
        let split = fragments.len() > 1;
        stats.chats += 1;

        for (frag, fragment) in fragments.into_iter().enumerate() {
            let subset = chat
                .messages
                .get(fragment.messages.clone())
                .unwrap_or_default();
            let title = if split {
                format!("{}_{frag}", chat.title)
            } else {
                chat.title.clone()
            };

            let mut unit = ReportUnit::new(title.clone(), CHAT).with_content(fragment.content);
            for m in subset {
                if let Some(q) = m.media_query()
                    && m.media.size > 2
                {
                    unit.add(attr::LINKED_ITEMS, q);
                    if m.from_me {
                        unit.add(attr::SHARED_HASHES, q);
                    }
                }
            }
            if !self.extract_messages {
                for m in subset {
                    if m.message_type.is_location() && m.latitude != 0.0 && m.longitude != 0.0 {
                        unit.add(attr::LOCATIONS, format!("{};{}", m.latitude, m.longitude));
                    }
                }
            }
            unit.set(attr::VIRTUAL_ID, self.virtual_id.to_string());
            unit.set(attr::DECODED_DATA, "true");
            if self.extract_messages && !subset.is_empty() {
                unit.set(attr::HAS_CHILD, "true");
            }
            let local = self.format_contact(self.account);
            unit.add(attr::PARTICIPANTS, local);
            if chat.is_group_chat() {
                for member in &chat.group_members {
                    let m = self.format_contact(member);
                    unit.add(attr::PARTICIPANTS, m);
                }
                unit.add(attr::GROUP_ID, chat.remote.full_id());
            } else {
                let r = self.format_contact(&chat.remote);
                unit.add(attr::PARTICIPANTS, r);
            }
            self.sink.emit(unit);
            stats.fragments += 1;

            if self.extract_messages {
                stats.messages += self.emit_messages(&title, chat, subset);
            }
            self.virtual_id += 1;
        }
        Ok(())
    }

    fn emit_messages(&mut self, chat_title: &str, chat: &Chat, messages: &[Message]) -> usize {
        let mut emitted = 0;
        for (n, m) in messages.iter().enumerate() {
            let mut unit = ReportUnit::new(format!("{chat_title}_message_{n}"), MESSAGE);
            unit.set(attr::PARENT_VIRTUAL_ID, self.virtual_id.to_string());
            unit.set(attr::PARENT_VIEW_POSITION, m.id.to_string());
            unit.set(attr::USER_ACCOUNT_TYPE, ACCOUNT_TYPE);
            unit.set_opt(attr::MESSAGE_DATE, format_timestamp(m.timestamp));
            unit.set(attr::DECODED_DATA, "true");

            if !m.is_system_message() {
                self.fill_from_to(&mut unit, chat, m);
            }
            unit.set_opt(attr::MESSAGE_BODY, m.body.clone());
            unit.set_opt(attr::URL, m.url.clone());
            unit.set_opt(attr::MEDIA_NAME, m.media.name.clone());
            unit.set_opt(attr::MEDIA_MIME, m.media.mime.clone());
            if m.media.size != 0 {
                unit.set(attr::MEDIA_SIZE, m.media.size.to_string());
            }
            if let Some(q) = m.media_query() {
                unit.content_type = Some(ATTACHMENT.to_string());
                unit.set(attr::LINKED_ITEMS, q);
            }
            if m.message_type.is_location() {
                unit.set(attr::LOCATIONS, format!("{};{}", m.latitude, m.longitude));
            }
            if let Some(status) = m.status {
                unit.set(attr::MESSAGE_STATUS, status.to_string());
            }
            if m.is_call() {
                unit.content_type = Some(CALL.to_string());
                unit.set(attr::DURATION, format_mm_ss(m.media.duration));
            }
            if unit.get(attr::MESSAGE_BODY).is_none() {
                unit.set(
                    attr::MESSAGE_BODY,
                    format!("{MESSAGE_TYPE_PREFIX}{}", m.message_type.as_str()),
                );
            }
            if let Some(caption) = &m.media.caption {
                unit.add(attr::MESSAGE_BODY, caption.clone());
            }

            if m.vcards.is_empty() {
                self.sink.emit(unit);
            } else {
                unit.content_type = Some(VCARD.to_string());
                for vcard in &m.vcards {
                    self.sink
                        .emit(unit.clone().with_content(vcard.as_bytes().to_vec()));
                }
            }
            emitted += 1;
        }
        debug!(chat = %chat.title, emitted, "emitted message units");
        emitted
    }

    fn fill_from_to(&mut self, unit: &mut ReportUnit, chat: &Chat, m: &Message) {
        let local = self.format_contact(self.account);
        let remote = match m.remote_resource.as_deref() {
            Some(id) => Some(match self.contacts.get(id) {
                Some(contact) => self.format_contact(&contact),
                None => id.to_string(),
            }),
            None if !chat.is_group_chat() => Some(self.format_contact(&chat.remote)),
            None => None,
        };

        let (from, to_single) = if m.from_me {
            (Some(local.clone()), remote.clone())
        } else {
            (remote.clone(), Some(local.clone()))
        };
        if let Some(from) = &from {
            unit.set(attr::MESSAGE_FROM, from.clone());
        }
        if chat.is_group_chat() {
            for member in &chat.group_members {
                let formatted = self.format_contact(member);
                if from.as_deref() != Some(formatted.as_str()) {
                    unit.add(attr::MESSAGE_TO, formatted);
                }
            }
        } else if let Some(to) = to_single {
            unit.add(attr::MESSAGE_TO, to);
        }
    }
}
