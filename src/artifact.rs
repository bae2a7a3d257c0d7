//! Artifact kinds, source platform variants and the decoder contract.
//!
//! Decoding raw rows out of the messenger databases is not done here; each
//! platform supplies a [`SourceDecoder`]. This module only picks the right
//! decoder for an artifact and opens the database it reads from.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OpenFlags};

use crate::error::DecodeError;
use crate::model::{Account, Chat, ContactsDirectory, Item};

pub const ACCOUNT_XML: &str = "application/x-whatsapp-user-xml";
pub const ACCOUNT_PLIST: &str = "application/x-whatsapp-user-plist";
pub const MSG_STORE: &str = "application/x-whatsapp-db";
/// A message store that already went through the registration stage.
pub const MSG_STORE_READY: &str = "application/x-whatsapp-db-f";
pub const WA_DB: &str = "application/x-whatsapp-wadb";
pub const CHAT_STORAGE: &str = "application/x-whatsapp-chatstorage";
pub const CONTACTS_V2: &str = "application/x-whatsapp-contactsv2";

pub const ACCOUNT: &str = "application/x-whatsapp-account";
pub const CHAT: &str = "application/x-whatsapp-chat";
pub const CONTACT: &str = "contact/x-whatsapp-contact";
pub const MESSAGE: &str = "message/x-whatsapp-message";
pub const ATTACHMENT: &str = "message/x-whatsapp-attachment";
pub const CALL: &str = "call/x-whatsapp-call";
pub const VCARD: &str = "text/x-vcard";
pub const SQLITE_TABLES: &str = "application/x-sqlite-tables";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    AccountXml,
    AccountPlist,
    MessageStore,
    MessageStoreReady,
    ContactsDb,
    ChatStorage,
    ContactsV2,
}

impl ArtifactKind {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            ACCOUNT_XML => Some(Self::AccountXml),
            ACCOUNT_PLIST => Some(Self::AccountPlist),
            MSG_STORE => Some(Self::MessageStore),
            MSG_STORE_READY => Some(Self::MessageStoreReady),
            WA_DB => Some(Self::ContactsDb),
            CHAT_STORAGE => Some(Self::ChatStorage),
            CONTACTS_V2 => Some(Self::ContactsV2),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::AccountXml => ACCOUNT_XML,
            Self::AccountPlist => ACCOUNT_PLIST,
            Self::MessageStore => MSG_STORE,
            Self::MessageStoreReady => MSG_STORE_READY,
            Self::ContactsDb => WA_DB,
            Self::ChatStorage => CHAT_STORAGE,
            Self::ContactsV2 => CONTACTS_V2,
        }
    }

    pub fn variant(&self) -> SourceVariant {
        match self {
            Self::AccountXml | Self::MessageStore | Self::MessageStoreReady | Self::ContactsDb => {
                SourceVariant::Android
            }
            Self::AccountPlist | Self::ChatStorage | Self::ContactsV2 => SourceVariant::Ios,
        }
    }

    pub fn all() -> &'static [ArtifactKind] {
        &[
            Self::AccountXml,
            Self::AccountPlist,
            Self::MessageStore,
            Self::MessageStoreReady,
            Self::ContactsDb,
            Self::ChatStorage,
            Self::ContactsV2,
        ]
    }
}

/// Platform-specific decoding of messenger databases.
pub trait SourceDecoder: Send + Sync {
    fn decode_chats(
        &self,
        conn: &Connection,
        contacts: &ContactsDirectory,
        account: &Account,
    ) -> Result<Vec<Chat>, DecodeError>;

    fn decode_contacts(&self, conn: &Connection) -> Result<ContactsDirectory, DecodeError>;

    /// Decode an account configuration file (XML preferences or plist).
    fn decode_account(&self, bytes: &[u8]) -> Result<Account, DecodeError>;
}

/// One decoder per platform.
#[derive(Clone)]
pub struct Decoders {
    pub android: Arc<dyn SourceDecoder>,
    pub ios: Arc<dyn SourceDecoder>,
}

impl Decoders {
    pub fn new(android: Arc<dyn SourceDecoder>, ios: Arc<dyn SourceDecoder>) -> Self {
        Self { android, ios }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceVariant {
    Android,
    Ios,
}

impl SourceVariant {
    pub fn decoder<'a>(&self, decoders: &'a Decoders) -> &'a dyn SourceDecoder {
        match self {
            Self::Android => decoders.android.as_ref(),
            Self::Ios => decoders.ios.as_ref(),
        }
    }

    /// File name of the account configuration artifact on this platform.
    pub fn account_file_name(&self) -> &'static str {
        match self {
            Self::Android => "com.whatsapp_preferences.xml",
            Self::Ios => "group.net.whatsapp.WhatsApp.shared.plist",
        }
    }

    /// Content types of the contacts databases looked up next to a message store.
    pub fn contacts_content_types(&self) -> [&'static str; 2] {
        [WA_DB, CONTACTS_V2]
    }

    /// Open the artifact's database read-only.
    pub fn connection(&self, item: &Item) -> Result<Connection, DecodeError> {
        let path = item
            .local_path
            .as_deref()
            .ok_or_else(|| DecodeError::NoLocalCopy(item.path.clone()))?;
        open_read_only(path)
    }

    pub fn decode_chats(
        &self,
        decoders: &Decoders,
        item: &Item,
        contacts: &ContactsDirectory,
        account: &Account,
    ) -> Result<Vec<Chat>, DecodeError> {
        let conn = self.connection(item)?;
        self.decoder(decoders).decode_chats(&conn, contacts, account)
    }

    pub fn decode_contacts(
        &self,
        decoders: &Decoders,
        item: &Item,
    ) -> Result<ContactsDirectory, DecodeError> {
        let conn = self.connection(item)?;
        self.decoder(decoders).decode_contacts(&conn)
    }
}

pub fn open_read_only(path: &Path) -> Result<Connection, DecodeError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_round_trip_to_kinds() {
        for kind in ArtifactKind::all() {
            assert_eq!(
                ArtifactKind::from_content_type(kind.content_type()),
                Some(*kind)
            );
        }
        assert_eq!(ArtifactKind::from_content_type("image/jpeg"), None);
    }

    #[test]
    fn kinds_select_platform() {
        assert_eq!(ArtifactKind::MessageStore.variant(), SourceVariant::Android);
        assert_eq!(ArtifactKind::ChatStorage.variant(), SourceVariant::Ios);
        assert_eq!(
            SourceVariant::Ios.account_file_name(),
            "group.net.whatsapp.WhatsApp.shared.plist"
        );
    }

    #[test]
    fn connection_requires_local_copy() {
        let item = Item::new(1, "msgstore.db", "/data/msgstore.db");
        let err = SourceVariant::Android.connection(&item).unwrap_err();
        assert!(matches!(err, DecodeError::NoLocalCopy(_)));
    }
}
