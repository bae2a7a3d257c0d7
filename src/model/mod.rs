//! Conversation model shared by every stage.

pub mod types;

pub use types::{
    Account, Chat, Contact, ContactsDirectory, Item, MediaDescriptor, Message, MessageStatus,
    MessageType,
};
