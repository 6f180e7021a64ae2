use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Document,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Document => "document",
            MessageKind::File => "file",
        }
    }

    /// Kind for a stored attachment, from its declared content type.
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.trim().to_ascii_lowercase();
        if content_type.starts_with("image/") {
            MessageKind::Image
        } else if content_type == "application/pdf" {
            MessageKind::Document
        } else {
            MessageKind::File
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "document" => Ok(MessageKind::Document),
            "file" => Ok(MessageKind::File),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size_bytes: u64,
}

/// One row of the append-only message log. `read` is the only field that
/// changes after creation, and only from `false` to `true`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub body: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    /// True if the message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: Uuid, b: Uuid) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// The other party of the conversation, seen from `user`.
    pub fn counterparty(&self, user: Uuid) -> Uuid {
        if self.sender_id == user {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

/// Unread messages addressed to one receiver, keyed by sender.
///
/// Always recomputed from the message log; never persisted or patched
/// incrementally.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UnreadIndex {
    pub by_sender: BTreeMap<Uuid, u64>,
}

impl UnreadIndex {
    pub fn total(&self) -> u64 {
        self.by_sender.values().sum()
    }

    pub fn from_sender(&self, sender_id: &Uuid) -> u64 {
        self.by_sender.get(sender_id).copied().unwrap_or(0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub email: String,
}

/// What the sender declares about a file before it is uploaded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConversationSummary {
    pub counterparty_id: Uuid,
    pub last_message: Message,
    pub unread_count: u64,
}
