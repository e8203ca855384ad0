use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a user inside a chat roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

/// A user as seen by somebody else. `email` is `None` when the user hides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: i64,
    pub name: String,
    pub nickname: Option<String>,
    pub email: Option<String>,
    pub avatar_path: Option<String>,
}

/// The caller's own account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub nickname: Option<String>,
    pub email: String,
    pub hide_email: bool,
    pub avatar_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub user_id: i64,
    pub alias: Option<String>,
    pub contact: PublicUser,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user: PublicUser,
    pub role: Role,
    pub notifications_enabled: bool,
}

/// Snapshot of the message a forward points at. The sender is not expanded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedMessage {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub body: String,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub sender: PublicUser,
    pub body: String,
    pub forwarded_message_id: Option<i64>,
    pub forwarded_message: Option<ForwardedMessage>,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Chat list entry: roster plus the latest message only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: i64,
    pub title: Option<String>,
    pub is_group: bool,
    pub created_by: i64,
    pub notifications_enabled: bool,
    pub members: Vec<Member>,
    pub last_message: Option<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full chat with its message history, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDetail {
    pub id: i64,
    pub title: Option<String>,
    pub is_group: bool,
    pub created_by: i64,
    pub notifications_enabled: bool,
    pub members: Vec<Member>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
