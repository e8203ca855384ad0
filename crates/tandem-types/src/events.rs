use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Private channel carrying the realtime events of one chat, written `chat.{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey {
    chat_id: i64,
}

impl ChannelKey {
    pub fn chat(chat_id: i64) -> Self {
        Self { chat_id }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat.{}", self.chat_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidChannelKey(pub String);

impl fmt::Display for InvalidChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid channel key '{}'", self.0)
    }
}

impl std::error::Error for InvalidChannelKey {}

impl FromStr for ChannelKey {
    type Err = InvalidChannelKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("chat.")
            .and_then(|id| id.parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(Self::chat)
            .ok_or_else(|| InvalidChannelKey(s.to_string()))
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = InvalidChannelKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.to_string()
    }
}

/// Message mutations fanned out to chat members.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ChatEvent {
    MessageSent { message: Message },
    MessageUpdated { message: Message },
    /// The body is gone, so only identifiers travel.
    MessageDeleted { chat_id: i64, message_id: i64 },
}

impl ChatEvent {
    pub fn chat_id(&self) -> i64 {
        match self {
            Self::MessageSent { message } | Self::MessageUpdated { message } => message.chat_id,
            Self::MessageDeleted { chat_id, .. } => *chat_id,
        }
    }

    pub fn channel(&self) -> ChannelKey {
        ChannelKey::chat(self.chat_id())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageSent { .. } => "MessageSent",
            Self::MessageUpdated { .. } => "MessageUpdated",
            Self::MessageDeleted { .. } => "MessageDeleted",
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: i64 },

    /// Subscription to a chat channel accepted
    Subscribed { channel: ChannelKey },

    /// Caller is not a member of the chat, or the key is malformed
    SubscriptionDenied { channel: String },

    /// A chat event delivered on a subscribed channel
    Dispatch { channel: ChannelKey, event: ChatEvent },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Start receiving events of a chat channel, e.g. `chat.42`
    Subscribe { channel: String },

    Unsubscribe { channel: String },
}
