use serde::{Deserialize, Serialize};

use crate::models::Message;

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub name: String,
    pub exp: usize,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn deleted() -> Self {
        Self {
            status: "deleted".to_string(),
        }
    }
}

// -- Auth --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: i64,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: i64,
    pub name: String,
    pub nickname: Option<String>,
    pub token: String,
}

// -- Users --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub hide_email: Option<bool>,
    #[serde(default)]
    pub avatar_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserSearchQuery {
    pub query: String,
}

// -- Contacts --

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddContactRequest {
    #[serde(default)]
    pub contact_user_id: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

// -- Chats --

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChatRequest {
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub title: Option<String>,
    /// Other participant of a direct chat.
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Members of a group chat; the creator is added implicitly.
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationPreferenceRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationPreferenceResponse {
    pub chat_id: i64,
    pub notifications_enabled: bool,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub chat_id: i64,
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub body: String,
}

/// Exactly one of `chat_id` (canonical) or `recipient_id` selects the target.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardMessageRequest {
    pub message_id: i64,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub recipient_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardMessageResponse {
    pub message: Message,
    pub chat_id: i64,
}
