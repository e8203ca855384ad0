//! Relationship checks guarding every chat, contact and message operation.
//! Each is a single existence lookup.

use tandem_db::Database;
use tandem_db::models::{ChatRow, ContactRow, MessageRow};

use crate::error::{ApiError, ApiResult};

pub fn is_member(db: &Database, chat_id: i64, user_id: i64) -> ApiResult<bool> {
    Ok(db.is_member(chat_id, user_id)?)
}

pub fn is_owner(contact_owner_id: i64, contact: &ContactRow) -> bool {
    contact.user_id == contact_owner_id
}

pub fn is_contact_of(db: &Database, owner_id: i64, target_id: i64) -> ApiResult<bool> {
    Ok(db.is_contact(owner_id, target_id)?)
}

/// Loads the chat and fails unless `user_id` is on its roster.
pub fn require_member(db: &Database, chat_id: i64, user_id: i64) -> ApiResult<ChatRow> {
    let chat = db.get_chat(chat_id)?.ok_or_else(|| ApiError::not_found("Chat"))?;
    if !is_member(db, chat_id, user_id)? {
        return Err(ApiError::forbidden());
    }
    Ok(chat)
}

pub fn require_sender(message: &MessageRow, user_id: i64) -> ApiResult<()> {
    if message.user_id != user_id {
        return Err(ApiError::forbidden());
    }
    Ok(())
}

pub fn require_contact_owner(contact: &ContactRow, user_id: i64) -> ApiResult<()> {
    if !is_owner(user_id, contact) {
        return Err(ApiError::forbidden());
    }
    Ok(())
}
