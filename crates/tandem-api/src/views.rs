//! Row -> API model conversion. `viewer` is the user the value is rendered
//! for; hidden emails are only shown to their owner.

use chrono::{DateTime, Utc};
use tracing::warn;

use tandem_db::models::{ContactRow, ForwardedRow, MemberRow, MessageRow, UserRow};
use tandem_db::parse_timestamp;
use tandem_types::models::{Contact, ForwardedMessage, Member, Message, Profile, PublicUser};

fn timestamp(raw: &str, what: &str, id: i64) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(|| {
        warn!("Corrupt {} '{}' on row {}", what, raw, id);
        DateTime::default()
    })
}

fn optional_timestamp(raw: Option<&str>, what: &str, id: i64) -> Option<DateTime<Utc>> {
    raw.map(|r| timestamp(r, what, id))
}

pub fn chat_timestamp(raw: &str, chat_id: i64) -> DateTime<Utc> {
    timestamp(raw, "chat timestamp", chat_id)
}

pub fn public_user(row: &UserRow, viewer: Option<i64>) -> PublicUser {
    let email_visible = !row.hide_email || viewer == Some(row.id);
    PublicUser {
        id: row.id,
        name: row.name.clone(),
        nickname: row.nickname.clone(),
        email: email_visible.then(|| row.email.clone()),
        avatar_path: row.avatar_path.clone(),
    }
}

pub fn profile(row: &UserRow) -> Profile {
    Profile {
        id: row.id,
        name: row.name.clone(),
        nickname: row.nickname.clone(),
        email: row.email.clone(),
        hide_email: row.hide_email,
        avatar_path: row.avatar_path.clone(),
        created_at: timestamp(&row.created_at, "created_at", row.id),
    }
}

pub fn contact(row: &ContactRow, viewer: Option<i64>) -> Contact {
    Contact {
        id: row.id,
        user_id: row.user_id,
        alias: row.alias.clone(),
        contact: public_user(&row.contact, viewer),
        created_at: timestamp(&row.created_at, "created_at", row.id),
    }
}

pub fn member(row: &MemberRow, viewer: Option<i64>) -> Member {
    Member {
        user: public_user(&row.user, viewer),
        role: row.role,
        notifications_enabled: row.notifications_enabled,
    }
}

fn forwarded(row: &ForwardedRow) -> ForwardedMessage {
    ForwardedMessage {
        id: row.id,
        chat_id: row.chat_id,
        sender_id: row.user_id,
        body: row.body.clone(),
        edited_at: optional_timestamp(row.edited_at.as_deref(), "edited_at", row.id),
        created_at: timestamp(&row.created_at, "created_at", row.id),
    }
}

pub fn message(row: &MessageRow, viewer: Option<i64>) -> Message {
    let forwarded_message = row.forwarded.as_ref().map(forwarded);
    Message {
        id: row.id,
        chat_id: row.chat_id,
        sender_id: row.user_id,
        sender: public_user(&row.sender, viewer),
        body: row.body.clone(),
        // A reference whose source is gone reads as absent.
        forwarded_message_id: forwarded_message.as_ref().map(|f| f.id),
        forwarded_message,
        edited_at: optional_timestamp(row.edited_at.as_deref(), "edited_at", row.id),
        created_at: timestamp(&row.created_at, "created_at", row.id),
    }
}
