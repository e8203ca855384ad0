use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use tandem_db::Database;
use tandem_db::models::{ChatRow, NewChat};
use tandem_types::api::{
    Claims, CreateChatRequest, NotificationPreferenceRequest, NotificationPreferenceResponse,
};
use tandem_types::models::{ChatDetail, ChatSummary, Role};

use crate::access::require_member;
use crate::auth::{AppState, AppStateInner};
use crate::blocking;
use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiPath};
use crate::views;

/// Title given to group chats created without one.
pub const DEFAULT_GROUP_TITLE: &str = "Группа";

const MAX_TITLE_LEN: usize = 255;

pub async fn index(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let chats = blocking(&state, move |s| list_chats_for_user(s, claims.sub)).await?;
    Ok(Json(chats))
}

pub async fn show(
    State(state): State<AppState>,
    ApiPath(chat_id): ApiPath<i64>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let chat = blocking(&state, move |s| get_chat(s, chat_id, claims.sub)).await?;
    Ok(Json(chat))
}

/// Creates a group chat when `is_group` is set, otherwise resolves the direct
/// chat with `user_id` (200 when it already existed, 201 when created).
pub async fn store(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<CreateChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let (chat, created) = blocking(&state, move |s| {
        if req.is_group {
            let chat = create_group_chat(s, claims.sub, req.title.as_deref(), &req.user_ids)?;
            return Ok((chat, true));
        }

        let other = req
            .user_id
            .ok_or_else(|| ApiError::validation("A user is required for a direct chat."))?;
        create_direct_chat(s, claims.sub, other)
    })
    .await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(chat)))
}

pub async fn update_notifications(
    State(state): State<AppState>,
    ApiPath(chat_id): ApiPath<i64>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<NotificationPreferenceRequest>,
) -> ApiResult<impl IntoResponse> {
    let response =
        blocking(&state, move |s| set_notification_preference(s, chat_id, claims.sub, req.enabled)).await?;
    Ok(Json(response))
}

/// Whether `for_user_id` wants notifications from the chat. Users without a
/// membership row get the default (`true`).
pub fn get_notification_preference(db: &Database, chat_id: i64, for_user_id: i64) -> ApiResult<bool> {
    Ok(db.notifications_enabled(chat_id, for_user_id)?.unwrap_or(true))
}

fn summarize(state: &AppStateInner, chat: ChatRow, viewer: i64) -> ApiResult<ChatSummary> {
    let members = state.db.chat_members(chat.id)?;
    let last_message = state.db.last_message(chat.id)?;
    let notifications_enabled = get_notification_preference(&state.db, chat.id, viewer)?;

    Ok(ChatSummary {
        id: chat.id,
        title: chat.title,
        is_group: chat.is_group,
        created_by: chat.created_by,
        notifications_enabled,
        members: members.iter().map(|m| views::member(m, Some(viewer))).collect(),
        last_message: last_message.as_ref().map(|m| views::message(m, Some(viewer))),
        created_at: views::chat_timestamp(&chat.created_at, chat.id),
        updated_at: views::chat_timestamp(&chat.updated_at, chat.id),
    })
}

/// Chats the user belongs to, each with its newest message, most recently
/// updated first.
pub fn list_chats_for_user(state: &AppStateInner, user_id: i64) -> ApiResult<Vec<ChatSummary>> {
    state
        .db
        .chats_for_user(user_id)?
        .into_iter()
        .map(|chat| summarize(state, chat, user_id))
        .collect()
}

pub fn get_chat(state: &AppStateInner, chat_id: i64, user_id: i64) -> ApiResult<ChatDetail> {
    let chat = require_member(&state.db, chat_id, user_id)?;

    let members = state.db.chat_members(chat.id)?;
    let messages = state.db.chat_messages(chat.id)?;
    let notifications_enabled = get_notification_preference(&state.db, chat.id, user_id)?;

    Ok(ChatDetail {
        id: chat.id,
        title: chat.title,
        is_group: chat.is_group,
        created_by: chat.created_by,
        notifications_enabled,
        members: members.iter().map(|m| views::member(m, Some(user_id))).collect(),
        messages: messages.iter().map(|m| views::message(m, Some(user_id))).collect(),
        created_at: views::chat_timestamp(&chat.created_at, chat.id),
        updated_at: views::chat_timestamp(&chat.updated_at, chat.id),
    })
}

/// Returns the existing two-member direct chat between the pair, or creates
/// it. The second value is `true` when a chat was created.
///
/// Lookup and insert are not atomic: two concurrent calls for a fresh pair
/// can both create a chat.
pub fn create_direct_chat(
    state: &AppStateInner,
    user_id: i64,
    other_user_id: i64,
) -> ApiResult<(ChatSummary, bool)> {
    if other_user_id == user_id {
        return Err(ApiError::validation("A direct chat needs another participant."));
    }
    if state.db.get_user_by_id(other_user_id)?.is_none() {
        return Err(ApiError::not_found("User"));
    }

    if let Some(existing) = state.db.find_direct_chat(user_id, other_user_id)? {
        return Ok((summarize(state, existing, user_id)?, false));
    }

    let chat_id = state.db.create_chat(&NewChat {
        title: None,
        is_group: false,
        created_by: user_id,
        members: vec![(user_id, Role::Owner), (other_user_id, Role::Member)],
    })?;
    info!("User {} opened direct chat {} with {}", user_id, chat_id, other_user_id);

    Ok((load_summary(state, chat_id, user_id)?, true))
}

/// Creates a group owned by `user_id`. Every other member must be one of the
/// creator's contacts; nothing is written otherwise.
pub fn create_group_chat(
    state: &AppStateInner,
    user_id: i64,
    title: Option<&str>,
    member_user_ids: &[i64],
) -> ApiResult<ChatSummary> {
    let title = title.map(str::trim).filter(|t| !t.is_empty()).unwrap_or(DEFAULT_GROUP_TITLE);
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::validation("The title may not be greater than 255 characters."));
    }

    let mut others: Vec<i64> = Vec::with_capacity(member_user_ids.len());
    for &id in member_user_ids {
        if id != user_id && !others.contains(&id) {
            others.push(id);
        }
    }

    let contacts = state.db.contact_ids_among(user_id, &others)?;
    if others.iter().any(|id| !contacts.contains(id)) {
        return Err(ApiError::validation("Only contacts can be added to a group."));
    }

    let mut members = Vec::with_capacity(others.len() + 1);
    members.push((user_id, Role::Owner));
    members.extend(others.iter().map(|&id| (id, Role::Member)));

    let chat_id = state.db.create_chat(&NewChat {
        title: Some(title.to_string()),
        is_group: true,
        created_by: user_id,
        members,
    })?;
    info!("User {} created group chat {} with {} member(s)", user_id, chat_id, others.len() + 1);

    load_summary(state, chat_id, user_id)
}

fn load_summary(state: &AppStateInner, chat_id: i64, viewer: i64) -> ApiResult<ChatSummary> {
    let chat = state
        .db
        .get_chat(chat_id)?
        .ok_or_else(|| anyhow::anyhow!("chat {} vanished after insert", chat_id))?;
    summarize(state, chat, viewer)
}

/// Updates the caller's own notification flag for the chat.
pub fn set_notification_preference(
    state: &AppStateInner,
    chat_id: i64,
    user_id: i64,
    enabled: bool,
) -> ApiResult<NotificationPreferenceResponse> {
    require_member(&state.db, chat_id, user_id)?;

    state.db.set_notifications_enabled(chat_id, user_id, enabled)?;

    Ok(NotificationPreferenceResponse {
        chat_id,
        notifications_enabled: enabled,
    })
}
