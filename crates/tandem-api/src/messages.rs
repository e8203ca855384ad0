use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use tandem_db::models::MessageRow;
use tandem_types::api::{
    Claims, EditMessageRequest, ForwardMessageRequest, ForwardMessageResponse, SendMessageRequest,
    StatusResponse,
};
use tandem_types::events::ChatEvent;
use tandem_types::models::Message;

use crate::access::{is_contact_of, require_member, require_sender};
use crate::auth::{AppState, AppStateInner};
use crate::blocking;
use crate::chats::create_direct_chat;
use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiPath};
use crate::views;

pub async fn send(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message =
        blocking(&state, move |s| send_message(s, claims.sub, req.chat_id, &req.body)).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn update(
    State(state): State<AppState>,
    ApiPath(message_id): ApiPath<i64>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<EditMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message =
        blocking(&state, move |s| edit_message(s, message_id, claims.sub, &req.body)).await?;
    Ok(Json(message))
}

pub async fn destroy(
    State(state): State<AppState>,
    ApiPath(message_id): ApiPath<i64>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let status = blocking(&state, move |s| delete_message(s, message_id, claims.sub)).await?;
    Ok(Json(status))
}

/// Forwards into `chat_id`, or into the direct chat with `recipient_id`.
/// Exactly one of the two must be given.
pub async fn forward(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<ForwardMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = blocking(&state, move |s| match (req.chat_id, req.recipient_id) {
        (Some(chat_id), None) => {
            let message = forward_message(s, claims.sub, chat_id, req.message_id)?;
            Ok(ForwardMessageResponse { message, chat_id })
        }
        (None, Some(recipient_id)) => {
            let (message, chat_id) =
                forward_to_recipient(s, claims.sub, recipient_id, req.message_id)?;
            Ok(ForwardMessageResponse { message, chat_id })
        }
        _ => Err(ApiError::validation("Provide either a chat or a recipient to forward to.")),
    })
    .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// Trims the body and checks it against the configured length bounds.
fn validate_body<'a>(state: &AppStateInner, body: &'a str) -> ApiResult<&'a str> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::validation("The body field is required."));
    }
    let max = state.limits.max_message_len;
    if body.chars().count() > max {
        return Err(ApiError::validation(format!(
            "The body may not be greater than {} characters.",
            max
        )));
    }
    Ok(body)
}

fn load_message(state: &AppStateInner, message_id: i64) -> ApiResult<MessageRow> {
    state
        .db
        .get_message(message_id)?
        .ok_or_else(|| ApiError::not_found("Message"))
}

/// Fans the event out after the write has committed. Delivery is
/// best-effort and never fails the caller.
fn fan_out(state: &AppStateInner, event: ChatEvent, actor_id: i64) {
    state.dispatcher.publish(event, actor_id);
}

fn insert_and_announce(
    state: &AppStateInner,
    user_id: i64,
    chat_id: i64,
    body: &str,
    forwarded_message_id: Option<i64>,
) -> ApiResult<Message> {
    let message_id = state.db.insert_message(chat_id, user_id, body, forwarded_message_id)?;
    let row = state
        .db
        .get_message(message_id)?
        .ok_or_else(|| anyhow::anyhow!("message {} vanished after insert", message_id))?;

    fan_out(
        state,
        ChatEvent::MessageSent {
            message: views::message(&row, None),
        },
        user_id,
    );

    Ok(views::message(&row, Some(user_id)))
}

pub fn send_message(
    state: &AppStateInner,
    user_id: i64,
    chat_id: i64,
    body: &str,
) -> ApiResult<Message> {
    require_member(&state.db, chat_id, user_id)?;
    let body = validate_body(state, body)?;

    insert_and_announce(state, user_id, chat_id, body, None)
}

/// Only the sender may edit. Stamps `edited_at`.
pub fn edit_message(
    state: &AppStateInner,
    message_id: i64,
    user_id: i64,
    body: &str,
) -> ApiResult<Message> {
    let existing = load_message(state, message_id)?;
    require_sender(&existing, user_id)?;
    let body = validate_body(state, body)?;

    state.db.update_message_body(message_id, body)?;
    let row = load_message(state, message_id)?;

    fan_out(
        state,
        ChatEvent::MessageUpdated {
            message: views::message(&row, None),
        },
        user_id,
    );

    Ok(views::message(&row, Some(user_id)))
}

pub fn delete_message(state: &AppStateInner, message_id: i64, user_id: i64) -> ApiResult<StatusResponse> {
    let existing = load_message(state, message_id)?;
    require_sender(&existing, user_id)?;

    if !state.db.delete_message(message_id)? {
        return Err(ApiError::not_found("Message"));
    }
    info!("User {} deleted message {} in chat {}", user_id, message_id, existing.chat_id);

    fan_out(
        state,
        ChatEvent::MessageDeleted {
            chat_id: existing.chat_id,
            message_id,
        },
        user_id,
    );

    Ok(StatusResponse::deleted())
}

/// Copies the source body into `target_chat_id` as a new message by
/// `user_id` that references the source. Only membership of the target chat
/// is required.
pub fn forward_message(
    state: &AppStateInner,
    user_id: i64,
    target_chat_id: i64,
    source_message_id: i64,
) -> ApiResult<Message> {
    require_member(&state.db, target_chat_id, user_id)?;
    let source = load_message(state, source_message_id)?;

    insert_and_announce(state, user_id, target_chat_id, &source.body, Some(source.id))
}

/// Forwards into the direct chat with `recipient_id`, creating it when
/// needed. Returns the new message and the chat it landed in.
pub fn forward_to_recipient(
    state: &AppStateInner,
    user_id: i64,
    recipient_id: i64,
    source_message_id: i64,
) -> ApiResult<(Message, i64)> {
    if recipient_id == user_id {
        return Err(ApiError::validation("You cannot forward a message to yourself."));
    }
    if !is_contact_of(&state.db, user_id, recipient_id)? {
        return Err(ApiError::validation("Messages can only be forwarded to contacts."));
    }
    load_message(state, source_message_id)?;

    let (chat, _) = create_direct_chat(state, user_id, recipient_id)?;
    let message = forward_message(state, user_id, chat.id, source_message_id)?;
    Ok((message, chat.id))
}
