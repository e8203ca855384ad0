use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};

use tandem_db::models::ProfileUpdate;
use tandem_types::api::{Claims, UpdateProfileRequest, UserSearchQuery};
use tandem_types::models::{Profile, PublicUser};

use crate::auth::{AppState, AppStateInner};
use crate::blocking;
use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiQuery};
use crate::views;

const MAX_FIELD_LEN: usize = 255;
const MIN_SEARCH_LEN: usize = 2;
const SEARCH_LIMIT: u32 = 20;

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let profile = blocking(&state, move |s| get_profile(s, claims.sub)).await?;
    Ok(Json(profile))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> ApiResult<impl IntoResponse> {
    let profile = blocking(&state, move |s| update_profile(s, claims.sub, &req)).await?;
    Ok(Json(profile))
}

pub async fn search(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiQuery(query): ApiQuery<UserSearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let users = blocking(&state, move |s| search_users(s, claims.sub, &query.query)).await?;
    Ok(Json(users))
}

pub(crate) fn validate_name(raw: &str) -> ApiResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::validation("The name field is required."));
    }
    if name.chars().count() > MAX_FIELD_LEN {
        return Err(ApiError::validation("The name may not be greater than 255 characters."));
    }
    Ok(name.to_string())
}

/// Trimmed and lowercased; emails are stored in this form.
pub(crate) fn normalize_email(raw: &str) -> ApiResult<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::validation("The email must be a valid email address."));
    }
    if email.chars().count() > MAX_FIELD_LEN {
        return Err(ApiError::validation("The email may not be greater than 255 characters."));
    }
    Ok(email)
}

/// Blank nicknames count as absent.
pub(crate) fn validate_nickname(raw: Option<&str>) -> ApiResult<Option<String>> {
    let Some(nickname) = raw.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if nickname.chars().count() > MAX_FIELD_LEN {
        return Err(ApiError::validation("The nickname may not be greater than 255 characters."));
    }
    Ok(Some(nickname.to_string()))
}

pub fn get_profile(state: &AppStateInner, user_id: i64) -> ApiResult<Profile> {
    let user = state
        .db
        .get_user_by_id(user_id)?
        .ok_or_else(|| ApiError::not_found("User"))?;
    Ok(views::profile(&user))
}

/// Edits the caller's profile. Hiding the email requires a nickname, either
/// supplied now or already stored.
pub fn update_profile(state: &AppStateInner, user_id: i64, req: &UpdateProfileRequest) -> ApiResult<Profile> {
    let current = state
        .db
        .get_user_by_id(user_id)?
        .ok_or_else(|| ApiError::not_found("User"))?;

    let name = validate_name(&req.name)?;
    let email = normalize_email(&req.email)?;
    let nickname = validate_nickname(req.nickname.as_deref())?;

    if state.db.email_taken(&email, Some(user_id))? {
        return Err(ApiError::validation("The email has already been taken."));
    }
    if let Some(nickname) = nickname.as_deref() {
        if state.db.nickname_taken(nickname, Some(user_id))? {
            return Err(ApiError::validation("The nickname has already been taken."));
        }
    }

    let hide_email = req.hide_email.unwrap_or(current.hide_email);
    if hide_email && nickname.is_none() && current.nickname.is_none() {
        return Err(ApiError::validation("A nickname is required to hide your email."));
    }

    let avatar_path = req
        .avatar_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    state
        .db
        .update_profile(
            user_id,
            &ProfileUpdate {
                name,
                email,
                nickname,
                hide_email: req.hide_email,
                avatar_path,
            },
        )
        .map_err(|e| {
            ApiError::from_write(e, || ApiError::validation("The email or nickname has already been taken."))
        })?;

    get_profile(state, user_id)
}

/// Other users matching `query` by nickname, or by email when it is visible.
pub fn search_users(state: &AppStateInner, user_id: i64, query: &str) -> ApiResult<Vec<PublicUser>> {
    let term = query.trim().to_lowercase();
    let len = term.chars().count();
    if len < MIN_SEARCH_LEN {
        return Err(ApiError::validation("The query must be at least 2 characters."));
    }
    if len > MAX_FIELD_LEN {
        return Err(ApiError::validation("The query may not be greater than 255 characters."));
    }

    let rows = state.db.search_users(&term, user_id, SEARCH_LIMIT)?;
    Ok(rows.iter().map(|row| views::public_user(row, Some(user_id))).collect())
}
