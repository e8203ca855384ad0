use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use tandem_types::api::{AddContactRequest, Claims, StatusResponse};
use tandem_types::models::Contact;

use crate::access::require_contact_owner;
use crate::auth::{AppState, AppStateInner};
use crate::blocking;
use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiPath};
use crate::views;

const MAX_ALIAS_LEN: usize = 255;

pub async fn index(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let contacts = blocking(&state, move |s| list_contacts(s, claims.sub)).await?;
    Ok(Json(contacts))
}

pub async fn store(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<AddContactRequest>,
) -> ApiResult<impl IntoResponse> {
    let contact = blocking(&state, move |s| add_contact(s, claims.sub, &req)).await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

pub async fn destroy(
    State(state): State<AppState>,
    ApiPath(contact_id): ApiPath<i64>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let status = blocking(&state, move |s| remove_contact(s, contact_id, claims.sub)).await?;
    Ok(Json(status))
}

pub fn list_contacts(state: &AppStateInner, user_id: i64) -> ApiResult<Vec<Contact>> {
    let rows = state.db.list_contacts(user_id)?;
    Ok(rows.iter().map(|row| views::contact(row, Some(user_id))).collect())
}

/// Resolves the target by id first, then by email, and creates the contact or
/// refreshes its alias.
pub fn add_contact(state: &AppStateInner, user_id: i64, req: &AddContactRequest) -> ApiResult<Contact> {
    let alias = req.alias.as_deref().map(str::trim).filter(|a| !a.is_empty());
    if alias.is_some_and(|a| a.chars().count() > MAX_ALIAS_LEN) {
        return Err(ApiError::validation("The alias may not be greater than 255 characters."));
    }

    let mut target = match req.contact_user_id {
        Some(id) => state.db.get_user_by_id(id)?,
        None => None,
    };

    if target.is_none() {
        if let Some(email) = req.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            target = state.db.find_contactable_by_email(&email.to_lowercase())?;
        }
    }

    let target = target.ok_or_else(|| ApiError::not_found("Contact"))?;

    if target.id == user_id {
        return Err(ApiError::validation("You cannot add yourself as a contact."));
    }

    let contact_id = state.db.upsert_contact(user_id, target.id, alias)?;
    let row = state
        .db
        .get_contact(contact_id)?
        .ok_or_else(|| anyhow::anyhow!("contact {} vanished after upsert", contact_id))?;

    info!("User {} saved contact {} -> {}", user_id, contact_id, target.id);
    Ok(views::contact(&row, Some(user_id)))
}

pub fn remove_contact(state: &AppStateInner, contact_id: i64, user_id: i64) -> ApiResult<StatusResponse> {
    let contact = state
        .db
        .get_contact(contact_id)?
        .ok_or_else(|| ApiError::not_found("Contact"))?;

    require_contact_owner(&contact, user_id)?;

    state.db.delete_contact(contact_id)?;
    Ok(StatusResponse::deleted())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn by_id(id: i64, alias: Option<&str>) -> AddContactRequest {
        AddContactRequest {
            contact_user_id: Some(id),
            alias: alias.map(str::to_string),
            ..Default::default()
        }
    }

    fn by_email(email: &str) -> AddContactRequest {
        AddContactRequest {
            email: Some(email.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn re_adding_updates_alias_instead_of_duplicating() {
        let fx = Fixture::new();
        let a = fx.user("a");
        let b = fx.user("b");

        let first = add_contact(&fx.state, a, &by_id(b, None)).unwrap();
        let second = add_contact(&fx.state, a, &by_id(b, Some("Bee"))).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.alias.as_deref(), Some("Bee"));
        assert_eq!(second.contact.id, b);
        assert_eq!(list_contacts(&fx.state, a).unwrap().len(), 1);
    }

    #[test]
    fn resolves_by_email() {
        let fx = Fixture::new();
        let a = fx.user("a");
        let b = fx.user("b");

        let contact = add_contact(&fx.state, a, &by_email("B@Example.com")).unwrap();
        assert_eq!(contact.contact.id, b);
    }

    #[test]
    fn email_of_hiding_user_with_nickname_is_not_found() {
        let fx = Fixture::new();
        let a = fx.user("a");
        let b = fx.user("b");
        fx.state
            .db
            .with_conn(|conn| {
                conn.execute("UPDATE users SET hide_email = 1 WHERE id = ?1", [b])?;
                Ok(())
            })
            .unwrap();

        let err = add_contact(&fx.state, a, &by_email("b@example.com")).unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        // Still reachable by id.
        assert!(add_contact(&fx.state, a, &by_id(b, None)).is_ok());
    }

    #[test]
    fn unknown_id_falls_back_to_email() {
        let fx = Fixture::new();
        let a = fx.user("a");
        let b = fx.user("b");

        let req = AddContactRequest {
            contact_user_id: Some(9999),
            email: Some("b@example.com".into()),
            alias: None,
        };
        assert_eq!(add_contact(&fx.state, a, &req).unwrap().contact.id, b);
    }

    #[test]
    fn unresolved_target_is_not_found() {
        let fx = Fixture::new();
        let a = fx.user("a");

        assert!(matches!(add_contact(&fx.state, a, &by_id(9999, None)), Err(ApiError::NotFound(_))));
        assert!(matches!(add_contact(&fx.state, a, &AddContactRequest::default()), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn cannot_add_self() {
        let fx = Fixture::new();
        let a = fx.user("a");

        assert!(matches!(add_contact(&fx.state, a, &by_id(a, None)), Err(ApiError::Validation(_))));
    }

    #[test]
    fn only_owner_may_remove() {
        let fx = Fixture::new();
        let a = fx.user("a");
        let b = fx.user("b");
        let contact = add_contact(&fx.state, a, &by_id(b, None)).unwrap();

        assert!(matches!(remove_contact(&fx.state, contact.id, b), Err(ApiError::Forbidden(_))));

        let status = remove_contact(&fx.state, contact.id, a).unwrap();
        assert_eq!(status.status, "deleted");
        assert!(list_contacts(&fx.state, a).unwrap().is_empty());
        assert!(matches!(remove_contact(&fx.state, contact.id, a), Err(ApiError::NotFound(_))));
    }
}
