use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use tandem_types::api::ErrorBody;

pub type ApiResult<T> = Result<T, ApiError>;

/// Failures surfaced to the caller as `{ "message": ... }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthenticated.")]
    Unauthorized,

    /// Caller lacks the membership, ownership or authorship the operation needs.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Business-rule violation.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    /// Request that could not be read: bad JSON syntax, wrong content type,
    /// or a path segment of the wrong type.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn forbidden() -> Self {
        Self::Forbidden("Access denied.".to_string())
    }

    pub fn not_found(what: &str) -> Self {
        Self::NotFound(format!("{} not found.", what))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// For writes guarded by an earlier uniqueness check: a constraint failure
    /// means another request won the race and is reported as `taken`.
    pub fn from_write(err: anyhow::Error, taken: impl FnOnce() -> ApiError) -> Self {
        if tandem_db::is_constraint_violation(&err) {
            taken()
        } else {
            Self::Internal(err)
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Internal(e) => {
                error!("Internal error: {:#}", e);
                "Internal server error.".to_string()
            }
            other => other.to_string(),
        };

        (self.status_code(), Json(ErrorBody { message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::forbidden().status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("Chat").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::validation("x").status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ApiError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("disk on fire")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let response = ApiError::Internal(anyhow::anyhow!("disk on fire")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::not_found("Chat").to_string(), "Chat not found.");
    }
}
