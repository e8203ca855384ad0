use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::info;

use tandem_db::Database;
use tandem_gateway::dispatcher::Dispatcher;
use tandem_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::blocking;
use crate::error::{ApiError, ApiResult};
use crate::extract::ApiJson;
use crate::users::{normalize_email, validate_name, validate_nickname};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
    pub limits: Limits,
}

impl AppStateInner {
    /// Wires the dispatcher to authorize channels against `db`.
    pub fn new(db: Arc<Database>, jwt_secret: String, limits: Limits) -> Self {
        let dispatcher = Dispatcher::new(db.clone());
        Self {
            db,
            dispatcher,
            jwt_secret,
            limits,
        }
    }
}

/// Business limits that are configurable at startup.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_message_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_len: 5000,
        }
    }
}

const MIN_PASSWORD_LEN: usize = 8;
const TOKEN_TTL_DAYS: i64 = 30;

pub async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = blocking(&state, move |s| register_user(s, &req)).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = blocking(&state, move |s| login_user(s, &req)).await?;
    Ok(Json(response))
}

pub fn register_user(state: &AppStateInner, req: &RegisterRequest) -> ApiResult<RegisterResponse> {
    let name = validate_name(&req.name)?;
    let email = normalize_email(&req.email)?;
    let nickname = validate_nickname(req.nickname.as_deref())?;

    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "The password must be at least {} characters.",
            MIN_PASSWORD_LEN
        )));
    }

    if state.db.email_taken(&email, None)? {
        return Err(ApiError::Conflict("The email has already been taken.".into()));
    }
    if let Some(nickname) = nickname.as_deref() {
        if state.db.nickname_taken(nickname, None)? {
            return Err(ApiError::Conflict("The nickname has already been taken.".into()));
        }
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))?
        .to_string();

    let user_id = state
        .db
        .create_user(&name, &email, nickname.as_deref(), &password_hash)
        .map_err(|e| {
            ApiError::from_write(e, || ApiError::Conflict("The email or nickname has already been taken.".into()))
        })?;
    info!("Registered user {}", user_id);

    let token = create_token(&state.jwt_secret, user_id, &name)?;

    Ok(RegisterResponse { user_id, token })
}

pub fn login_user(state: &AppStateInner, req: &LoginRequest) -> ApiResult<LoginResponse> {
    let email = req.email.trim().to_lowercase();
    let (user, hash) = state
        .db
        .get_credentials_by_email(&email)?
        .ok_or(ApiError::Unauthorized)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&hash)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("stored hash for {} unreadable: {}", user.id, e)))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized)?;

    let token = create_token(&state.jwt_secret, user.id, &user.name)?;

    Ok(LoginResponse {
        user_id: user.id,
        name: user.name,
        nickname: user.nickname,
        token,
    })
}

pub fn create_token(secret: &str, user_id: i64, name: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        name: name.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn request(email: &str, nickname: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            name: "Ann".into(),
            email: email.into(),
            password: "correct horse".into(),
            nickname: nickname.map(str::to_string),
        }
    }

    #[test]
    fn register_then_login() {
        let fx = Fixture::new();
        let registered = register_user(&fx.state, &request("Ann@Example.com", Some("ann"))).unwrap();
        assert!(!registered.token.is_empty());

        let login = login_user(
            &fx.state,
            &LoginRequest {
                email: "ann@example.com".into(),
                password: "correct horse".into(),
            },
        )
        .unwrap();
        assert_eq!(login.user_id, registered.user_id);
        assert_eq!(login.nickname.as_deref(), Some("ann"));
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let fx = Fixture::new();
        register_user(&fx.state, &request("ann@example.com", None)).unwrap();

        let err = login_user(
            &fx.state,
            &LoginRequest {
                email: "ann@example.com".into(),
                password: "wrong password".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[test]
    fn duplicate_email_conflicts() {
        let fx = Fixture::new();
        register_user(&fx.state, &request("ann@example.com", None)).unwrap();

        let err = register_user(&fx.state, &request("ANN@example.com", None)).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn short_password_rejected() {
        let fx = Fixture::new();
        let mut req = request("ann@example.com", None);
        req.password = "short".into();

        assert!(matches!(register_user(&fx.state, &req), Err(ApiError::Validation(_))));
    }

    #[test]
    fn concurrent_duplicate_signup_conflicts() {
        let fx = Fixture::new();
        // Another signup for the same email lands between the check and the insert.
        fx.state
            .db
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER racing_signup BEFORE INSERT ON users
                     WHEN NEW.email = 'race@example.com' AND NEW.name <> 'Winner'
                     BEGIN
                         INSERT INTO users (name, email, password) VALUES ('Winner', NEW.email, 'h');
                     END;",
                )?;
                Ok(())
            })
            .unwrap();

        let err = register_user(&fx.state, &request("race@example.com", None)).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }
}
