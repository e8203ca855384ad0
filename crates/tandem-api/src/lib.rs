pub mod access;
pub mod auth;
pub mod chats;
pub mod contacts;
pub mod error;
pub mod extract;
pub mod messages;
pub mod middleware;
pub mod router;
pub mod users;
pub mod views;

#[cfg(test)]
pub(crate) mod testing;

use tracing::error;

use crate::auth::{AppState, AppStateInner};
use crate::error::{ApiError, ApiResult};

/// Runs blocking storage work off the async runtime.
pub(crate) async fn blocking<F, T>(state: &AppState, f: F) -> ApiResult<T>
where
    F: FnOnce(&AppStateInner) -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(e.into())
        })?
}
