use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};

use tandem_gateway::connection;

use crate::auth::{self, AppState};
use crate::middleware::require_auth;
use crate::{chats, contacts, messages, users};

/// All HTTP routes plus the WebSocket gateway. Transport layers (CORS,
/// tracing) are added by the server binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/gateway", get(ws_upgrade));

    let protected_routes = Router::new()
        .route("/users/me", get(users::me).put(users::update_me))
        .route("/users/search", get(users::search))
        .route("/contacts", get(contacts::index).post(contacts::store))
        .route("/contacts/{contact_id}", delete(contacts::destroy))
        .route("/chats", get(chats::index).post(chats::store))
        .route("/chats/{chat_id}", get(chats::show))
        .route("/chats/{chat_id}/notifications", put(chats::update_notifications))
        .route("/messages", post(messages::send))
        .route("/messages/forward", post(messages::forward))
        .route("/messages/{message_id}", put(messages::update).delete(messages::destroy))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher.clone(), state.jwt_secret.clone())
    })
}
