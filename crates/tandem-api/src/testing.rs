//! Shared setup for unit tests: an in-memory database behind a full app state.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use tandem_db::Database;
use tandem_types::events::{ChannelKey, GatewayEvent};

use crate::auth::{AppState, AppStateInner, Limits};
use crate::chats::create_direct_chat;

pub(crate) struct Fixture {
    pub state: AppState,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let state = Arc::new(AppStateInner::new(db, "test-secret".into(), Limits::default()));
        Self { state }
    }

    /// Creates a user whose name, nickname and email local part are all `nickname`.
    pub fn user(&self, nickname: &str) -> i64 {
        self.state
            .db
            .create_user(nickname, &format!("{nickname}@example.com"), Some(nickname), "not-a-hash")
            .unwrap()
    }

    pub fn befriend(&self, owner: i64, target: i64) {
        self.state.db.upsert_contact(owner, target, None).unwrap();
    }

    pub fn direct_chat(&self, a: i64, b: i64) -> i64 {
        create_direct_chat(&self.state, a, b).unwrap().0.id
    }

    /// Opens a gateway connection for `user_id` subscribed to the chat.
    pub fn listen(&self, user_id: i64, chat_id: i64) -> UnboundedReceiver<GatewayEvent> {
        let (conn_id, rx) = self.state.dispatcher.register(user_id);
        assert!(self.state.dispatcher.subscribe(conn_id, ChannelKey::chat(chat_id)));
        rx
    }
}
