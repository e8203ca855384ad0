use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use tandem_db::Database;
use tandem_types::events::{ChannelKey, ChatEvent, GatewayEvent};

/// Decides whether a user may receive events of a channel. Consulted on every
/// subscribe and again on every delivery.
pub trait ChannelAuthorizer: Send + Sync {
    fn can_access(&self, user_id: i64, channel: ChannelKey) -> bool;
}

/// Chat channels are open to current members only.
impl ChannelAuthorizer for Database {
    fn can_access(&self, user_id: i64, channel: ChannelKey) -> bool {
        match self.is_member(channel.chat_id(), user_id) {
            Ok(member) => member,
            Err(e) => {
                warn!("Membership check for {} on {} failed: {}", user_id, channel, e);
                false
            }
        }
    }
}

struct ConnectionEntry {
    user_id: i64,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    channels: HashSet<ChannelKey>,
}

/// Tracks gateway connections and routes chat events to authorized subscribers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    authorizer: Arc<dyn ChannelAuthorizer>,

    /// conn_id -> connection state
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

impl Dispatcher {
    pub fn new(authorizer: Arc<dyn ChannelAuthorizer>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                authorizer,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection for `user_id`. Returns (conn_id, receiver).
    pub fn register(&self, user_id: i64) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                conn_id,
                ConnectionEntry {
                    user_id,
                    tx,
                    channels: HashSet::new(),
                },
            );
        (conn_id, rx)
    }

    pub fn unregister(&self, conn_id: Uuid) {
        self.inner
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn_id);
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Subscribe a connection to a channel if its user may access it.
    /// Returns whether the subscription was accepted. Blocks on the authorizer.
    pub fn subscribe(&self, conn_id: Uuid, channel: ChannelKey) -> bool {
        let user_id = {
            let conns = self.inner.connections.read().unwrap_or_else(|e| e.into_inner());
            match conns.get(&conn_id) {
                Some(entry) => entry.user_id,
                None => return false,
            }
        };

        if !self.inner.authorizer.can_access(user_id, channel) {
            debug!("User {} denied subscription to {}", user_id, channel);
            return false;
        }

        let mut conns = self.inner.connections.write().unwrap_or_else(|e| e.into_inner());
        match conns.get_mut(&conn_id) {
            Some(entry) => {
                entry.channels.insert(channel);
                debug!("User {} subscribed to {}", user_id, channel);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, conn_id: Uuid, channel: ChannelKey) {
        let mut conns = self.inner.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = conns.get_mut(&conn_id) {
            entry.channels.remove(&channel);
        }
    }

    /// Send an event to a single connection.
    pub fn send_to_connection(&self, conn_id: Uuid, event: GatewayEvent) {
        let conns = self.inner.connections.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = conns.get(&conn_id) {
            let _ = entry.tx.send(event);
        }
    }

    /// Fan a chat event out to every subscriber of its channel except the
    /// actor's own connections. Each recipient's membership is re-checked;
    /// subscriptions that fail the check are dropped. Best-effort: delivery
    /// problems are logged, never returned. Returns the number of deliveries.
    pub fn publish(&self, event: ChatEvent, actor_id: i64) -> usize {
        let channel = event.channel();

        let candidates: Vec<(Uuid, i64, mpsc::UnboundedSender<GatewayEvent>)> = {
            let conns = self.inner.connections.read().unwrap_or_else(|e| e.into_inner());
            conns
                .iter()
                .filter(|(_, entry)| entry.user_id != actor_id && entry.channels.contains(&channel))
                .map(|(conn_id, entry)| (*conn_id, entry.user_id, entry.tx.clone()))
                .collect()
        };

        let mut verdicts: HashMap<i64, bool> = HashMap::new();
        let mut revoked = Vec::new();
        let mut delivered = 0;

        for (conn_id, user_id, tx) in candidates {
            let allowed = *verdicts
                .entry(user_id)
                .or_insert_with(|| self.inner.authorizer.can_access(user_id, channel));

            if !allowed {
                revoked.push(conn_id);
                continue;
            }

            let frame = GatewayEvent::Dispatch {
                channel,
                event: event.clone(),
            };
            if tx.send(frame).is_err() {
                debug!("Dropped {} for closed connection {}", event.name(), conn_id);
                continue;
            }
            delivered += 1;
        }

        if !revoked.is_empty() {
            let mut conns = self.inner.connections.write().unwrap_or_else(|e| e.into_inner());
            for conn_id in &revoked {
                if let Some(entry) = conns.get_mut(conn_id) {
                    entry.channels.remove(&channel);
                    debug!("Revoked {} for user {} (no longer a member)", channel, entry.user_id);
                }
            }
        }

        debug!("{} on {} delivered to {} connection(s)", event.name(), channel, delivered);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Authorizer backed by a mutable (chat, user) set.
    #[derive(Default)]
    struct Roster {
        members: RwLock<HashSet<(i64, i64)>>,
    }

    impl Roster {
        fn add(&self, chat_id: i64, user_id: i64) {
            self.members.write().unwrap().insert((chat_id, user_id));
        }

        fn remove(&self, chat_id: i64, user_id: i64) {
            self.members.write().unwrap().remove(&(chat_id, user_id));
        }
    }

    impl ChannelAuthorizer for Roster {
        fn can_access(&self, user_id: i64, channel: ChannelKey) -> bool {
            self.members.read().unwrap().contains(&(channel.chat_id(), user_id))
        }
    }

    fn deleted(chat_id: i64) -> ChatEvent {
        ChatEvent::MessageDeleted { chat_id, message_id: 1 }
    }

    fn setup() -> (Arc<Roster>, Dispatcher) {
        let roster = Arc::new(Roster::default());
        let dispatcher = Dispatcher::new(roster.clone());
        (roster, dispatcher)
    }

    #[test]
    fn non_member_cannot_subscribe() {
        let (roster, dispatcher) = setup();
        roster.add(1, 10);
        let (conn, _rx) = dispatcher.register(20);

        assert!(!dispatcher.subscribe(conn, ChannelKey::chat(1)));
    }

    #[test]
    fn actor_is_excluded() {
        let (roster, dispatcher) = setup();
        roster.add(1, 10);
        roster.add(1, 20);
        let (a_conn, mut a_rx) = dispatcher.register(10);
        let (b_conn, mut b_rx) = dispatcher.register(20);
        assert!(dispatcher.subscribe(a_conn, ChannelKey::chat(1)));
        assert!(dispatcher.subscribe(b_conn, ChannelKey::chat(1)));

        assert_eq!(dispatcher.publish(deleted(1), 10), 1);

        assert!(a_rx.try_recv().is_err());
        match b_rx.try_recv().unwrap() {
            GatewayEvent::Dispatch { channel, event } => {
                assert_eq!(channel, ChannelKey::chat(1));
                assert_eq!(event.name(), "MessageDeleted");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn actor_other_devices_are_excluded_too() {
        let (roster, dispatcher) = setup();
        roster.add(1, 10);
        let (phone, mut phone_rx) = dispatcher.register(10);
        assert!(dispatcher.subscribe(phone, ChannelKey::chat(1)));

        assert_eq!(dispatcher.publish(deleted(1), 10), 0);
        assert!(phone_rx.try_recv().is_err());
    }

    #[test]
    fn only_matching_channel_receives() {
        let (roster, dispatcher) = setup();
        roster.add(1, 20);
        roster.add(2, 30);
        let (b_conn, mut b_rx) = dispatcher.register(20);
        let (c_conn, mut c_rx) = dispatcher.register(30);
        dispatcher.subscribe(b_conn, ChannelKey::chat(1));
        dispatcher.subscribe(c_conn, ChannelKey::chat(2));

        dispatcher.publish(deleted(2), 10);

        assert!(b_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_ok());
    }

    #[test]
    fn membership_is_rechecked_at_delivery() {
        let (roster, dispatcher) = setup();
        roster.add(1, 20);
        let (conn, mut rx) = dispatcher.register(20);
        assert!(dispatcher.subscribe(conn, ChannelKey::chat(1)));

        roster.remove(1, 20);
        assert_eq!(dispatcher.publish(deleted(1), 10), 0);
        assert!(rx.try_recv().is_err());

        // The stale subscription was dropped, re-adding needs a new subscribe.
        roster.add(1, 20);
        assert_eq!(dispatcher.publish(deleted(1), 10), 0);
        assert!(dispatcher.subscribe(conn, ChannelKey::chat(1)));
        assert_eq!(dispatcher.publish(deleted(1), 10), 1);
    }

    #[test]
    fn closed_receiver_does_not_fail_publish() {
        let (roster, dispatcher) = setup();
        roster.add(1, 20);
        roster.add(1, 30);
        let (gone, gone_rx) = dispatcher.register(20);
        let (live, mut live_rx) = dispatcher.register(30);
        dispatcher.subscribe(gone, ChannelKey::chat(1));
        dispatcher.subscribe(live, ChannelKey::chat(1));
        drop(gone_rx);

        assert_eq!(dispatcher.publish(deleted(1), 10), 1);
        assert!(live_rx.try_recv().is_ok());
    }

    #[test]
    fn unregister_stops_delivery() {
        let (roster, dispatcher) = setup();
        roster.add(1, 20);
        let (conn, _rx) = dispatcher.register(20);
        dispatcher.subscribe(conn, ChannelKey::chat(1));
        assert_eq!(dispatcher.connection_count(), 1);

        dispatcher.unregister(conn);

        assert_eq!(dispatcher.connection_count(), 0);
        assert_eq!(dispatcher.publish(deleted(1), 10), 0);
        assert!(!dispatcher.subscribe(conn, ChannelKey::chat(1)));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (roster, dispatcher) = setup();
        roster.add(1, 20);
        let (conn, mut rx) = dispatcher.register(20);
        dispatcher.subscribe(conn, ChannelKey::chat(1));

        dispatcher.unsubscribe(conn, ChannelKey::chat(1));

        assert_eq!(dispatcher.publish(deleted(1), 10), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn database_authorizer_uses_roster() {
        use tandem_db::models::NewChat;
        use tandem_types::models::Role;

        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("A", "a@example.com", None, "h").unwrap();
        let b = db.create_user("B", "b@example.com", None, "h").unwrap();
        let c = db.create_user("C", "c@example.com", None, "h").unwrap();
        let chat = db
            .create_chat(&NewChat {
                title: None,
                is_group: false,
                created_by: a,
                members: vec![(a, Role::Owner), (b, Role::Member)],
            })
            .unwrap();

        assert!(db.can_access(b, ChannelKey::chat(chat)));
        assert!(!db.can_access(c, ChannelKey::chat(chat)));
        assert!(!db.can_access(a, ChannelKey::chat(chat + 100)));
    }
}
