use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_types::api::Claims;
use tandem_types::events::{ChannelKey, GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;

/// Server pings on this period; a connection that misses two pongs in a row
/// is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;

/// The first frame must be an Identify within this window.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Handle a single WebSocket connection: Identify handshake, Ready, then the
/// subscribe/deliver loop until either side goes away.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, jwt_secret: String) {
    let (mut sink, mut stream) = socket.split();

    let Some(user_id) = identify(&mut stream, &jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };
    info!("User {} connected to gateway", user_id);

    if let Err(e) = send_event(&mut sink, &GatewayEvent::Ready { user_id }).await {
        debug!("User {} went away before Ready: {}", user_id, e);
        return;
    }

    let (conn_id, events) = dispatcher.register(user_id);
    let liveness = Liveness::default();

    let mut outbound = tokio::spawn(write_events(sink, events, liveness.clone(), user_id));
    let mut inbound = tokio::spawn(read_commands(stream, dispatcher.clone(), liveness, conn_id, user_id));

    tokio::select! {
        _ = &mut outbound => inbound.abort(),
        _ = &mut inbound => outbound.abort(),
    }

    dispatcher.unregister(conn_id);
    info!("User {} disconnected from gateway", user_id);
}

/// Pong bookkeeping shared by the reader (which records pongs) and the
/// writer (which checks them on every ping).
#[derive(Clone, Default)]
struct Liveness {
    pong_seen: Arc<AtomicBool>,
}

impl Liveness {
    fn record_pong(&self) {
        self.pong_seen.store(true, Ordering::Release);
    }

    fn take_pong(&self) -> bool {
        self.pong_seen.swap(false, Ordering::Acquire)
    }
}

async fn send_event(sink: &mut WsSink, event: &GatewayEvent) -> anyhow::Result<()> {
    let text = serde_json::to_string(event)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Drains the connection's event queue to the socket and keeps the heartbeat.
async fn write_events(
    mut sink: WsSink,
    mut events: UnboundedReceiver<GatewayEvent>,
    liveness: Liveness,
    user_id: i64,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await;
    // No ping has gone out yet.
    liveness.record_pong();
    let mut missed: u8 = 0;

    loop {
        tokio::select! {
            next = events.recv() => {
                let Some(event) = next else { break };
                if let Err(e) = send_event(&mut sink, &event).await {
                    debug!("Gateway send to {} failed: {}", user_id, e);
                    break;
                }
            }
            _ = ticker.tick() => {
                missed = if liveness.take_pong() { 0 } else { missed + 1 };
                if missed >= MAX_MISSED_PONGS {
                    warn!("User {} missed {} pongs, dropping connection", user_id, missed);
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Applies client commands until the socket closes or errors.
async fn read_commands(
    mut stream: WsStream,
    dispatcher: Dispatcher,
    liveness: Liveness,
    conn_id: Uuid,
    user_id: i64,
) {
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                Ok(command) => apply_command(&dispatcher, conn_id, user_id, command).await,
                Err(e) => {
                    let preview: String = text.chars().take(200).collect();
                    warn!("User {} sent a malformed frame: {} -- raw: {}", user_id, e, preview);
                }
            },
            Message::Pong(_) => liveness.record_pong(),
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Reads the Identify frame and returns the token's user id. The first data
/// frame must be an Identify with a valid token; anything else ends the
/// handshake. Control frames are ignored.
async fn identify(stream: &mut WsStream, jwt_secret: &str) -> Option<i64> {
    let handshake = async {
        while let Some(Ok(frame)) = stream.next().await {
            let text = match frame {
                Message::Text(text) => text,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Binary(_) | Message::Close(_) => return None,
            };
            let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text) else {
                debug!("Gateway handshake got a frame other than Identify");
                return None;
            };

            let key = DecodingKey::from_secret(jwt_secret.as_bytes());
            return match decode::<Claims>(&token, &key, &Validation::default()) {
                Ok(data) => Some(data.claims.sub),
                Err(e) => {
                    debug!("Gateway token rejected: {}", e);
                    None
                }
            };
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, handshake).await.ok().flatten()
}

async fn apply_command(dispatcher: &Dispatcher, conn_id: Uuid, user_id: i64, command: GatewayCommand) {
    match command {
        GatewayCommand::Identify { .. } => debug!("User {} sent a second Identify", user_id),

        GatewayCommand::Subscribe { channel } => {
            let reply = match channel.parse::<ChannelKey>() {
                Ok(key) => {
                    if authorize_subscription(dispatcher, conn_id, key).await {
                        info!("User {} subscribed to {}", user_id, key);
                        GatewayEvent::Subscribed { channel: key }
                    } else {
                        info!("User {} denied {}", user_id, key);
                        GatewayEvent::SubscriptionDenied { channel: key.to_string() }
                    }
                }
                Err(e) => {
                    warn!("User {} sent {}", user_id, e);
                    GatewayEvent::SubscriptionDenied { channel }
                }
            };
            dispatcher.send_to_connection(conn_id, reply);
        }

        GatewayCommand::Unsubscribe { channel } => match channel.parse::<ChannelKey>() {
            Ok(key) => {
                dispatcher.unsubscribe(conn_id, key);
                debug!("User {} unsubscribed from {}", user_id, key);
            }
            Err(e) => warn!("User {} sent {}", user_id, e),
        },
    }
}

/// Membership is checked against the database, so it runs on the blocking pool.
async fn authorize_subscription(dispatcher: &Dispatcher, conn_id: Uuid, key: ChannelKey) -> bool {
    let dispatcher = dispatcher.clone();
    tokio::task::spawn_blocking(move || dispatcher.subscribe(conn_id, key))
        .await
        .unwrap_or_else(|e| {
            warn!("spawn_blocking join error: {}", e);
            false
        })
}
