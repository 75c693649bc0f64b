// src/services/connection.rs
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nanoid::nanoid;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::errors::{RideError, RideResult};
use crate::models::messages::EventMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),
}

impl From<TransportError> for RideError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectFailed(msg) => RideError::Network(msg),
            TransportError::NotConnected => RideError::ConnectionClosed,
            TransportError::SendFailed(msg) => RideError::Network(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Message(EventMessage),
}

/// One bidirectional channel to the ride-coordination server. The manager
/// owns reconnection; implementations only perform a single handshake per
/// `connect` call and report loss through `next_event`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    async fn send(&self, message: EventMessage) -> Result<(), TransportError>;
    async fn next_event(&self) -> Option<TransportEvent>;
}

/// WebSocket transport. Frames are JSON `{event, data}` envelopes as text.
pub struct WsTransport {
    url: String,
    connected: Arc<AtomicBool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            connected: Arc::new(AtomicBool::new(false)),
            outbound: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock().await = Some(out_tx);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Connected);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let events_tx = self.events_tx.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<EventMessage>(&text) {
                        Ok(message) => {
                            let _ = events_tx.send(TransportEvent::Message(message));
                        }
                        Err(e) => tracing::warn!("Dropping unparseable frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {} // ping/pong/binary: nothing to do
                    Err(e) => {
                        tracing::warn!("Socket read error: {}", e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            let _ = events_tx.send(TransportEvent::Disconnected {
                reason: "stream closed".to_string(),
            });
        });

        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the sender ends the writer task, which drops the sink.
        *self.outbound.lock().await = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: EventMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text =
            serde_json::to_string(&message).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        match self.outbound.lock().await.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|e| TransportError::SendFailed(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events_rx.lock().await.recv().await
    }
}

// Mock transport for development and testing
pub struct MockTransport {
    connected: AtomicBool,
    fail_connects: AtomicUsize,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    sent: std::sync::Mutex<Vec<EventMessage>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(false),
            fail_connects: AtomicUsize::new(0),
            events_tx,
            events_rx: Mutex::new(events_rx),
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Inject an inbound server event.
    pub fn push_server_event(&self, event: &str, data: Value) {
        let _ = self.events_tx.send(TransportEvent::Message(EventMessage {
            event: event.to_string(),
            data,
        }));
    }

    /// Simulate a network blip.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Disconnected {
            reason: "simulated loss".to_string(),
        });
    }

    /// Everything sent over the channel so far, in send order.
    pub fn sent_messages(&self) -> Vec<EventMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::ConnectFailed("simulated refusal".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Disconnected {
            reason: "client disconnect".to_string(),
        });
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: EventMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(message);
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events_rx.lock().await.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;
type SubscriberMap = Arc<Mutex<HashMap<String, Vec<(String, EventCallback)>>>>;

/// Callback registration guard. Listeners stay attached across reconnects
/// (only room joins are replayed); call `unsubscribe` to detach.
pub struct Subscription {
    event: String,
    id: String,
    subscribers: SubscriberMap,
}

impl Subscription {
    pub async fn unsubscribe(self) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(list) = subscribers.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Replay-registry key for the searching client's broadcast-room join.
pub fn client_session_key(order_id: &str) -> String {
    format!("client:{}", order_id)
}

/// Replay-registry key for the per-ride room join.
pub fn ride_room_key(order_id: &str) -> String {
    format!("ride:{}", order_id)
}

/// Replay-registry key for the driver's session join.
pub fn driver_session_key() -> String {
    "driver".to_string()
}

struct JoinEntry {
    key: String,
    message: EventMessage,
}

/// Owns the single persistent channel per app instance: connect once,
/// reconnect forever with bounded backoff, and replay registered room
/// joins after every successful (re)connection so the ride and driver
/// rooms survive a network blip without the caller noticing.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    joins: Mutex<Vec<JoinEntry>>,
    subscribers: SubscriberMap,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            policy,
            state_tx,
            joins: Mutex::new(Vec::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    /// Start the background connection loop. Idempotent: calling it while
    /// the loop is already running is a no-op.
    pub fn connect(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(false);
        let manager = Arc::clone(self);
        tokio::spawn(manager.run());
    }

    /// Connect and wait for the handshake to complete. A timeout here is
    /// retryable; the background loop keeps trying regardless.
    pub async fn connect_and_wait(self: &Arc<Self>) -> RideResult<()> {
        self.connect();

        let mut state_rx = self.state_tx.subscribe();
        if *state_rx.borrow() == ConnectionState::Connected {
            return Ok(());
        }

        tokio::time::timeout(self.policy.handshake_timeout, async move {
            loop {
                state_rx
                    .changed()
                    .await
                    .map_err(|_| RideError::ConnectionClosed)?;
                if *state_rx.borrow() == ConnectionState::Connected {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| RideError::timeout("Socket connection timeout"))?
    }

    /// Stop the loop and close the channel. Join registrations and
    /// listeners are kept; a later `connect` resumes with the same set.
    pub async fn disconnect(&self) {
        self.shutdown_tx.send_replace(true);
        self.transport.disconnect().await;
    }

    /// Fire-and-forget emit. Sends performed while disconnected are
    /// silently dropped, never queued; callers that rely on delivery must
    /// re-query authoritative state over HTTP after a reconnect.
    pub async fn emit(&self, event: &str, data: impl Serialize) -> RideResult<()> {
        let message = EventMessage::new(event, data)?;
        self.emit_message(message).await;
        Ok(())
    }

    pub async fn emit_message(&self, message: EventMessage) {
        if !self.transport.is_connected() {
            tracing::debug!("Dropping {} while disconnected", message.event);
            return;
        }
        if let Err(e) = self.transport.send(message.clone()).await {
            tracing::warn!("Failed to send {}: {}", message.event, e);
        }
    }

    /// Register a room join to be replayed after every (re)connection.
    /// Keyed: re-registering the same key replaces the payload in place,
    /// and `unregister_join` releases it when the ride ends. The join is
    /// also fired immediately when the channel is up.
    pub async fn register_join(&self, key: &str, message: EventMessage) {
        {
            let mut joins = self.joins.lock().await;
            if let Some(entry) = joins.iter_mut().find(|e| e.key == key) {
                entry.message = message.clone();
            } else {
                joins.push(JoinEntry { key: key.to_string(), message: message.clone() });
            }
        }
        self.emit_message(message).await;
    }

    pub async fn unregister_join(&self, key: &str) {
        self.joins.lock().await.retain(|e| e.key != key);
    }

    /// Attach a listener for a named event. Returns a guard whose
    /// `unsubscribe` detaches it.
    pub async fn subscribe(
        &self,
        event: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        let id = nanoid!();
        self.subscribers
            .lock()
            .await
            .entry(event.to_string())
            .or_default()
            .push((id.clone(), Arc::new(callback)));
        Subscription {
            event: event.to_string(),
            id,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    async fn replay_joins(&self) {
        let pending: Vec<EventMessage> = {
            let joins = self.joins.lock().await;
            joins.iter().map(|e| e.message.clone()).collect()
        };
        for message in pending {
            tracing::debug!("Replaying join {}", message.event);
            if let Err(e) = self.transport.send(message.clone()).await {
                tracing::warn!("Join replay for {} failed: {}", message.event, e);
            }
        }
    }

    async fn dispatch(&self, message: EventMessage) {
        let callbacks: Vec<EventCallback> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .get(&message.event)
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(&message.data);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut delay = self.policy.initial_delay;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.state_tx.send_replace(ConnectionState::Connecting);
            match self.transport.connect().await {
                Ok(()) => {
                    tracing::info!("Socket connected");
                    delay = self.policy.initial_delay;
                    self.state_tx.send_replace(ConnectionState::Connected);
                    self.replay_joins().await;

                    loop {
                        tokio::select! {
                            event = self.transport.next_event() => match event {
                                Some(TransportEvent::Message(message)) => {
                                    self.dispatch(message).await;
                                }
                                Some(TransportEvent::Connected) => {}
                                Some(TransportEvent::Disconnected { reason }) => {
                                    tracing::warn!("Socket disconnected: {}", reason);
                                    break;
                                }
                                None => break,
                            },
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }

                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Socket connect attempt failed: {}", e);
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                }
            }

            // Unbounded retries, exponential backoff capped at max_delay
            let jitter = Duration::from_millis((rand::random::<f64>() * 250.0) as u64);
            tokio::select! {
                _ = tokio::time::sleep(delay + jitter) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            delay = (delay * 2).min(self.policy.max_delay);
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.started.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn join_message(n: u32) -> EventMessage {
        EventMessage {
            event: "ride:join".to_string(),
            data: json!({ "orderId": format!("ord-{}", n) }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_wait_succeeds() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport, ReconnectPolicy::default());

        manager.connect_and_wait().await.unwrap();
        assert!(manager.is_connected());

        // Idempotent: a second call is a no-op
        manager.connect_and_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_wait_times_out() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_connects(usize::MAX);
        let manager = ConnectionManager::new(transport, ReconnectPolicy::default());

        let result = manager.connect_and_wait().await;
        assert!(matches!(result, Err(RideError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_failed_attempts() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_connects(3);
        let manager = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());

        manager.connect();
        let mgr = manager.clone();
        wait_for(|| mgr.is_connected()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_joins_replayed_in_order_after_reconnect() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());

        manager.register_join("a", join_message(1)).await;
        manager.register_join("b", join_message(2)).await;
        manager.register_join("c", join_message(3)).await;

        manager.connect_and_wait().await.unwrap();
        let t = transport.clone();
        wait_for(|| t.sent_messages().len() == 3).await;

        transport.drop_connection();
        let t = transport.clone();
        wait_for(|| t.sent_messages().len() == 6).await;

        let sent = transport.sent_messages();
        // Exactly once per registered join, in registration order, per connect
        for window in [&sent[0..3], &sent[3..6]] {
            assert_eq!(window[0].data["orderId"], "ord-1");
            assert_eq!(window[1].data["orderId"], "ord-2");
            assert_eq!(window[2].data["orderId"], "ord-3");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_join_is_not_replayed() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());

        manager.register_join("a", join_message(1)).await;
        manager.register_join("b", join_message(2)).await;
        manager.connect_and_wait().await.unwrap();
        let t = transport.clone();
        wait_for(|| t.sent_messages().len() == 2).await;

        manager.unregister_join("a").await;
        transport.drop_connection();
        let t = transport.clone();
        wait_for(|| t.sent_messages().len() == 3).await;

        let sent = transport.sent_messages();
        assert_eq!(sent[2].data["orderId"], "ord-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rekeyed_join_replaces_payload() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());
        manager.connect_and_wait().await.unwrap();

        manager.register_join("ride", join_message(1)).await;
        manager.register_join("ride", join_message(9)).await;

        transport.drop_connection();
        let t = transport.clone();
        // 2 immediate sends + 1 replayed on reconnect
        wait_for(|| t.sent_messages().len() == 3).await;

        let sent = transport.sent_messages();
        assert_eq!(sent[2].data["orderId"], "ord-9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_while_disconnected_is_dropped() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());

        manager.emit("driver:status", json!({"isOnline": true})).await.unwrap();
        manager.connect_and_wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Fire-and-forget: nothing was queued for later delivery
        assert!(transport.sent_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_and_unsubscribe() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());
        manager.connect_and_wait().await.unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::<Value>::new()));
        let sink = seen.clone();
        let subscription = manager
            .subscribe("order:expired", move |data| {
                sink.lock().unwrap().push(data.clone());
            })
            .await;

        transport.push_server_event("order:expired", json!({"orderId": "ord-1"}));
        let s = seen.clone();
        wait_for(move || s.lock().unwrap().len() == 1).await;

        subscription.unsubscribe().await;
        transport.push_server_event("order:expired", json!({"orderId": "ord-2"}));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_survive_reconnect() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());
        manager.connect_and_wait().await.unwrap();

        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let sink = seen.clone();
        let _subscription = manager
            .subscribe("ride:status:changed", move |_| {
                *sink.lock().unwrap() += 1;
            })
            .await;

        transport.push_server_event("ride:status:changed", json!({"status": "arrived"}));
        let s = seen.clone();
        wait_for(move || *s.lock().unwrap() == 1).await;

        transport.drop_connection();
        let t = transport.clone();
        wait_for(|| t.is_connected()).await;

        transport.push_server_event("ride:status:changed", json!({"status": "inprogress"}));
        let s = seen.clone();
        wait_for(move || *s.lock().unwrap() == 2).await;
    }
}
