// src/services/lifecycle.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::errors::{RideError, RideResult};
use crate::models::messages::{
    EventMessage, RideCancel, RideCancelled, RideJoin, RideStatusChanged, RideStatusUpdate, events,
};
use crate::models::ride::{AssignedDriver, Order, RideStatus, Role};
use crate::services::api::RideApi;
use crate::services::connection::{
    ConnectionManager, Subscription, client_session_key, ride_room_key,
};
use crate::services::payment::PaymentCoordinator;
use crate::services::store::CredentialService;

/// Role-specific credential presented on every ride-room operation
/// together with the ride id; the server rejects mismatched pairs.
#[derive(Debug, Clone)]
pub enum RideCredential {
    Driver { session_id: String },
    Client { token: String },
}

impl RideCredential {
    pub fn role(&self) -> Role {
        match self {
            RideCredential::Driver { .. } => Role::Driver,
            RideCredential::Client { .. } => Role::Client,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        match self {
            RideCredential::Driver { session_id } => Some(session_id.clone()),
            RideCredential::Client { .. } => None,
        }
    }

    pub fn client_token(&self) -> Option<String> {
        match self {
            RideCredential::Driver { .. } => None,
            RideCredential::Client { token } => Some(token.clone()),
        }
    }

    /// (session id, client token) as sent on the wire.
    pub fn pair(&self) -> (Option<String>, Option<String>) {
        (self.session_id(), self.client_token())
    }
}

enum LifecycleEvent {
    Status(RideStatusChanged),
    Cancelled(RideCancelled),
    Assigned,
}

/// Keeps both parties' view of one ride in sync after assignment. The
/// driver app drives the `enroute → arrived → inprogress → completed`
/// transitions; the client app mirrors `ride:status:changed` broadcasts.
pub struct RideLifecycle {
    connection: Arc<ConnectionManager>,
    credentials: Arc<CredentialService>,
    api: Arc<dyn RideApi>,
    order_id: String,
    credential: RideCredential,
    payment: Arc<PaymentCoordinator>,
    status_tx: watch::Sender<RideStatus>,
    cancelled_tx: watch::Sender<Option<RideCancelled>>,
    subscriptions: Mutex<Vec<Subscription>>,
    adopted: Mutex<Vec<Subscription>>,
    released: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RideLifecycle {
    pub fn new(
        order: &Order,
        credential: RideCredential,
        connection: Arc<ConnectionManager>,
        credentials: Arc<CredentialService>,
        api: Arc<dyn RideApi>,
    ) -> Arc<Self> {
        let initial =
            RideStatus::from_order_status(order.status).unwrap_or(RideStatus::Enroute);
        let payment = PaymentCoordinator::new(
            Arc::clone(&connection),
            order.id.clone(),
            credential.role(),
            credential.clone(),
            order.total_price,
            order.payment_method,
        );
        let (status_tx, _) = watch::channel(initial);
        let (cancelled_tx, _) = watch::channel(None);

        Arc::new(Self {
            connection,
            credentials,
            api,
            order_id: order.id.clone(),
            credential,
            payment,
            status_tx,
            cancelled_tx,
            subscriptions: Mutex::new(Vec::new()),
            adopted: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn role(&self) -> Role {
        self.credential.role()
    }

    pub fn status(&self) -> watch::Receiver<RideStatus> {
        self.status_tx.subscribe()
    }

    pub fn cancelled(&self) -> watch::Receiver<Option<RideCancelled>> {
        self.cancelled_tx.subscribe()
    }

    pub fn payment(&self) -> &Arc<PaymentCoordinator> {
        &self.payment
    }

    /// Join the ride room. The join is registered with the connection
    /// manager's replay registry, so it is re-issued automatically after
    /// every reconnection until the ride reaches a terminal state.
    pub async fn join(self: &Arc<Self>) -> RideResult<()> {
        self.payment.start().await;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<LifecycleEvent>();

        let tx = event_tx.clone();
        let on_status = self
            .connection
            .subscribe(events::RIDE_STATUS_CHANGED, move |data| {
                match serde_json::from_value::<RideStatusChanged>(data.clone()) {
                    Ok(changed) => {
                        let _ = tx.send(LifecycleEvent::Status(changed));
                    }
                    Err(e) => tracing::warn!("Bad ride:status:changed payload: {}", e),
                }
            })
            .await;

        let tx = event_tx.clone();
        let on_cancelled = self
            .connection
            .subscribe(events::RIDE_CANCELLED, move |data| {
                match serde_json::from_value::<RideCancelled>(data.clone()) {
                    Ok(cancelled) => {
                        let _ = tx.send(LifecycleEvent::Cancelled(cancelled));
                    }
                    Err(e) => tracing::warn!("Bad ride:cancelled payload: {}", e),
                }
            })
            .await;

        let tx = event_tx.clone();
        let watched = self.order_id.clone();
        let on_assigned = self
            .connection
            .subscribe(events::ORDER_DRIVER_ASSIGNED, move |data| {
                if let Ok(assigned) = serde_json::from_value::<AssignedDriver>(data.clone()) {
                    if assigned.order_id == watched {
                        let _ = tx.send(LifecycleEvent::Assigned);
                    }
                }
            })
            .await;

        self.subscriptions
            .lock()
            .await
            .extend([on_status, on_cancelled, on_assigned]);

        let (session_id, client_token) = self.credential.pair();
        let join = EventMessage::new(
            events::RIDE_JOIN,
            RideJoin {
                order_id: self.order_id.clone(),
                role: self.role(),
                session_id,
                client_token,
            },
        )?;
        self.connection
            .register_join(&ride_room_key(&self.order_id), join)
            .await;

        if *self.status_tx.borrow() == RideStatus::Completed {
            // Resuming a ride that already finished: settlement is due
            self.payment.enter_pending();
        }

        let lifecycle = Arc::clone(self);
        let task = tokio::spawn(lifecycle.run(event_rx));
        *self.task.lock().await = Some(task);

        tracing::info!("Joined ride room {} as {}", self.order_id, self.role().as_str());
        Ok(())
    }

    /// Driver-only: advance the shared status one step. The client app
    /// must never call this; it only mirrors broadcasts.
    pub async fn update_status(&self, next: RideStatus) -> RideResult<()> {
        if self.role() != Role::Driver {
            return Err(RideError::RoleNotAllowed("ride status update".to_string()));
        }
        if next == RideStatus::Cancelled {
            return Err(RideError::validation("cancellation goes through cancel()"));
        }

        let current = *self.status_tx.borrow();
        if !current.can_advance_to(next) {
            return Err(RideError::InvalidTransition {
                from: current.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        let session_id = self
            .credential
            .session_id()
            .ok_or_else(|| RideError::MissingCredential("driver session".to_string()))?;

        self.connection
            .emit(
                events::RIDE_STATUS_UPDATE,
                RideStatusUpdate {
                    order_id: self.order_id.clone(),
                    session_id,
                    status: next,
                },
            )
            .await?;

        self.status_tx.send_replace(next);
        tracing::info!("Ride {} advanced to {}", self.order_id, next.as_str());

        if next == RideStatus::Completed {
            // Implicit transition into the settlement handshake
            self.payment.enter_pending();
        }
        Ok(())
    }

    /// Cancel the ride from either role. The broadcast reaches the remote
    /// party; local cleanup runs immediately and is idempotent with the
    /// broadcast-driven path.
    pub async fn cancel(&self, reason: Option<String>) -> RideResult<()> {
        let (session_id, client_token) = self.credential.pair();
        self.connection
            .emit(
                events::RIDE_CANCEL,
                RideCancel {
                    order_id: self.order_id.clone(),
                    role: self.role(),
                    reason: reason.clone(),
                    session_id,
                    client_token,
                },
            )
            .await?;

        self.mark_cancelled(RideCancelled {
            order_id: self.order_id.clone(),
            cancelled_by: self.role(),
            reason,
        });
        self.release_resources().await;

        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    /// Tie a ride-scoped subscription (location streams, UI listeners) to
    /// this ride's lifetime: it is unsubscribed by the shared cleanup.
    pub async fn adopt(&self, subscription: Subscription) {
        self.adopted.lock().await.push(subscription);
    }

    /// Shared cleanup for every exit path (cancellation from either side,
    /// payment success). Releases listeners, room registrations and the
    /// persisted ride credentials; safe to run more than once.
    pub async fn release_resources(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for subscription in self.subscriptions.lock().await.drain(..) {
            subscription.unsubscribe().await;
        }
        for subscription in self.adopted.lock().await.drain(..) {
            subscription.unsubscribe().await;
        }
        self.payment.release().await;
        self.connection.unregister_join(&ride_room_key(&self.order_id)).await;
        self.connection
            .unregister_join(&client_session_key(&self.order_id))
            .await;
        if let Err(e) = self.credentials.clear_ride_state().await {
            tracing::warn!("Failed to clear ride state: {}", e);
        }
        tracing::info!("Ride {} resources released", self.order_id);
    }

    fn mark_cancelled(&self, cancelled: RideCancelled) {
        self.status_tx.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = RideStatus::Cancelled;
                true
            }
        });
        self.cancelled_tx.send_replace(Some(cancelled));
    }

    fn mirror_status(&self, next: RideStatus) {
        let applied = self.status_tx.send_if_modified(|current| {
            if *current != next && current.accepts_mirror(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if applied && next == RideStatus::Completed {
            self.payment.enter_pending();
        }
        if !applied {
            tracing::debug!(
                "Ignoring non-monotonic status {} for {}",
                next.as_str(),
                self.order_id
            );
        }
    }

    /// Reconcile against the authoritative order after an assignment (or
    /// any gap the channel may have left behind).
    async fn refresh_order(&self) {
        match self.api.get_order_with_retry(&self.order_id, 3).await {
            Ok(order) => {
                if let Err(e) = self.credentials.cache_order(&order).await {
                    tracing::warn!("Failed to cache order: {}", e);
                }
                if let Some(status) = RideStatus::from_order_status(order.status) {
                    self.mirror_status(status);
                }
            }
            Err(e) => tracing::warn!("Order refresh for {} failed: {}", self.order_id, e),
        }
    }

    async fn run(self: Arc<Self>, mut event_rx: mpsc::UnboundedReceiver<LifecycleEvent>) {
        let mut phase_rx = self.payment.phase();
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(LifecycleEvent::Status(changed)) => {
                        if changed.order_id == self.order_id {
                            self.mirror_status(changed.status);
                        }
                    }
                    Some(LifecycleEvent::Cancelled(cancelled)) => {
                        if cancelled.order_id == self.order_id {
                            tracing::info!(
                                "Ride {} cancelled by {}",
                                self.order_id,
                                cancelled.cancelled_by.as_str()
                            );
                            self.mark_cancelled(cancelled);
                            self.release_resources().await;
                            break;
                        }
                    }
                    Some(LifecycleEvent::Assigned) => {
                        self.refresh_order().await;
                    }
                    None => break,
                },
                changed = phase_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let settled = phase_rx.borrow().is_settled();
                    if settled {
                        tracing::info!("Payment settled for {}", self.order_id);
                        self.release_resources().await;
                        break;
                    }
                }
            }
        }
    }
}
