// src/services/dispatch.rs
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

use crate::errors::{RideError, RideResult};
use crate::models::driver::DriverLoginResponse;
use crate::models::messages::{
    DriverJoin, DriverStatus, EventMessage, JoinError, OrderAccept, OrderDecline, OrderRef, events,
};
use crate::models::ride::Order;
use crate::services::api::RideApi;
use crate::services::connection::{ConnectionManager, Subscription, driver_session_key};
use crate::services::store::CredentialService;

/// Resolution of an accept attempt: the server hands the order to exactly
/// one driver and refuses the rest.
#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    Accepted(Order),
    Refused(String),
}

/// Driver-side order feed and online lifecycle: join the driver session
/// room, keep the pending-offer list current from broadcasts, and race
/// other drivers to accept.
pub struct DriverDispatch {
    connection: Arc<ConnectionManager>,
    api: Arc<dyn RideApi>,
    credentials: Arc<CredentialService>,
    session_id: Mutex<Option<String>>,
    is_online_tx: watch::Sender<bool>,
    pending_tx: watch::Sender<Vec<Order>>,
    accept_tx: watch::Sender<Option<AcceptOutcome>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl DriverDispatch {
    pub fn new(
        connection: Arc<ConnectionManager>,
        api: Arc<dyn RideApi>,
        credentials: Arc<CredentialService>,
    ) -> Arc<Self> {
        let (is_online_tx, _) = watch::channel(false);
        let (pending_tx, _) = watch::channel(Vec::new());
        let (accept_tx, _) = watch::channel(None);
        Arc::new(Self {
            connection,
            api,
            credentials,
            session_id: Mutex::new(None),
            is_online_tx,
            pending_tx,
            accept_tx,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn pending(&self) -> watch::Receiver<Vec<Order>> {
        self.pending_tx.subscribe()
    }

    pub fn accept_outcome(&self) -> watch::Receiver<Option<AcceptOutcome>> {
        self.accept_tx.subscribe()
    }

    pub fn is_online(&self) -> watch::Receiver<bool> {
        self.is_online_tx.subscribe()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    /// Exchange the driver access code for a session, persisting it for
    /// the next app start.
    pub async fn login(&self, code: &str) -> RideResult<DriverLoginResponse> {
        let response = self.api.driver_login(code).await?;
        self.credentials.set_driver_session_id(&response.session.id).await?;
        *self.session_id.lock().await = Some(response.session.id.clone());
        tracing::info!("Driver {} logged in", response.driver.display_name());
        Ok(response)
    }

    /// Reuse a session recovered from the credential store.
    pub async fn resume(&self, session_id: &str) {
        *self.session_id.lock().await = Some(session_id.to_string());
    }

    /// Attach the feed listeners. Idempotent.
    pub async fn start(&self) {
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.is_empty() {
            return;
        }

        let pending = self.pending_tx.clone();
        let on_new = self
            .connection
            .subscribe(events::ORDER_NEW, move |data| {
                match serde_json::from_value::<Order>(data.clone()) {
                    Ok(order) => {
                        pending.send_modify(|list| {
                            if !list.iter().any(|o| o.id == order.id) {
                                list.insert(0, order);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Bad order:new payload: {}", e),
                }
            })
            .await;

        let pending = self.pending_tx.clone();
        let on_pending = self
            .connection
            .subscribe(events::ORDERS_PENDING, move |data| {
                match serde_json::from_value::<Vec<Order>>(data.clone()) {
                    Ok(orders) => {
                        pending.send_replace(orders);
                    }
                    Err(e) => tracing::warn!("Bad orders:pending payload: {}", e),
                }
            })
            .await;

        let pending = self.pending_tx.clone();
        let on_taken = self
            .connection
            .subscribe(events::ORDER_TAKEN, move |data| {
                if let Ok(reference) = serde_json::from_value::<OrderRef>(data.clone()) {
                    pending.send_modify(|list| list.retain(|o| o.id != reference.order_id));
                }
            })
            .await;

        let pending = self.pending_tx.clone();
        let on_expired = self
            .connection
            .subscribe(events::ORDER_EXPIRED, move |data| {
                if let Ok(reference) = serde_json::from_value::<OrderRef>(data.clone()) {
                    pending.send_modify(|list| list.retain(|o| o.id != reference.order_id));
                }
            })
            .await;

        let pending = self.pending_tx.clone();
        let accept = self.accept_tx.clone();
        let on_accept_success = self
            .connection
            .subscribe(events::ORDER_ACCEPT_SUCCESS, move |data| {
                match serde_json::from_value::<Order>(data.clone()) {
                    Ok(order) => {
                        pending.send_modify(|list| list.retain(|o| o.id != order.id));
                        accept.send_replace(Some(AcceptOutcome::Accepted(order)));
                    }
                    Err(e) => tracing::warn!("Bad order:accept:success payload: {}", e),
                }
            })
            .await;

        let accept = self.accept_tx.clone();
        let on_accept_error = self
            .connection
            .subscribe(events::ORDER_ACCEPT_ERROR, move |data| {
                if let Ok(err) = serde_json::from_value::<JoinError>(data.clone()) {
                    accept.send_replace(Some(AcceptOutcome::Refused(err.message)));
                }
            })
            .await;

        subscriptions.extend([
            on_new,
            on_pending,
            on_taken,
            on_expired,
            on_accept_success,
            on_accept_error,
        ]);
    }

    /// Toggle availability. The session join is registered for replay, the
    /// channel is told right away, and the authoritative PATCH follows; an
    /// HTTP failure rolls the local flag back so the UI never lies.
    pub async fn set_online(&self, online: bool) -> RideResult<()> {
        let session_id = self.require_session().await?;

        if online {
            let join = EventMessage::new(
                events::DRIVER_JOIN,
                DriverJoin { session_id: session_id.clone() },
            )?;
            self.connection.register_join(&driver_session_key(), join).await;
        }

        self.connection
            .emit(
                events::DRIVER_STATUS,
                DriverStatus { session_id: session_id.clone(), is_online: online },
            )
            .await?;
        let previous = self.is_online_tx.send_replace(online);

        if let Err(e) = self.api.set_driver_online(&session_id, online).await {
            tracing::warn!("Driver status PATCH failed, rolling back: {}", e);
            self.is_online_tx.send_replace(previous);
            return Err(e);
        }
        Ok(())
    }

    pub async fn accept(&self, order_id: &str) -> RideResult<()> {
        let session_id = self.require_session().await?;
        self.connection
            .emit(
                events::ORDER_ACCEPT,
                OrderAccept { order_id: order_id.to_string(), session_id },
            )
            .await
    }

    pub async fn decline(&self, order_id: &str) -> RideResult<()> {
        let session_id = self.require_session().await?;
        self.connection
            .emit(
                events::ORDER_DECLINE,
                OrderDecline { order_id: order_id.to_string(), session_id },
            )
            .await
    }

    /// Drop the session: unregister the replayed join, forget the stored
    /// session id and detach the feed.
    pub async fn logout(&self) -> RideResult<()> {
        self.connection.unregister_join(&driver_session_key()).await;
        for subscription in self.subscriptions.lock().await.drain(..) {
            subscription.unsubscribe().await;
        }
        self.credentials.remove_driver_session_id().await?;
        *self.session_id.lock().await = None;
        self.is_online_tx.send_replace(false);
        Ok(())
    }

    async fn require_session(&self) -> RideResult<String> {
        self.session_id
            .lock()
            .await
            .clone()
            .ok_or_else(|| RideError::MissingCredential("driver session".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ride::{
        AddressField, AddressKind, OrderRideOption, OrderStatus, PaymentMethod,
    };
    use crate::services::api::MockRideApi;
    use crate::services::connection::{MockTransport, ReconnectPolicy};
    use crate::services::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn sample_order(id: &str) -> Order {
        Order {
            id: id.to_string(),
            client_id: None,
            client_name: "Teva Marama".to_string(),
            client_phone: "+68987112233".to_string(),
            addresses: vec![AddressField {
                id: "pickup".to_string(),
                value: "Marina Taina".to_string(),
                place_id: None,
                kind: AddressKind::Pickup,
                lat: None,
                lng: None,
            }],
            ride_option: OrderRideOption {
                id: "immediate".to_string(),
                title: "Taxi immédiat".to_string(),
                price: 2300.0,
                price_per_km: 150.0,
            },
            route_info: None,
            passengers: 1,
            supplements: vec![],
            payment_method: PaymentMethod::Cash,
            total_price: 2300.0,
            driver_earnings: 1840.0,
            scheduled_time: None,
            is_advance_booking: false,
            status: OrderStatus::Pending,
            assigned_driver_id: None,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        dispatch: Arc<DriverDispatch>,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let connection = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());
        connection.connect_and_wait().await.unwrap();
        let credentials = Arc::new(CredentialService::new(Arc::new(MemoryStore::new())));
        let dispatch = DriverDispatch::new(connection, Arc::new(MockRideApi::new()), credentials);
        dispatch.start().await;
        Fixture { transport, dispatch }
    }

    async fn wait_pending_len(rx: &mut watch::Receiver<Vec<Order>>, len: usize) {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if rx.borrow().len() == len {
                    return;
                }
                rx.changed().await.expect("pending channel closed");
            }
        })
        .await
        .expect("pending list did not reach expected length");
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_dedupes_new_orders() {
        let f = fixture().await;
        let mut pending = f.dispatch.pending();

        let order = serde_json::to_value(sample_order("ord-1")).unwrap();
        f.transport.push_server_event(events::ORDER_NEW, order.clone());
        f.transport.push_server_event(events::ORDER_NEW, order);

        wait_pending_len(&mut pending, 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pending.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_broadcast_replaces_list() {
        let f = fixture().await;
        let mut pending = f.dispatch.pending();

        f.transport.push_server_event(
            events::ORDER_NEW,
            serde_json::to_value(sample_order("ord-old")).unwrap(),
        );
        wait_pending_len(&mut pending, 1).await;

        let fresh = vec![sample_order("ord-1"), sample_order("ord-2")];
        f.transport
            .push_server_event(events::ORDERS_PENDING, serde_json::to_value(fresh).unwrap());

        wait_pending_len(&mut pending, 2).await;
        assert!(pending.borrow().iter().all(|o| o.id != "ord-old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_taken_and_expired_remove_offers() {
        let f = fixture().await;
        let mut pending = f.dispatch.pending();

        let fresh = vec![sample_order("ord-1"), sample_order("ord-2")];
        f.transport
            .push_server_event(events::ORDERS_PENDING, serde_json::to_value(fresh).unwrap());
        wait_pending_len(&mut pending, 2).await;

        f.transport.push_server_event(events::ORDER_TAKEN, json!({ "orderId": "ord-1" }));
        wait_pending_len(&mut pending, 1).await;

        f.transport.push_server_event(events::ORDER_EXPIRED, json!({ "orderId": "ord-2" }));
        wait_pending_len(&mut pending, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_resolution() {
        let f = fixture().await;
        f.dispatch.resume("session-1").await;
        let mut pending = f.dispatch.pending();
        let mut outcome = f.dispatch.accept_outcome();

        f.transport.push_server_event(
            events::ORDER_NEW,
            serde_json::to_value(sample_order("ord-1")).unwrap(),
        );
        wait_pending_len(&mut pending, 1).await;

        f.dispatch.accept("ord-1").await.unwrap();
        let sent = f.transport.sent_messages();
        let accept_frame = sent.iter().find(|m| m.event == events::ORDER_ACCEPT).unwrap();
        assert_eq!(accept_frame.data["orderId"], "ord-1");
        assert_eq!(accept_frame.data["sessionId"], "session-1");

        f.transport.push_server_event(
            events::ORDER_ACCEPT_SUCCESS,
            serde_json::to_value(sample_order("ord-1")).unwrap(),
        );

        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if matches!(*outcome.borrow(), Some(AcceptOutcome::Accepted(_))) {
                    break;
                }
                outcome.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(pending.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_refusal_surfaces_message() {
        let f = fixture().await;
        f.dispatch.resume("session-1").await;
        let mut outcome = f.dispatch.accept_outcome();

        f.transport.push_server_event(
            events::ORDER_ACCEPT_ERROR,
            json!({ "message": "Course déjà attribuée" }),
        );

        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if let Some(AcceptOutcome::Refused(message)) = &*outcome.borrow() {
                    assert_eq!(message, "Course déjà attribuée");
                    break;
                }
                outcome.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_rolls_back_on_http_failure() {
        let f = fixture().await;
        // A session the mock API does not know: the PATCH fails
        f.dispatch.resume("session-bogus").await;

        let result = f.dispatch.set_online(true).await;
        assert!(result.is_err());
        assert!(!*f.dispatch.is_online().borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_without_session_is_refused_locally() {
        let f = fixture().await;
        let result = f.dispatch.accept("ord-1").await;
        assert!(matches!(result, Err(RideError::MissingCredential(_))));
    }
}
