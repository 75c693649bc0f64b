// src/services/orchestrator.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::models::messages::{ClientJoin, EventMessage, JoinError, OrderRef, events};
use crate::models::ride::{AssignedDriver, RideRequest};
use crate::services::api::RideApi;
use crate::services::connection::{ConnectionManager, Subscription, client_session_key};
use crate::services::store::CredentialService;

/// Client-local defence in depth: the server enforces its own expiry, but
/// the search screen must never wait forever.
const SEARCH_EXPIRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum SearchState {
    Creating,
    Searching,
    Found(AssignedDriver),
    Expired,
    Error(String),
}

impl SearchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SearchState::Creating | SearchState::Searching)
    }
}

enum SearchEvent {
    Assigned(AssignedDriver),
    Expired,
    JoinError(String),
}

/// Creates a ride over HTTP, then drives `creating → searching →
/// {found, expired, error}` from channel events and the local expiry timer.
pub struct RideRequestOrchestrator {
    api: Arc<dyn RideApi>,
    credentials: Arc<CredentialService>,
    connection: Arc<ConnectionManager>,
}

impl RideRequestOrchestrator {
    pub fn new(
        api: Arc<dyn RideApi>,
        credentials: Arc<CredentialService>,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        Self { api, credentials, connection }
    }

    /// Submit a ride request. The request is immutable once submitted;
    /// calling `begin` again creates a brand-new ride.
    pub async fn begin(&self, request: RideRequest) -> RideSearch {
        let (state_tx, state_rx) = watch::channel(SearchState::Creating);

        let control = Arc::new(SearchControl {
            connection: Arc::clone(&self.connection),
            credentials: Arc::clone(&self.credentials),
            state_tx,
            ride: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });

        let api = Arc::clone(&self.api);
        let task_control = Arc::clone(&control);
        let task = tokio::spawn(async move {
            task_control.run(api, request).await;
        });
        *control.task.lock().await = Some(task);

        RideSearch { state_rx, control }
    }
}

struct SearchControl {
    connection: Arc<ConnectionManager>,
    credentials: Arc<CredentialService>,
    state_tx: watch::Sender<SearchState>,
    ride: Mutex<Option<(String, String)>>, // (order id, client token)
    subscriptions: Mutex<Vec<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SearchControl {
    /// Move to a terminal state, at most once.
    fn finish(&self, state: SearchState) {
        self.state_tx.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn run(self: &Arc<Self>, api: Arc<dyn RideApi>, request: RideRequest) {
        let created = match api.create_order(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Order creation failed: {}", e);
                self.finish(SearchState::Error(e.user_message()));
                return;
            }
        };

        let order_id = created.order.id.clone();
        let client_token = created.client_token.clone();
        tracing::info!("Order {} created, joining as client", order_id);

        // Persist before any further step so a restart mid-flow can recover
        if let Err(e) = self.credentials.persist_ride(&order_id, &client_token).await {
            tracing::warn!("Failed to persist ride credentials: {}", e);
        }
        *self.ride.lock().await = Some((order_id.clone(), client_token.clone()));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SearchEvent>();

        let tx = event_tx.clone();
        let watched = order_id.clone();
        let on_assigned = self
            .connection
            .subscribe(events::ORDER_DRIVER_ASSIGNED, move |data| {
                match serde_json::from_value::<AssignedDriver>(data.clone()) {
                    Ok(assigned) if assigned.order_id == watched => {
                        let _ = tx.send(SearchEvent::Assigned(assigned));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Bad driver-assigned payload: {}", e),
                }
            })
            .await;

        let tx = event_tx.clone();
        let watched = order_id.clone();
        let on_expired = self
            .connection
            .subscribe(events::ORDER_EXPIRED, move |data| {
                if let Ok(reference) = serde_json::from_value::<OrderRef>(data.clone()) {
                    if reference.order_id == watched {
                        let _ = tx.send(SearchEvent::Expired);
                    }
                }
            })
            .await;

        let tx = event_tx.clone();
        let on_join_error = self
            .connection
            .subscribe(events::CLIENT_JOIN_ERROR, move |data| {
                if let Ok(err) = serde_json::from_value::<JoinError>(data.clone()) {
                    let _ = tx.send(SearchEvent::JoinError(err.message));
                }
            })
            .await;

        self.subscriptions
            .lock()
            .await
            .extend([on_assigned, on_expired, on_join_error]);

        // Join the driver-broadcast room for this ride; replayed on every
        // reconnect until the search ends.
        match EventMessage::new(
            events::CLIENT_JOIN,
            ClientJoin { order_id: order_id.clone(), client_token },
        ) {
            Ok(join) => {
                self.connection
                    .register_join(&client_session_key(&order_id), join)
                    .await
            }
            Err(e) => {
                self.finish(SearchState::Error(e.user_message()));
                return;
            }
        }

        // Socket trouble is not fatal here: the join is registered and the
        // background loop keeps retrying.
        if let Err(e) = self.connection.connect_and_wait().await {
            tracing::warn!("Socket not up yet, searching anyway: {}", e);
        }

        self.state_tx.send_replace(SearchState::Searching);

        let expiry = tokio::time::sleep(SEARCH_EXPIRY);
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                _ = &mut expiry => {
                    tracing::info!("Search for {} expired locally", order_id);
                    self.finish(SearchState::Expired);
                    break;
                }
                event = event_rx.recv() => match event {
                    Some(SearchEvent::Assigned(assigned)) => {
                        tracing::info!("Driver {} assigned to {}", assigned.driver_name, order_id);
                        self.finish(SearchState::Found(assigned));
                        break;
                    }
                    Some(SearchEvent::Expired) => {
                        self.finish(SearchState::Expired);
                        break;
                    }
                    Some(SearchEvent::JoinError(message)) => {
                        self.finish(SearchState::Error(message));
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    async fn release(&self) {
        for subscription in self.subscriptions.lock().await.drain(..) {
            subscription.unsubscribe().await;
        }
        if let Some((order_id, _)) = self.ride.lock().await.clone() {
            self.connection.unregister_join(&client_session_key(&order_id)).await;
        }
        if let Err(e) = self.credentials.clear_ride_state().await {
            tracing::warn!("Failed to clear ride state: {}", e);
        }
    }
}

/// Handle onto one submitted search.
pub struct RideSearch {
    state_rx: watch::Receiver<SearchState>,
    control: Arc<SearchControl>,
}

impl RideSearch {
    pub fn status(&self) -> watch::Receiver<SearchState> {
        self.state_rx.clone()
    }

    /// Ride id and client token, once the order has been created.
    pub async fn ride(&self) -> Option<(String, String)> {
        self.control.ride.lock().await.clone()
    }

    /// User-initiated abort. Clears the persisted ride token and id and
    /// releases the room registration; afterwards no partial ride remains
    /// addressable from this client. Safe to call more than once.
    pub async fn cancel(&self) {
        if let Some(task) = self.control.task.lock().await.take() {
            task.abort();
        }
        self.control.release().await;
        tracing::info!("Ride search cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ride::{
        AddressField, AddressKind, OrderRideOption, PaymentMethod,
    };
    use crate::services::api::MockRideApi;
    use crate::services::connection::{MockTransport, ReconnectPolicy};
    use crate::services::store::MemoryStore;
    use serde_json::json;

    fn sample_request(addresses: Vec<AddressField>) -> RideRequest {
        RideRequest {
            client_name: "Teva Marama".to_string(),
            client_phone: "+68987112233".to_string(),
            addresses,
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
            selected_card_id: None,
            total_price: 2300.0,
            driver_earnings: 1840.0,
            scheduled_time: None,
            is_advance_booking: false,
        }
    }

    fn pickup_and_destination() -> Vec<AddressField> {
        vec![
            AddressField {
                id: "pickup".to_string(),
                value: "Marina Taina".to_string(),
                place_id: None,
                kind: AddressKind::Pickup,
                lat: Some(-17.58),
                lng: Some(-149.61),
            },
            AddressField {
                id: "destination".to_string(),
                value: "Papeete centre".to_string(),
                place_id: None,
                kind: AddressKind::Destination,
                lat: Some(-17.53),
                lng: Some(-149.57),
            },
        ]
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        connection: Arc<ConnectionManager>,
        credentials: Arc<CredentialService>,
        orchestrator: RideRequestOrchestrator,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let connection =
            ConnectionManager::new(transport.clone(), ReconnectPolicy::default());
        let credentials = Arc::new(CredentialService::new(Arc::new(MemoryStore::new())));
        let orchestrator = RideRequestOrchestrator::new(
            Arc::new(MockRideApi::new()),
            credentials.clone(),
            connection.clone(),
        );
        Fixture { transport, connection, credentials, orchestrator }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<SearchState>,
        predicate: impl Fn(&SearchState) -> bool,
    ) -> SearchState {
        // Safety net must exceed the 60s client-local expiry timer; under
        // `start_paused` the clock auto-advances to the nearest deadline, so a
        // shorter timeout would fire before the expiry it is meant to observe.
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                if predicate(&rx.borrow()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.expect("state channel closed");
            }
        })
        .await
        .expect("expected state not reached")
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_reaches_found_on_assignment() {
        let f = fixture();
        let search = f.orchestrator.begin(sample_request(pickup_and_destination())).await;
        let mut rx = search.status();

        wait_for_state(&mut rx, |s| *s == SearchState::Searching).await;

        // Token and ride id were persisted before the join
        let (order_id, token) = search.ride().await.unwrap();
        assert_eq!(f.credentials.current_order_id().await.unwrap().unwrap(), order_id);
        assert_eq!(f.credentials.client_token().await.unwrap().unwrap(), token);

        f.transport.push_server_event(
            events::ORDER_DRIVER_ASSIGNED,
            json!({
                "orderId": order_id,
                "driverName": "Jean Dupont",
                "driverId": "driver-1",
                "sessionId": "session-1",
            }),
        );

        let state = wait_for_state(&mut rx, |s| s.is_terminal()).await;
        match state {
            SearchState::Found(assigned) => assert_eq!(assigned.driver_id, "driver-1"),
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_assignment_for_other_ride_is_ignored() {
        let f = fixture();
        let search = f.orchestrator.begin(sample_request(pickup_and_destination())).await;
        let mut rx = search.status();
        wait_for_state(&mut rx, |s| *s == SearchState::Searching).await;

        f.transport.push_server_event(
            events::ORDER_DRIVER_ASSIGNED,
            json!({
                "orderId": "ord-someone-else",
                "driverName": "Marie Martin",
                "driverId": "driver-2",
                "sessionId": "session-2",
            }),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*rx.borrow(), SearchState::Searching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_expires_exactly_once() {
        let f = fixture();
        let search = f.orchestrator.begin(sample_request(pickup_and_destination())).await;
        let mut rx = search.status();
        wait_for_state(&mut rx, |s| *s == SearchState::Searching).await;

        let mut transitions = Vec::new();
        let state = wait_for_state(&mut rx, |s| s.is_terminal()).await;
        transitions.push(state.clone());
        assert_eq!(state, SearchState::Expired);

        // Nothing further fires after the terminal state
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(transitions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_expiry_event_wins_over_timer() {
        let f = fixture();
        let search = f.orchestrator.begin(sample_request(pickup_and_destination())).await;
        let mut rx = search.status();
        wait_for_state(&mut rx, |s| *s == SearchState::Searching).await;

        let (order_id, _) = search.ride().await.unwrap();
        f.transport.push_server_event(events::ORDER_EXPIRED, json!({ "orderId": order_id }));

        let state = wait_for_state(&mut rx, |s| s.is_terminal()).await;
        assert_eq!(state, SearchState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_failure_surfaces_server_message() {
        let f = fixture();
        // Empty address list makes the mock reject the draft
        let search = f.orchestrator.begin(sample_request(vec![])).await;
        let mut rx = search.status();

        let state = wait_for_state(&mut rx, |s| s.is_terminal()).await;
        assert_eq!(state, SearchState::Error("Adresse de départ requise".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_error_surfaces_message() {
        let f = fixture();
        let search = f.orchestrator.begin(sample_request(pickup_and_destination())).await;
        let mut rx = search.status();
        wait_for_state(&mut rx, |s| *s == SearchState::Searching).await;

        f.transport
            .push_server_event(events::CLIENT_JOIN_ERROR, json!({ "message": "Token invalide" }));

        let state = wait_for_state(&mut rx, |s| s.is_terminal()).await;
        assert_eq!(state, SearchState::Error("Token invalide".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_persisted_state_and_join() {
        let f = fixture();
        let search = f.orchestrator.begin(sample_request(pickup_and_destination())).await;
        let mut rx = search.status();
        wait_for_state(&mut rx, |s| *s == SearchState::Searching).await;

        let sent_before = f.transport.sent_messages().len();
        search.cancel().await;

        assert!(f.credentials.client_token().await.unwrap().is_none());
        assert!(f.credentials.current_order_id().await.unwrap().is_none());

        // The join is no longer replayed after a reconnect
        f.transport.drop_connection();
        let connection = f.connection.clone();
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if connection.is_connected() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.transport.sent_messages().len(), sent_before);

        // Idempotent
        search.cancel().await;
    }
}
