// src/services/api.rs
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{RideError, RideResult};
use crate::models::driver::{Driver, DriverLoginResponse, SessionRef};
use crate::models::ride::{
    ActiveOrderResponse, CreateOrderResponse, DriverActiveOrderResponse, Order, OrderStatus,
    RideRequest,
};
use crate::models::user::{AuthResponse, Client, RegisterRequest, VerifyRequest};
use crate::services::store::CredentialService;

/// HTTP surface of the ride-coordination server. Realtime traffic goes over
/// the channel; this is the authoritative, re-queryable side.
#[async_trait]
pub trait RideApi: Send + Sync {
    async fn create_order(&self, request: RideRequest) -> RideResult<CreateOrderResponse>;
    async fn get_order(&self, order_id: &str) -> RideResult<Order>;
    async fn active_client_order(&self) -> RideResult<ActiveOrderResponse>;
    async fn active_driver_order(&self, session_id: &str) -> RideResult<DriverActiveOrderResponse>;

    async fn driver_login(&self, code: &str) -> RideResult<DriverLoginResponse>;
    async fn set_driver_online(&self, session_id: &str, is_online: bool) -> RideResult<()>;

    // Credential bootstrap; the protocol core only consumes the session id
    async fn login(&self, phone: &str, password: &str) -> RideResult<AuthResponse>;
    async fn register(&self, request: RegisterRequest) -> RideResult<AuthResponse>;
    async fn verify(&self, request: VerifyRequest) -> RideResult<AuthResponse>;
    async fn me(&self) -> RideResult<Client>;
    async fn logout(&self) -> RideResult<()>;

    /// Bounded-retry fetch for the idempotent order read. Only retryable
    /// classes (network, 5xx, timeout) are re-attempted.
    async fn get_order_with_retry(&self, order_id: &str, max_attempts: u32) -> RideResult<Order> {
        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.get_order(order_id).await {
                Ok(order) => return Ok(order),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        "get_order attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

pub struct HttpRideApi {
    config: ApiConfig,
    client: reqwest::Client,
    credentials: Arc<CredentialService>,
}

impl HttpRideApi {
    pub fn new(config: ApiConfig, credentials: Arc<CredentialService>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client, credentials }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    /// Session auth rides on a cookie header, matching the server's
    /// cookie-based session handling.
    async fn session_cookie(&self) -> Option<String> {
        let session_id = self.credentials.client_session_id().await.ok().flatten()?;
        Some(format!("clientSessionId={}", session_id))
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> RideResult<T> {
        let mut request = request.header("Content-Type", "application/json");
        if let Some(cookie) = self.session_cookie().await {
            request = request.header("Cookie", cookie);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(RideError::from_response(status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(RideError::from)
    }
}

#[async_trait]
impl RideApi for HttpRideApi {
    async fn create_order(&self, request: RideRequest) -> RideResult<CreateOrderResponse> {
        tracing::info!("Creating order for {}", request.client_name);
        self.execute(self.client.post(self.url("/api/orders")).json(&request))
            .await
    }

    async fn get_order(&self, order_id: &str) -> RideResult<Order> {
        self.execute(self.client.get(self.url(&format!("/api/orders/{}", order_id))))
            .await
    }

    async fn active_client_order(&self) -> RideResult<ActiveOrderResponse> {
        self.execute(self.client.get(self.url("/api/orders/active/client")))
            .await
    }

    async fn active_driver_order(&self, session_id: &str) -> RideResult<DriverActiveOrderResponse> {
        self.execute(
            self.client
                .get(self.url("/api/orders/active/driver"))
                .query(&[("sessionId", session_id)]),
        )
        .await
    }

    async fn driver_login(&self, code: &str) -> RideResult<DriverLoginResponse> {
        self.execute(
            self.client
                .post(self.url("/api/driver/login"))
                .json(&json!({ "code": code })),
        )
        .await
    }

    async fn set_driver_online(&self, session_id: &str, is_online: bool) -> RideResult<()> {
        let _: serde_json::Value = self
            .execute(
                self.client
                    .patch(self.url(&format!("/api/driver-sessions/{}/status", session_id)))
                    .json(&json!({ "isOnline": is_online })),
            )
            .await?;
        Ok(())
    }

    async fn login(&self, phone: &str, password: &str) -> RideResult<AuthResponse> {
        self.execute(
            self.client
                .post(self.url("/api/auth/login"))
                .json(&json!({ "phone": phone, "password": password })),
        )
        .await
    }

    async fn register(&self, request: RegisterRequest) -> RideResult<AuthResponse> {
        self.execute(self.client.post(self.url("/api/auth/register")).json(&request))
            .await
    }

    async fn verify(&self, request: VerifyRequest) -> RideResult<AuthResponse> {
        self.execute(self.client.post(self.url("/api/auth/verify")).json(&request))
            .await
    }

    async fn me(&self) -> RideResult<Client> {
        self.execute(self.client.get(self.url("/api/auth/me"))).await
    }

    async fn logout(&self) -> RideResult<()> {
        let _: serde_json::Value = self
            .execute(self.client.post(self.url("/api/auth/logout")))
            .await?;
        Ok(())
    }
}

// Mock API for development and testing: an in-memory order book plus the
// development driver codes.
pub struct MockRideApi {
    orders: RwLock<HashMap<String, Order>>,
    tokens: RwLock<HashMap<String, String>>,
    sessions: RwLock<HashMap<String, String>>, // session id -> driver id
    fail_next_gets: std::sync::atomic::AtomicUsize,
}

fn mock_drivers() -> Vec<(&'static str, Driver)> {
    vec![
        (
            "111111",
            Driver {
                id: "driver-1".to_string(),
                phone: "+68987123456".to_string(),
                first_name: "Jean".to_string(),
                last_name: "Dupont".to_string(),
                vehicle_model: Some("Toyota Prius".to_string()),
                vehicle_color: Some("Blanc".to_string()),
                vehicle_plate: Some("AB-123-CD".to_string()),
                is_active: true,
                average_rating: None,
                total_rides: 0,
            },
        ),
        (
            "222222",
            Driver {
                id: "driver-2".to_string(),
                phone: "+68987234567".to_string(),
                first_name: "Marie".to_string(),
                last_name: "Martin".to_string(),
                vehicle_model: Some("Nissan Leaf".to_string()),
                vehicle_color: Some("Rouge".to_string()),
                vehicle_plate: Some("EF-456-GH".to_string()),
                is_active: true,
                average_rating: None,
                total_rides: 0,
            },
        ),
    ]
}

impl MockRideApi {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            fail_next_gets: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Make the next `n` order reads fail with a network error, to
    /// exercise cache fallbacks and retry paths.
    pub fn fail_next_gets(&self, n: usize) {
        self.fail_next_gets.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn set_order_status(&self, order_id: &str, status: OrderStatus) {
        if let Some(order) = self.orders.write().await.get_mut(order_id) {
            order.status = status;
        }
    }

    pub async fn assign_driver(&self, order_id: &str, driver_id: &str) {
        if let Some(order) = self.orders.write().await.get_mut(order_id) {
            order.status = OrderStatus::Accepted;
            order.assigned_driver_id = Some(driver_id.to_string());
        }
    }
}

impl Default for MockRideApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RideApi for MockRideApi {
    async fn create_order(&self, request: RideRequest) -> RideResult<CreateOrderResponse> {
        if request.addresses.is_empty() {
            return Err(RideError::validation("Adresse de départ requise"));
        }

        let id = format!("ord-{}", &Uuid::new_v4().to_string()[..8]);
        let client_token = format!("tok-{}", Uuid::new_v4());
        let now = Utc::now();

        let order = Order {
            id: id.clone(),
            client_id: None,
            client_name: request.client_name,
            client_phone: request.client_phone,
            addresses: request.addresses,
            ride_option: request.ride_option,
            route_info: request.route_info,
            passengers: request.passengers,
            supplements: request.supplements,
            payment_method: request.payment_method,
            total_price: request.total_price,
            driver_earnings: request.driver_earnings,
            scheduled_time: request.scheduled_time,
            is_advance_booking: request.is_advance_booking,
            status: OrderStatus::Pending,
            assigned_driver_id: None,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(60),
        };

        self.orders.write().await.insert(id.clone(), order.clone());
        self.tokens.write().await.insert(id, client_token.clone());

        Ok(CreateOrderResponse { order, client_token })
    }

    async fn get_order(&self, order_id: &str) -> RideResult<Order> {
        use std::sync::atomic::Ordering;
        if self.fail_next_gets.load(Ordering::SeqCst) > 0 {
            self.fail_next_gets.fetch_sub(1, Ordering::SeqCst);
            return Err(RideError::network("simulated outage"));
        }
        self.orders
            .read()
            .await
            .get(order_id)
            .cloned()
            .ok_or_else(|| RideError::OrderNotFound(order_id.to_string()))
    }

    async fn active_client_order(&self) -> RideResult<ActiveOrderResponse> {
        let orders = self.orders.read().await;
        let active = orders.values().find(|o| !o.is_terminal()).cloned();
        let client_token = match &active {
            Some(order) => self.tokens.read().await.get(&order.id).cloned(),
            None => None,
        };
        Ok(ActiveOrderResponse {
            has_active_order: active.is_some(),
            order: active,
            client_token,
        })
    }

    async fn active_driver_order(&self, session_id: &str) -> RideResult<DriverActiveOrderResponse> {
        let driver_id = self.sessions.read().await.get(session_id).cloned();
        let orders = self.orders.read().await;
        let active = orders
            .values()
            .find(|o| !o.is_terminal() && o.assigned_driver_id == driver_id && driver_id.is_some())
            .cloned();
        Ok(DriverActiveOrderResponse { has_active_order: active.is_some(), order: active })
    }

    async fn driver_login(&self, code: &str) -> RideResult<DriverLoginResponse> {
        let driver = mock_drivers()
            .into_iter()
            .find(|(c, _)| *c == code)
            .map(|(_, d)| d)
            .ok_or_else(|| RideError::auth("Code incorrect"))?;

        let session_id = format!("session-{}", Uuid::new_v4());
        self.sessions.write().await.insert(session_id.clone(), driver.id.clone());

        Ok(DriverLoginResponse {
            success: true,
            driver,
            session: SessionRef { id: session_id },
        })
    }

    async fn set_driver_online(&self, session_id: &str, _is_online: bool) -> RideResult<()> {
        if !self.sessions.read().await.contains_key(session_id) {
            return Err(RideError::auth("Session inconnue"));
        }
        Ok(())
    }

    async fn login(&self, phone: &str, _password: &str) -> RideResult<AuthResponse> {
        Ok(AuthResponse {
            success: true,
            client: Some(Client {
                id: "client-1".to_string(),
                phone: phone.to_string(),
                first_name: "Test".to_string(),
                last_name: "Utilisateur".to_string(),
                email: None,
                is_verified: true,
                wallet_balance: 0.0,
                average_rating: None,
                total_rides: 0,
            }),
            session: Some(SessionRef { id: format!("session-{}", Uuid::new_v4()) }),
            needs_verification: false,
            phone: Some(phone.to_string()),
            error: None,
        })
    }

    async fn register(&self, request: RegisterRequest) -> RideResult<AuthResponse> {
        self.login(&request.phone, &request.password).await
    }

    async fn verify(&self, request: VerifyRequest) -> RideResult<AuthResponse> {
        if request.code == "000000" {
            return Err(RideError::validation("Code invalide ou expiré"));
        }
        self.login(&request.phone, "").await
    }

    async fn me(&self) -> RideResult<Client> {
        Err(RideError::auth("Session expirée. Veuillez vous reconnecter."))
    }

    async fn logout(&self) -> RideResult<()> {
        Ok(())
    }
}
