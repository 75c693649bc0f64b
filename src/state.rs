// src/state.rs
use std::sync::Arc;

use crate::errors::{RideError, RideResult};
use crate::models::ride::{Order, Role};
use crate::services::api::{ApiConfig, HttpRideApi, MockRideApi, RideApi};
use crate::services::connection::{ConnectionManager, ReconnectPolicy, Transport, WsTransport};
use crate::services::dispatch::DriverDispatch;
use crate::services::lifecycle::{RideCredential, RideLifecycle};
use crate::services::location::LocationChannel;
use crate::services::orchestrator::RideRequestOrchestrator;
use crate::services::store::{CredentialService, CredentialStore, MemoryStore};

/// Optional native modules, probed once at startup and injected; nothing
/// else in the codebase checks availability on its own.
#[derive(Debug, Clone, Copy)]
pub struct PlatformCapabilities {
    pub has_maps: bool,
    pub has_native_payments: bool,
}

impl PlatformCapabilities {
    pub fn headless() -> Self {
        Self { has_maps: false, has_native_payments: false }
    }

    pub fn full() -> Self {
        Self { has_maps: true, has_native_payments: true }
    }
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self::headless()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub socket_url: String,
    pub reconnect: ReconnectPolicy,
    pub use_mock_api: bool,
    pub capabilities: PlatformCapabilities,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            socket_url: "ws://localhost:5000/socket".to_string(),
            reconnect: ReconnectPolicy::default(),
            use_mock_api: false,
            capabilities: PlatformCapabilities::default(),
        }
    }
}

/// Composition root. Owns the single connection manager and the services
/// built around it; per-ride state machines are created on demand.
pub struct AppState {
    pub credentials: Arc<CredentialService>,
    pub api: Arc<dyn RideApi>,
    pub connection: Arc<ConnectionManager>,
    pub orchestrator: RideRequestOrchestrator,
    pub dispatch: Arc<DriverDispatch>,
    pub location: Arc<LocationChannel>,
    pub capabilities: PlatformCapabilities,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Supply the platform's secure store.
    pub fn with_store(config: AppConfig, store: Arc<dyn CredentialStore>) -> Self {
        let credentials = Arc::new(CredentialService::new(store));
        let api: Arc<dyn RideApi> = if config.use_mock_api {
            tracing::warn!("Mock ride API enabled, orders stay in-process");
            Arc::new(MockRideApi::new())
        } else {
            Arc::new(HttpRideApi::new(config.api.clone(), Arc::clone(&credentials)))
        };
        let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(config.socket_url.clone()));
        Self::assemble(config, credentials, api, transport)
    }

    /// Full dependency injection, used by tests with fake transports.
    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn CredentialStore>,
        api: Arc<dyn RideApi>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let credentials = Arc::new(CredentialService::new(store));
        Self::assemble(config, credentials, api, transport)
    }

    fn assemble(
        config: AppConfig,
        credentials: Arc<CredentialService>,
        api: Arc<dyn RideApi>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let connection = ConnectionManager::new(transport, config.reconnect.clone());
        let orchestrator = RideRequestOrchestrator::new(
            Arc::clone(&api),
            Arc::clone(&credentials),
            Arc::clone(&connection),
        );
        let dispatch = DriverDispatch::new(
            Arc::clone(&connection),
            Arc::clone(&api),
            Arc::clone(&credentials),
        );
        let location = Arc::new(LocationChannel::new(Arc::clone(&connection)));

        Self {
            credentials,
            api,
            connection,
            orchestrator,
            dispatch,
            location,
            capabilities: config.capabilities,
        }
    }

    /// Join a ride room with the stored credential for the given role.
    pub async fn join_ride(&self, order: &Order, role: Role) -> RideResult<Arc<RideLifecycle>> {
        let credential = match role {
            Role::Client => {
                let token = self
                    .credentials
                    .client_token()
                    .await?
                    .ok_or_else(|| RideError::MissingCredential("ride client token".to_string()))?;
                RideCredential::Client { token }
            }
            Role::Driver => {
                let session_id = self
                    .credentials
                    .driver_session_id()
                    .await?
                    .ok_or_else(|| RideError::MissingCredential("driver session".to_string()))?;
                RideCredential::Driver { session_id }
            }
        };

        let lifecycle = RideLifecycle::new(
            order,
            credential,
            Arc::clone(&self.connection),
            Arc::clone(&self.credentials),
            Arc::clone(&self.api),
        );
        lifecycle.join().await?;
        Ok(lifecycle)
    }

    /// Recover an ongoing ride after an app restart: stored ride id first,
    /// then the active-order endpoint; the authoritative fetch falls back
    /// to the short-TTL cache when the network is flapping.
    pub async fn resume_client_ride(&self) -> RideResult<Option<Arc<RideLifecycle>>> {
        let mut order_id = self.credentials.current_order_id().await?;
        let mut token = self.credentials.client_token().await?;

        if order_id.is_none() {
            let active = self.api.active_client_order().await?;
            if active.has_active_order {
                order_id = active.order.map(|o| o.id);
                token = active.client_token.or(token);
            }
        }

        let Some(order_id) = order_id else {
            return Ok(None);
        };

        let order = match self.api.get_order(&order_id).await {
            Ok(order) => {
                if let Err(e) = self.credentials.cache_order(&order).await {
                    tracing::warn!("Failed to cache order: {}", e);
                }
                order
            }
            Err(e) if e.is_retryable() => match self.credentials.cached_order().await? {
                Some(cached) if cached.id == order_id => {
                    tracing::warn!("Order fetch failed, using cached ride: {}", e);
                    cached
                }
                _ => return Err(e),
            },
            Err(e) => return Err(e),
        };

        let Some(token) = token else {
            return Err(RideError::MissingCredential("ride client token".to_string()));
        };
        self.credentials.persist_ride(&order_id, &token).await?;

        let lifecycle = self.join_ride(&order, Role::Client).await?;
        Ok(Some(lifecycle))
    }

    /// Driver-side counterpart: pick up the assigned ride for the stored
    /// session, if any.
    pub async fn resume_driver_ride(&self) -> RideResult<Option<Arc<RideLifecycle>>> {
        let Some(session_id) = self.credentials.driver_session_id().await? else {
            return Ok(None);
        };

        let active = self.api.active_driver_order(&session_id).await?;
        let Some(order) = active.order else {
            return Ok(None);
        };

        let lifecycle = self.join_ride(&order, Role::Driver).await?;
        Ok(Some(lifecycle))
    }
}
