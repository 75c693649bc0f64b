// src/services/store.rs
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::{RideError, RideResult};
use crate::models::ride::Order;

/// Opaque persisted key-value store for session tokens, ride tokens and the
/// short-lived ride cache. On device this is backed by the platform secure
/// store; the protocol core only ever sees get/set/delete.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> RideResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> RideResult<()>;
    async fn delete(&self, key: &str) -> RideResult<()>;
}

// Key builders
pub struct StoreKeys;

impl StoreKeys {
    pub fn client_session() -> String {
        "clientSessionId".to_string()
    }

    pub fn driver_session() -> String {
        "driverSessionId".to_string()
    }

    pub fn client_token() -> String {
        "rideClientToken".to_string()
    }

    pub fn current_order() -> String {
        "currentOrderId".to_string()
    }

    pub fn cached_order() -> String {
        "cachedOrder".to_string()
    }

    pub fn cached_order_at() -> String {
        "cachedOrderTimestamp".to_string()
    }
}

/// In-memory store, used in tests and wherever no secure store is wired.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: &str) -> RideResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> RideResult<()> {
        self.entries.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> RideResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Cached rides older than this are ignored; the cache only exists to
/// tolerate a transient network loss without losing ride context.
const ORDER_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

/// Typed facade over the raw store.
pub struct CredentialService {
    store: Arc<dyn CredentialStore>,
}

impl CredentialService {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn client_session_id(&self) -> RideResult<Option<String>> {
        self.store.get(&StoreKeys::client_session()).await
    }

    pub async fn set_client_session_id(&self, session_id: &str) -> RideResult<()> {
        self.store.set(&StoreKeys::client_session(), session_id).await
    }

    pub async fn remove_client_session_id(&self) -> RideResult<()> {
        self.store.delete(&StoreKeys::client_session()).await
    }

    pub async fn driver_session_id(&self) -> RideResult<Option<String>> {
        self.store.get(&StoreKeys::driver_session()).await
    }

    pub async fn set_driver_session_id(&self, session_id: &str) -> RideResult<()> {
        self.store.set(&StoreKeys::driver_session(), session_id).await
    }

    pub async fn remove_driver_session_id(&self) -> RideResult<()> {
        self.store.delete(&StoreKeys::driver_session()).await
    }

    pub async fn client_token(&self) -> RideResult<Option<String>> {
        self.store.get(&StoreKeys::client_token()).await
    }

    pub async fn set_client_token(&self, token: &str) -> RideResult<()> {
        self.store.set(&StoreKeys::client_token(), token).await
    }

    pub async fn current_order_id(&self) -> RideResult<Option<String>> {
        self.store.get(&StoreKeys::current_order()).await
    }

    pub async fn set_current_order_id(&self, order_id: &str) -> RideResult<()> {
        self.store.set(&StoreKeys::current_order(), order_id).await
    }

    /// Persist ride credentials in one step. Written before any room join
    /// so that an app restart mid-flow can recover the ride.
    pub async fn persist_ride(&self, order_id: &str, client_token: &str) -> RideResult<()> {
        self.set_client_token(client_token).await?;
        self.set_current_order_id(order_id).await
    }

    pub async fn cache_order(&self, order: &Order) -> RideResult<()> {
        let json = serde_json::to_string(order)?;
        self.store.set(&StoreKeys::cached_order(), &json).await?;
        self.store
            .set(
                &StoreKeys::cached_order_at(),
                &Utc::now().timestamp_millis().to_string(),
            )
            .await
    }

    /// Offline fallback only: returns the cached ride when the
    /// authoritative fetch fails, provided the cache is fresh enough.
    pub async fn cached_order(&self) -> RideResult<Option<Order>> {
        let Some(json) = self.store.get(&StoreKeys::cached_order()).await? else {
            return Ok(None);
        };

        let cached_at: i64 = self
            .store
            .get(&StoreKeys::cached_order_at())
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        if Utc::now().timestamp_millis() - cached_at > ORDER_CACHE_TTL_MS {
            tracing::debug!("Cached order is stale, ignoring");
            return Ok(None);
        }

        let order = serde_json::from_str(&json)
            .map_err(|e| RideError::store(format!("corrupt cached order: {}", e)))?;
        Ok(Some(order))
    }

    /// Release every ride-scoped credential. Safe to call repeatedly and
    /// regardless of which exit path (cancellation, payment success)
    /// triggered it.
    pub async fn clear_ride_state(&self) -> RideResult<()> {
        self.store.delete(&StoreKeys::client_token()).await?;
        self.store.delete(&StoreKeys::current_order()).await?;
        self.store.delete(&StoreKeys::cached_order()).await?;
        self.store.delete(&StoreKeys::cached_order_at()).await?;
        Ok(())
    }
}
