// src/models/messages.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RideResult;

use super::ride::{RideStatus, Role};

/// Every frame on the realtime channel is a named event plus a JSON body.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventMessage {
    pub event: String,
    pub data: Value,
}

impl EventMessage {
    pub fn new(event: &str, data: impl Serialize) -> RideResult<Self> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(data)?,
        })
    }
}

/// Channel event names, both directions.
pub mod events {
    // Driver session
    pub const DRIVER_JOIN: &str = "driver:join";
    pub const DRIVER_STATUS: &str = "driver:status";

    // Client session
    pub const CLIENT_JOIN: &str = "client:join";
    pub const CLIENT_JOIN_ERROR: &str = "client:join:error";

    // Order dispatch
    pub const ORDER_NEW: &str = "order:new";
    pub const ORDERS_PENDING: &str = "orders:pending";
    pub const ORDER_ACCEPT: &str = "order:accept";
    pub const ORDER_DECLINE: &str = "order:decline";
    pub const ORDER_TAKEN: &str = "order:taken";
    pub const ORDER_EXPIRED: &str = "order:expired";
    pub const ORDER_ACCEPT_SUCCESS: &str = "order:accept:success";
    pub const ORDER_ACCEPT_ERROR: &str = "order:accept:error";
    pub const ORDER_DRIVER_ASSIGNED: &str = "order:driver:assigned";

    // Ride room
    pub const RIDE_JOIN: &str = "ride:join";
    pub const RIDE_STATUS_UPDATE: &str = "ride:status:update";
    pub const RIDE_STATUS_CHANGED: &str = "ride:status:changed";
    pub const RIDE_CANCEL: &str = "ride:cancel";
    pub const RIDE_CANCELLED: &str = "ride:cancelled";

    // Payment handshake
    pub const PAYMENT_CONFIRM: &str = "payment:confirm";
    pub const PAYMENT_RETRY: &str = "payment:retry";
    pub const PAYMENT_SWITCH_CASH: &str = "payment:switch-cash";
    pub const PAYMENT_STATUS: &str = "payment:status";
    pub const PAYMENT_RETRY_READY: &str = "payment:retry:ready";
    pub const PAYMENT_SWITCHED_TO_CASH: &str = "payment:switched-to-cash";

    // Location streaming
    pub const LOCATION_DRIVER_UPDATE: &str = "location:driver:update";
    pub const LOCATION_CLIENT_UPDATE: &str = "location:client:update";
    pub const LOCATION_DRIVER: &str = "location:driver";
    pub const LOCATION_CLIENT: &str = "location:client";
}

// Outbound payloads

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverJoin {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverStatus {
    pub session_id: String,
    pub is_online: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoin {
    pub order_id: String,
    pub client_token: String,
}

/// Every ride-room operation carries the ride id together with the
/// role-specific credential; the server rejects mismatched pairs.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideJoin {
    pub order_id: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderAccept {
    pub order_id: String,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderDecline {
    pub order_id: String,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusUpdate {
    pub order_id: String,
    pub session_id: String,
    pub status: RideStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideCancel {
    pub order_id: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

// Inbound payloads

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderRef {
    pub order_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JoinError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusChanged {
    pub order_id: String,
    pub status: RideStatus,
    #[serde(default)]
    pub order_status: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideCancelled {
    pub order_id: String,
    pub cancelled_by: Role,
    #[serde(default)]
    pub reason: Option<String>,
}
