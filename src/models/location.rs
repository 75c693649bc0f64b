// src/models/location.rs
use serde::{Deserialize, Serialize};

/// One positioning fix. Ephemeral: each new sample supersedes the last and
/// no history is kept anywhere on the client.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Milliseconds since the epoch, stamped by the sender.
    pub timestamp: i64,
}

impl LocationSample {
    pub fn new(lat: f64, lng: f64, timestamp: i64) -> Self {
        Self { lat, lng, heading: None, speed: None, timestamp }
    }
}

// Wire payloads

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocationUpdate {
    pub order_id: String,
    pub session_id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientLocationUpdate {
    pub order_id: String,
    pub client_token: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: i64,
}

/// Inbound position broadcast, either direction.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LocationBroadcast {
    pub order_id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    pub timestamp: i64,
}
