// src/models/driver.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: String,
    pub phone: String,
    pub first_name: String,
    pub last_name: String,
    pub vehicle_model: Option<String>,
    pub vehicle_color: Option<String>,
    pub vehicle_plate: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub average_rating: Option<f32>,
    #[serde(default)]
    pub total_rides: u32,
}

impl Driver {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// Server-issued session for an authenticated driver. Scoped to the
/// driver's online/offline lifecycle, not to one ride.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverSession {
    pub id: String,
    pub driver_id: String,
    pub driver_name: String,
    pub is_online: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

// Request/Response Models

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DriverLoginRequest {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverLoginResponse {
    pub success: bool,
    pub driver: Driver,
    pub session: SessionRef,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionRef {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverSessionStatusRequest {
    pub is_online: bool,
}
