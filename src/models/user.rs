// src/models/user.rs
use serde::{Deserialize, Serialize};

/// Rider account as returned by the auth endpoints. The protocol core only
/// needs the identity fields; wallet/rating come along for free.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub phone: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub wallet_balance: f64,
    #[serde(default)]
    pub average_rating: Option<f32>,
    #[serde(default)]
    pub total_rides: u32,
}

impl Client {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

// Request/Response Models

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoginRequest {
    pub phone: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub phone: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub phone: String,
    pub code: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Shared shape of the auth endpoints' responses. `session.id` may be
/// absent when the server relies on cookies alone.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    pub client: Option<Client>,
    pub session: Option<super::driver::SessionRef>,
    #[serde(default)]
    pub needs_verification: bool,
    pub phone: Option<String>,
    pub error: Option<String>,
}
