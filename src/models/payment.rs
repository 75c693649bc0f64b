// src/models/payment.rs
use serde::{Deserialize, Serialize};

use super::ride::{PaymentMethod, Role};

/// Transient result of the settlement handshake; lives only long enough to
/// show the rider/driver what happened.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub confirmed: bool,
    pub amount: f64,
    pub method: PaymentMethod,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub error_message: Option<String>,
}

// Wire payloads

/// Authoritative settlement broadcast. The server aggregates both parties'
/// confirmations (or the async card-charge result) into one of these.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusEvent {
    pub order_id: String,
    pub status: String, // "payment_confirmed" | "payment_failed"
    pub confirmed: bool,
    #[serde(default)]
    pub driver_confirmed: Option<bool>,
    #[serde(default)]
    pub client_confirmed: Option<bool>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub card_brand: Option<String>,
    #[serde(default)]
    pub card_last4: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl PaymentStatusEvent {
    pub fn is_confirmed(&self) -> bool {
        self.status == "payment_confirmed"
    }

    pub fn is_failed(&self) -> bool {
        self.status == "payment_failed"
    }

    /// Project the broadcast into a display outcome, falling back to the
    /// order's own amount/method when the event omits them.
    pub fn to_outcome(&self, fallback_amount: f64, fallback_method: PaymentMethod) -> PaymentOutcome {
        PaymentOutcome {
            confirmed: self.is_confirmed(),
            amount: self.amount.unwrap_or(fallback_amount),
            method: self.payment_method.unwrap_or(fallback_method),
            card_brand: self.card_brand.clone(),
            card_last4: self.card_last4.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfirm {
    pub order_id: String,
    pub confirmed: bool,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRetry {
    pub order_id: String,
    pub client_token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSwitchCash {
    pub order_id: String,
    pub client_token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRetryReady {
    pub order_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSwitchedToCash {
    pub order_id: String,
    pub amount: f64,
    pub message: String,
}
