// src/errors.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for the swift-ride protocol client
#[derive(Debug, Clone)]
pub enum RideError {
    // HTTP-layer errors, classified by response status
    Validation(String),
    Auth(String),
    Server(String),

    // Transport errors
    Network(String),
    Timeout(String),
    ConnectionClosed,

    // Realtime-channel errors (join rejected, token mismatch, accept refused)
    Protocol(String),

    // Serialization and parsing errors
    Serialization(String),

    // Local state errors
    Store(String),
    MissingCredential(String),

    // Business logic errors
    OrderNotFound(String),
    NoActiveOrder,
    InvalidTransition { from: String, to: String },
    RoleNotAllowed(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl fmt::Display for RideError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RideError::Validation(msg) => write!(f, "Validation error: {}", msg),
            RideError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            RideError::Server(msg) => write!(f, "Server error: {}", msg),

            RideError::Network(msg) => write!(f, "Network error: {}", msg),
            RideError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            RideError::ConnectionClosed => write!(f, "Connection closed"),

            RideError::Protocol(msg) => write!(f, "Protocol error: {}", msg),

            RideError::Serialization(msg) => write!(f, "Serialization error: {}", msg),

            RideError::Store(msg) => write!(f, "Credential store error: {}", msg),
            RideError::MissingCredential(what) => write!(f, "Missing credential: {}", what),

            RideError::OrderNotFound(id) => write!(f, "Order not found: {}", id),
            RideError::NoActiveOrder => write!(f, "No active order"),
            RideError::InvalidTransition { from, to } => {
                write!(f, "Invalid status transition: {} -> {}", from, to)
            }
            RideError::RoleNotAllowed(action) => {
                write!(f, "Role not allowed to perform: {}", action)
            }
        }
    }
}

impl std::error::Error for RideError {}

// Convenience type alias for Results
pub type RideResult<T> = Result<T, RideError>;

impl RideError {
    pub fn network(msg: impl Into<String>) -> Self {
        RideError::Network(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        RideError::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RideError::Protocol(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RideError::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        RideError::Auth(msg.into())
    }

    pub fn server(msg: impl Into<String>) -> Self {
        RideError::Server(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        RideError::Store(msg.into())
    }

    /// Build an error for a non-2xx HTTP response. The server-provided
    /// `{error}` (or `{message}`) body wins; otherwise a default
    /// user-facing message keyed by status class.
    pub fn from_response(status: u16, body: &str) -> Self {
        let server_message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error.or(b.message));

        let message = server_message.unwrap_or_else(|| Self::default_message(status).to_string());

        match status {
            401 | 403 => RideError::Auth(message),
            s if (400..500).contains(&s) => RideError::Validation(message),
            _ => RideError::Server(message),
        }
    }

    /// Default user-facing messages, same wording as the mobile client.
    pub fn default_message(status: u16) -> &'static str {
        match status {
            401 | 403 => "Session expirée. Veuillez vous reconnecter.",
            s if (400..500).contains(&s) => {
                "Données invalides. Vérifiez que toutes les informations sont correctes."
            }
            s if s >= 500 => "Le serveur rencontre un problème. Réessayez dans quelques instants.",
            _ => "Une erreur est survenue",
        }
    }

    /// The user-visible message for this error, without the class prefix.
    pub fn user_message(&self) -> String {
        match self {
            RideError::Validation(msg)
            | RideError::Auth(msg)
            | RideError::Server(msg)
            | RideError::Protocol(msg) => msg.clone(),
            RideError::Network(_) | RideError::ConnectionClosed => {
                "Problème de connexion. Vérifiez votre réseau.".to_string()
            }
            RideError::Timeout(_) => "Le serveur ne répond pas. Réessayez.".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether an automatic retry (on an idempotent operation) makes sense.
    /// Auth and validation failures never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RideError::Network(_)
                | RideError::Server(_)
                | RideError::Timeout(_)
                | RideError::ConnectionClosed
        )
    }
}

// Conversion implementations for common error types
impl From<reqwest::Error> for RideError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RideError::Timeout(err.to_string())
        } else if err.is_connect() {
            RideError::Network(err.to_string())
        } else if err.is_decode() {
            RideError::Serialization(err.to_string())
        } else {
            RideError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RideError {
    fn from(err: serde_json::Error) -> Self {
        RideError::Serialization(err.to_string())
    }
}
