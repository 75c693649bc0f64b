// src/models/ride.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,          // Created, broadcast to online drivers
    Accepted,         // A driver took the order
    Declined,         // Declined by every offered driver
    Expired,          // No driver accepted in time
    Cancelled,        // Cancelled by either party
    DriverEnroute,    // Driver on the way to pickup
    DriverArrived,    // Driver waiting at pickup
    InProgress,       // Ride underway
    Completed,        // Ride finished, payment not yet settled
    PaymentPending,   // Settlement handshake running
    PaymentConfirmed, // Paid (card charge or cash received)
    PaymentFailed,    // Charge failed, waiting on retry or cash fallback
}

/// Ride-room status vocabulary shared by both apps. The driver app drives
/// these transitions; the client app only mirrors them.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Enroute,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    fn rank(self) -> u8 {
        match self {
            RideStatus::Enroute => 0,
            RideStatus::Arrived => 1,
            RideStatus::InProgress => 2,
            RideStatus::Completed => 3,
            RideStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Transitions are monotonic: one step forward at a time, or a jump to
    /// `Cancelled` from any non-terminal state. Nothing ever goes backward.
    pub fn can_advance_to(self, next: RideStatus) -> bool {
        if next == RideStatus::Cancelled {
            return !self.is_terminal();
        }
        next.rank() == self.rank() + 1
    }

    /// Whether applying `next` as a mirrored (remote) status keeps the
    /// observed sequence non-decreasing.
    pub fn accepts_mirror(self, next: RideStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RideStatus::Cancelled || next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Enroute => "enroute",
            RideStatus::Arrived => "arrived",
            RideStatus::InProgress => "inprogress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }

    /// Map the server-side order status to the ride-room vocabulary.
    /// Used when resuming an ongoing ride from the authoritative fetch.
    pub fn from_order_status(status: OrderStatus) -> Option<RideStatus> {
        match status {
            OrderStatus::Accepted | OrderStatus::DriverEnroute => Some(RideStatus::Enroute),
            OrderStatus::DriverArrived => Some(RideStatus::Arrived),
            OrderStatus::InProgress => Some(RideStatus::InProgress),
            OrderStatus::Completed
            | OrderStatus::PaymentPending
            | OrderStatus::PaymentConfirmed
            | OrderStatus::PaymentFailed => Some(RideStatus::Completed),
            OrderStatus::Cancelled => Some(RideStatus::Cancelled),
            OrderStatus::Pending | OrderStatus::Declined | OrderStatus::Expired => None,
        }
    }
}

/// Which side of the ride a participant is on. Determines which status
/// transitions it may initiate and which credential it presents.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    Client,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Driver => "driver",
            Role::Client => "client",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Pickup,
    Stop,
    Destination,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AddressField {
    pub id: String,
    pub value: String, // free-text address as the user typed it
    pub place_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: AddressKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
}

/// Catalogue entry for a ride class.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideOption {
    pub id: String,
    pub title: String,
    pub duration: String,
    pub capacity: String,
    pub base_price: f64,
    pub price_per_km: f64,
}

/// Reduced ride-class projection embedded in an order.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderRideOption {
    pub id: String,
    pub title: String,
    pub price: f64,
    pub price_per_km: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Supplement {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteInfo {
    pub distance: f64, // km
    pub duration: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
}

/// Server-authoritative ride entity. The client holds a read-mostly cached
/// projection of this; the server owns every field.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub client_id: Option<String>,
    pub client_name: String,
    pub client_phone: String,
    pub addresses: Vec<AddressField>,
    pub ride_option: OrderRideOption,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_info: Option<RouteInfo>,
    pub passengers: u32,
    pub supplements: Vec<Supplement>,
    pub payment_method: PaymentMethod,
    pub total_price: f64,
    pub driver_earnings: f64,
    pub scheduled_time: Option<String>,
    pub is_advance_booking: bool,
    pub status: OrderStatus,
    pub assigned_driver_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// Request/Response Models

/// Client-originated ride draft. Submitted once; immutable after
/// submission (re-submitting creates a new ride).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub client_name: String,
    pub client_phone: String,
    pub addresses: Vec<AddressField>,
    pub ride_option: OrderRideOption,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_info: Option<RouteInfo>,
    pub passengers: u32,
    pub supplements: Vec<Supplement>,
    pub payment_method: PaymentMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_card_id: Option<String>,
    pub total_price: f64,
    pub driver_earnings: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<String>,
    pub is_advance_booking: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order: Order,
    pub client_token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ActiveOrderResponse {
    pub has_active_order: bool,
    pub order: Option<Order>,
    pub client_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverActiveOrderResponse {
    pub has_active_order: bool,
    pub order: Option<Order>,
}

/// Assignment announcement received while searching.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignedDriver {
    pub order_id: String,
    pub driver_name: String,
    pub driver_id: String,
    pub session_id: String,
}

// Catalogue data, mirrored from the booking form

pub fn ride_options() -> Vec<RideOption> {
    vec![
        RideOption {
            id: "immediate".to_string(),
            title: "Taxi immédiat".to_string(),
            duration: "10 - 20 min".to_string(),
            capacity: "1 - 8 passagers".to_string(),
            base_price: 2300.0,
            price_per_km: 150.0,
        },
        RideOption {
            id: "reservation".to_string(),
            title: "Réservation à l'avance".to_string(),
            duration: "45 - 1h".to_string(),
            capacity: "1 - 8 passagers".to_string(),
            base_price: 2300.0,
            price_per_km: 150.0,
        },
        RideOption {
            id: "tour".to_string(),
            title: "Tour de l'Île".to_string(),
            duration: "45 - 1h".to_string(),
            capacity: "4 - 8 passagers".to_string(),
            base_price: 30000.0,
            price_per_km: 0.0,
        },
    ]
}

pub fn supplement_catalogue() -> Vec<Supplement> {
    vec![
        Supplement { id: "bagages".to_string(), name: "Bagages".to_string(), price: 100.0, quantity: 0 },
        Supplement { id: "encombrants".to_string(), name: "Encombrants".to_string(), price: 200.0, quantity: 0 },
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceBreakdown {
    pub total_price: f64,
    pub driver_earnings: f64,
}

/// Total = base fare + per-km fare + supplements. The driver keeps 80%,
/// rounded to the nearest franc.
pub fn calculate_price(
    ride_option: &RideOption,
    distance_km: f64,
    supplements: &[Supplement],
) -> PriceBreakdown {
    let distance_price = distance_km * ride_option.price_per_km;
    let supplements_total: f64 = supplements
        .iter()
        .map(|s| s.price * f64::from(s.quantity))
        .sum();

    let total_price = ride_option.base_price + distance_price + supplements_total;
    let driver_earnings = (total_price * 0.8).round();

    PriceBreakdown { total_price, driver_earnings }
}

impl Order {
    pub fn pickup(&self) -> Option<&AddressField> {
        self.addresses.iter().find(|a| a.kind == AddressKind::Pickup)
    }

    pub fn destination(&self) -> Option<&AddressField> {
        self.addresses.iter().find(|a| a.kind == AddressKind::Destination)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Declined
                | OrderStatus::Expired
                | OrderStatus::Cancelled
                | OrderStatus::PaymentConfirmed
        )
    }
}
