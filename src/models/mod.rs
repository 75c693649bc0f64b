// src/models/mod.rs
pub mod driver;
pub mod location;
pub mod messages;
pub mod payment;
pub mod ride;
pub mod user;

pub use driver::*;
pub use location::*;
pub use messages::{events, EventMessage};
pub use payment::*;
pub use ride::*;
pub use user::*;
