pub mod errors;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use errors::{RideError, RideResult};
pub use state::{AppConfig, AppState, PlatformCapabilities};
