use swift_ride::state::{AppConfig, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut config = AppConfig::default();
    if let Ok(base_url) = std::env::var("RIDE_API_URL") {
        config.api.base_url = base_url;
    } else {
        config.use_mock_api = true;
    }
    if let Ok(socket_url) = std::env::var("RIDE_SOCKET_URL") {
        config.socket_url = socket_url;
    }

    let state = AppState::new(config);

    match state.connection.connect_and_wait().await {
        Ok(()) => tracing::info!("Connected to ride coordination server"),
        Err(e) => tracing::warn!("Connection not up yet, retrying in background: {}", e),
    }

    match state.resume_client_ride().await {
        Ok(Some(lifecycle)) => {
            tracing::info!("Resumed active ride {}", lifecycle.order_id())
        }
        Ok(None) => tracing::info!("No active ride"),
        Err(e) => tracing::warn!("Could not resume ride: {}", e),
    }
}
