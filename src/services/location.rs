// src/services/location.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::RideResult;
use crate::models::location::{
    ClientLocationUpdate, DriverLocationUpdate, LocationBroadcast, LocationSample,
};
use crate::models::messages::events;
use crate::services::connection::{ConnectionManager, Subscription};
use crate::utils::geo::{calculate_heading, haversine_distance_m};

/// Best-effort live position sharing over the ride room. Last value wins;
/// nothing is persisted and nothing is redelivered after a reconnect.
pub struct LocationChannel {
    connection: Arc<ConnectionManager>,
    min_interval: Duration,
    min_distance_m: f64,
    last_published: Mutex<Option<PublishedFix>>,
}

struct PublishedFix {
    at: Instant,
    lat: f64,
    lng: f64,
}

impl LocationChannel {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self::with_thresholds(connection, Duration::from_millis(2500), 15.0)
    }

    pub fn with_thresholds(
        connection: Arc<ConnectionManager>,
        min_interval: Duration,
        min_distance_m: f64,
    ) -> Self {
        Self {
            connection,
            min_interval,
            min_distance_m,
            last_published: Mutex::new(None),
        }
    }

    /// Publish a driver fix, rate-limited: a sample goes out when enough
    /// time has passed OR the driver moved far enough, whichever fires
    /// first. The first fix always publishes. Returns whether it did.
    ///
    /// When the fix carries no heading (stationary or low-accuracy), the
    /// bearing from the previously published fix is used instead.
    pub async fn publish_driver(
        &self,
        order_id: &str,
        session_id: &str,
        sample: LocationSample,
    ) -> RideResult<bool> {
        let mut last = self.last_published.lock().await;
        let now = Instant::now();

        let (should_publish, derived_heading) = match last.as_ref() {
            None => (true, None),
            Some(previous) => {
                let elapsed = now.duration_since(previous.at);
                let moved = haversine_distance_m(previous.lat, previous.lng, sample.lat, sample.lng);
                let due = elapsed >= self.min_interval || moved >= self.min_distance_m;
                let heading = calculate_heading(previous.lat, previous.lng, sample.lat, sample.lng);
                (due, Some(heading))
            }
        };

        if !should_publish {
            return Ok(false);
        }

        *last = Some(PublishedFix { at: now, lat: sample.lat, lng: sample.lng });
        drop(last);

        let update = DriverLocationUpdate {
            order_id: order_id.to_string(),
            session_id: session_id.to_string(),
            lat: sample.lat,
            lng: sample.lng,
            heading: sample.heading.or(derived_heading),
            speed: sample.speed,
            timestamp: sample.timestamp,
        };
        self.connection.emit(events::LOCATION_DRIVER_UPDATE, update).await?;
        Ok(true)
    }

    /// Publish a rider fix so the driver can render the pickup position.
    /// The platform watcher already runs at a lower cadence; no extra
    /// throttle here.
    pub async fn publish_client(
        &self,
        order_id: &str,
        client_token: &str,
        lat: f64,
        lng: f64,
        timestamp: i64,
    ) -> RideResult<()> {
        let update = ClientLocationUpdate {
            order_id: order_id.to_string(),
            client_token: client_token.to_string(),
            lat,
            lng,
            timestamp,
        };
        self.connection.emit(events::LOCATION_CLIENT_UPDATE, update).await
    }

    pub async fn on_driver_location(
        &self,
        order_id: &str,
        callback: impl Fn(LocationBroadcast) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_broadcasts(events::LOCATION_DRIVER, order_id, callback).await
    }

    pub async fn on_client_location(
        &self,
        order_id: &str,
        callback: impl Fn(LocationBroadcast) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_broadcasts(events::LOCATION_CLIENT, order_id, callback).await
    }

    /// The transport guarantees no cross-reconnect ordering, so stale
    /// samples (older timestamp than the last applied one) are dropped at
    /// the receiver rather than rendered.
    async fn subscribe_broadcasts(
        &self,
        event: &str,
        order_id: &str,
        callback: impl Fn(LocationBroadcast) + Send + Sync + 'static,
    ) -> Subscription {
        let watched = order_id.to_string();
        let last_applied = AtomicI64::new(i64::MIN);
        self.connection
            .subscribe(event, move |data| {
                match serde_json::from_value::<LocationBroadcast>(data.clone()) {
                    Ok(broadcast) => {
                        if broadcast.order_id != watched {
                            return;
                        }
                        let previous = last_applied.load(Ordering::SeqCst);
                        if broadcast.timestamp < previous {
                            tracing::debug!("Dropping stale location sample");
                            return;
                        }
                        last_applied.store(broadcast.timestamp, Ordering::SeqCst);
                        callback(broadcast);
                    }
                    Err(e) => tracing::warn!("Bad location payload: {}", e),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connection::{MockTransport, ReconnectPolicy};
    use serde_json::json;

    struct Fixture {
        transport: Arc<MockTransport>,
        channel: LocationChannel,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let connection = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());
        connection.connect_and_wait().await.unwrap();
        let channel = LocationChannel::new(connection);
        Fixture { transport, channel }
    }

    fn fix(lat: f64, lng: f64, ts: i64) -> LocationSample {
        LocationSample::new(lat, lng, ts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fix_always_publishes() {
        let f = fixture().await;
        let published = f
            .channel
            .publish_driver("ord-1", "session-1", fix(-17.5350, -149.5696, 1))
            .await
            .unwrap();
        assert!(published);
        assert_eq!(f.transport.sent_messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_and_soon_fix_is_suppressed() {
        let f = fixture().await;
        f.channel
            .publish_driver("ord-1", "session-1", fix(-17.5350, -149.5696, 1))
            .await
            .unwrap();

        // A few meters, a few hundred milliseconds later: below both gates
        tokio::time::sleep(Duration::from_millis(300)).await;
        let published = f
            .channel
            .publish_driver("ord-1", "session-1", fix(-17.53501, -149.56961, 2))
            .await
            .unwrap();
        assert!(!published);
        assert_eq!(f.transport.sent_messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_time_triggers_publish() {
        let f = fixture().await;
        f.channel
            .publish_driver("ord-1", "session-1", fix(-17.5350, -149.5696, 1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let published = f
            .channel
            .publish_driver("ord-1", "session-1", fix(-17.53501, -149.56961, 2))
            .await
            .unwrap();
        assert!(published, "time gate alone should trigger a publish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_distance_triggers_publish_within_interval() {
        let f = fixture().await;
        f.channel
            .publish_driver("ord-1", "session-1", fix(-17.5350, -149.5696, 1))
            .await
            .unwrap();

        // ~100m north right away: distance gate fires before the timer
        tokio::time::sleep(Duration::from_millis(100)).await;
        let published = f
            .channel
            .publish_driver("ord-1", "session-1", fix(-17.5341, -149.5696, 2))
            .await
            .unwrap();
        assert!(published, "distance gate alone should trigger a publish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heading_derived_from_previous_fix() {
        let f = fixture().await;
        f.channel
            .publish_driver("ord-1", "session-1", fix(0.0, 0.0, 1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        // Due east of the previous fix, no platform heading supplied
        f.channel
            .publish_driver("ord-1", "session-1", fix(0.0, 0.01, 2))
            .await
            .unwrap();

        let sent = f.transport.sent_messages();
        assert_eq!(sent.len(), 2);
        // First fix has no previous coordinate to derive from
        assert!(sent[0].data.get("heading").is_none());
        let heading = sent[1].data["heading"].as_f64().unwrap();
        assert!((heading - 90.0).abs() < 1e-6, "expected ~90, got {}", heading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_heading_wins_over_derived() {
        let f = fixture().await;
        f.channel
            .publish_driver("ord-1", "session-1", fix(0.0, 0.0, 1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let mut sample = fix(0.0, 0.01, 2);
        sample.heading = Some(42.0);
        f.channel.publish_driver("ord-1", "session-1", sample).await.unwrap();

        let sent = f.transport.sent_messages();
        assert_eq!(sent[1].data["heading"].as_f64().unwrap(), 42.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_filters_ride_and_staleness() {
        let f = fixture().await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::<i64>::new()));
        let sink = seen.clone();
        let _subscription = f
            .channel
            .on_driver_location("ord-1", move |b| {
                sink.lock().unwrap().push(b.timestamp);
            })
            .await;

        let push = |order_id: &str, ts: i64| {
            f.transport.push_server_event(
                events::LOCATION_DRIVER,
                json!({ "orderId": order_id, "lat": -17.5, "lng": -149.5, "timestamp": ts }),
            );
        };

        push("ord-1", 100);
        push("ord-other", 200); // different ride
        push("ord-1", 50);      // stale, out of order
        push("ord-1", 300);

        let s = seen.clone();
        tokio::time::timeout(Duration::from_secs(30), async move {
            while s.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*seen.lock().unwrap(), vec![100, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_publish_carries_token() {
        let f = fixture().await;
        f.channel
            .publish_client("ord-1", "tok-1", -17.55, -149.60, 123)
            .await
            .unwrap();

        let sent = f.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, events::LOCATION_CLIENT_UPDATE);
        assert_eq!(sent[0].data["clientToken"], "tok-1");
        assert_eq!(sent[0].data["orderId"], "ord-1");
    }
}
