// src/services/payment.rs
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

use crate::errors::RideResult;
use crate::models::messages::events;
use crate::models::payment::{
    PaymentConfirm, PaymentOutcome, PaymentRetry, PaymentRetryReady, PaymentStatusEvent,
    PaymentSwitchCash, PaymentSwitchedToCash,
};
use crate::models::ride::{PaymentMethod, Role};
use crate::services::connection::{ConnectionManager, Subscription};
use crate::services::lifecycle::RideCredential;

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentPhase {
    /// Ride not completed yet; no settlement running.
    Idle,
    Pending,
    Confirmed(PaymentOutcome),
    Failed(PaymentOutcome),
    /// Re-attempting the same method; re-enters Pending on the server ack.
    Retrying,
    /// Card abandoned, falling back to cash; re-enters Pending on the ack.
    SwitchedToCash,
}

impl PaymentPhase {
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentPhase::Confirmed(_))
    }
}

/// Two-party settlement handshake, entered when the ride completes. Both
/// parties may confirm; the server aggregates and broadcasts a single
/// authoritative `payment:status` that drives the phase here.
pub struct PaymentCoordinator {
    connection: Arc<ConnectionManager>,
    order_id: String,
    role: Role,
    credential: RideCredential,
    fallback_amount: f64,
    fallback_method: PaymentMethod,
    phase_tx: watch::Sender<PaymentPhase>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl PaymentCoordinator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        order_id: String,
        role: Role,
        credential: RideCredential,
        fallback_amount: f64,
        fallback_method: PaymentMethod,
    ) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(PaymentPhase::Idle);
        Arc::new(Self {
            connection,
            order_id,
            role,
            credential,
            fallback_amount,
            fallback_method,
            phase_tx,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn phase(&self) -> watch::Receiver<PaymentPhase> {
        self.phase_tx.subscribe()
    }

    /// Attach the settlement listeners. Resolution is keyed by ride id and
    /// applied at most once per phase change, so a duplicated broadcast
    /// cannot produce two success transitions.
    pub async fn start(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.is_empty() {
            return;
        }

        let coordinator = Arc::clone(self);
        let on_status = self
            .connection
            .subscribe(events::PAYMENT_STATUS, move |data| {
                match serde_json::from_value::<PaymentStatusEvent>(data.clone()) {
                    Ok(event) => coordinator.apply_status(&event),
                    Err(e) => tracing::warn!("Bad payment:status payload: {}", e),
                }
            })
            .await;

        let coordinator = Arc::clone(self);
        let on_retry_ready = self
            .connection
            .subscribe(events::PAYMENT_RETRY_READY, move |data| {
                if let Ok(event) = serde_json::from_value::<PaymentRetryReady>(data.clone()) {
                    coordinator.reenter_pending(&event.order_id, "retry acknowledged");
                }
            })
            .await;

        let coordinator = Arc::clone(self);
        let on_switched = self
            .connection
            .subscribe(events::PAYMENT_SWITCHED_TO_CASH, move |data| {
                if let Ok(event) = serde_json::from_value::<PaymentSwitchedToCash>(data.clone()) {
                    coordinator.reenter_pending(&event.order_id, "switched to cash");
                }
            })
            .await;

        subscriptions.extend([on_status, on_retry_ready, on_switched]);
    }

    /// Detach the listeners. Part of the shared ride-resource release.
    pub async fn release(&self) {
        for subscription in self.subscriptions.lock().await.drain(..) {
            subscription.unsubscribe().await;
        }
    }

    /// Entered implicitly when the ride reaches `completed`.
    pub fn enter_pending(&self) {
        self.phase_tx.send_if_modified(|phase| {
            if matches!(phase, PaymentPhase::Idle) {
                *phase = PaymentPhase::Pending;
                true
            } else {
                false
            }
        });
    }

    /// Report this party's confirmation (driver: cash received; client:
    /// acknowledgement). One-shot fire over the channel.
    pub async fn confirm(&self, confirmed: bool) -> RideResult<()> {
        let (session_id, client_token) = self.credential.pair();
        self.connection
            .emit(
                events::PAYMENT_CONFIRM,
                PaymentConfirm {
                    order_id: self.order_id.clone(),
                    confirmed,
                    role: self.role,
                    session_id,
                    client_token,
                },
            )
            .await
    }

    /// Re-attempt the failed method. Only meaningful from `Failed`; a
    /// second call before the server responds is a no-op.
    pub async fn retry(&self) -> RideResult<()> {
        let moved = self.phase_tx.send_if_modified(|phase| {
            if matches!(phase, PaymentPhase::Failed(_)) {
                *phase = PaymentPhase::Retrying;
                true
            } else {
                false
            }
        });
        if !moved {
            tracing::debug!("Ignoring retry outside of failed phase");
            return Ok(());
        }

        let Some(client_token) = self.credential.client_token() else {
            return Ok(());
        };
        self.connection
            .emit(
                events::PAYMENT_RETRY,
                PaymentRetry { order_id: self.order_id.clone(), client_token },
            )
            .await
    }

    /// Abandon the card payment and settle in cash.
    pub async fn switch_to_cash(&self) -> RideResult<()> {
        let moved = self.phase_tx.send_if_modified(|phase| {
            if matches!(phase, PaymentPhase::Failed(_)) {
                *phase = PaymentPhase::SwitchedToCash;
                true
            } else {
                false
            }
        });
        if !moved {
            tracing::debug!("Ignoring cash switch outside of failed phase");
            return Ok(());
        }

        let Some(client_token) = self.credential.client_token() else {
            return Ok(());
        };
        self.connection
            .emit(
                events::PAYMENT_SWITCH_CASH,
                PaymentSwitchCash { order_id: self.order_id.clone(), client_token },
            )
            .await
    }

    fn apply_status(&self, event: &PaymentStatusEvent) {
        if event.order_id != self.order_id {
            return;
        }

        let outcome = event.to_outcome(self.fallback_amount, self.fallback_method);
        if event.is_confirmed() {
            self.phase_tx.send_if_modified(|phase| {
                if phase.is_settled() {
                    false // duplicate resolution, already settled
                } else {
                    *phase = PaymentPhase::Confirmed(outcome.clone());
                    true
                }
            });
        } else if event.is_failed() {
            self.phase_tx.send_if_modified(|phase| match phase {
                PaymentPhase::Confirmed(_) | PaymentPhase::Failed(_) => false,
                _ => {
                    *phase = PaymentPhase::Failed(outcome.clone());
                    true
                }
            });
        } else {
            tracing::debug!("Unhandled payment status: {}", event.status);
        }
    }

    fn reenter_pending(&self, order_id: &str, why: &str) {
        if order_id != self.order_id {
            return;
        }
        let moved = self.phase_tx.send_if_modified(|phase| {
            if matches!(phase, PaymentPhase::Retrying | PaymentPhase::SwitchedToCash) {
                *phase = PaymentPhase::Pending;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!("Payment for {} back to pending: {}", self.order_id, why);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connection::{MockTransport, ReconnectPolicy};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        transport: Arc<MockTransport>,
        coordinator: Arc<PaymentCoordinator>,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let connection = ConnectionManager::new(transport.clone(), ReconnectPolicy::default());
        connection.connect_and_wait().await.unwrap();

        let coordinator = PaymentCoordinator::new(
            connection,
            "ord-1".to_string(),
            Role::Client,
            RideCredential::Client { token: "tok-1".to_string() },
            2300.0,
            PaymentMethod::Card,
        );
        coordinator.start().await;
        Fixture { transport, coordinator }
    }

    fn failed_event() -> serde_json::Value {
        json!({
            "orderId": "ord-1",
            "status": "payment_failed",
            "confirmed": false,
            "amount": 2300.0,
            "paymentMethod": "card",
            "cardBrand": "visa",
            "cardLast4": "4242",
            "errorMessage": "Carte refusée",
        })
    }

    fn confirmed_event() -> serde_json::Value {
        json!({
            "orderId": "ord-1",
            "status": "payment_confirmed",
            "confirmed": true,
            "amount": 2300.0,
            "paymentMethod": "card",
            "cardBrand": "visa",
            "cardLast4": "4242",
        })
    }

    async fn wait_phase(
        rx: &mut watch::Receiver<PaymentPhase>,
        predicate: impl Fn(&PaymentPhase) -> bool,
    ) -> PaymentPhase {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if predicate(&rx.borrow()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.expect("phase channel closed");
            }
        })
        .await
        .expect("expected phase not reached")
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_broadcast_settles() {
        let f = fixture().await;
        let mut rx = f.coordinator.phase();
        f.coordinator.enter_pending();

        f.transport.push_server_event(events::PAYMENT_STATUS, confirmed_event());

        let phase = wait_phase(&mut rx, |p| p.is_settled()).await;
        match phase {
            PaymentPhase::Confirmed(outcome) => {
                assert_eq!(outcome.amount, 2300.0);
                assert_eq!(outcome.card_last4.as_deref(), Some("4242"));
            }
            other => panic!("expected Confirmed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_retry_reenters_pending() {
        let f = fixture().await;
        let mut rx = f.coordinator.phase();
        f.coordinator.enter_pending();

        f.transport.push_server_event(events::PAYMENT_STATUS, failed_event());
        wait_phase(&mut rx, |p| matches!(p, PaymentPhase::Failed(_))).await;

        f.coordinator.retry().await.unwrap();
        assert_eq!(*f.coordinator.phase().borrow(), PaymentPhase::Retrying);

        // Second retry before any response changes nothing and emits nothing
        let emitted_before = f.transport.sent_messages().len();
        f.coordinator.retry().await.unwrap();
        assert_eq!(f.transport.sent_messages().len(), emitted_before);

        f.transport.push_server_event(
            events::PAYMENT_RETRY_READY,
            json!({ "orderId": "ord-1", "message": "Nouvelle tentative en cours" }),
        );
        wait_phase(&mut rx, |p| *p == PaymentPhase::Pending).await;

        f.transport.push_server_event(events::PAYMENT_STATUS, confirmed_event());
        wait_phase(&mut rx, |p| p.is_settled()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_confirmation_settles_once() {
        let f = fixture().await;
        let mut rx = f.coordinator.phase();
        f.coordinator.enter_pending();

        f.transport.push_server_event(events::PAYMENT_STATUS, confirmed_event());
        wait_phase(&mut rx, |p| p.is_settled()).await;

        f.transport.push_server_event(events::PAYMENT_STATUS, confirmed_event());
        tokio::time::sleep(Duration::from_millis(200)).await;

        // No second notification for the duplicate resolution
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_to_cash_path() {
        let f = fixture().await;
        let mut rx = f.coordinator.phase();
        f.coordinator.enter_pending();

        f.transport.push_server_event(events::PAYMENT_STATUS, failed_event());
        wait_phase(&mut rx, |p| matches!(p, PaymentPhase::Failed(_))).await;

        f.coordinator.switch_to_cash().await.unwrap();
        assert_eq!(*f.coordinator.phase().borrow(), PaymentPhase::SwitchedToCash);

        f.transport.push_server_event(
            events::PAYMENT_SWITCHED_TO_CASH,
            json!({ "orderId": "ord-1", "amount": 2300.0, "message": "Paiement en espèces" }),
        );
        wait_phase(&mut rx, |p| *p == PaymentPhase::Pending).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_ride_broadcast_is_ignored() {
        let f = fixture().await;
        f.coordinator.enter_pending();

        let mut other = confirmed_event();
        other["orderId"] = json!("ord-other");
        f.transport.push_server_event(events::PAYMENT_STATUS, other);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*f.coordinator.phase().borrow(), PaymentPhase::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_sends_credentialed_payload() {
        let f = fixture().await;
        f.coordinator.confirm(true).await.unwrap();

        let sent = f.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, events::PAYMENT_CONFIRM);
        assert_eq!(sent[0].data["orderId"], "ord-1");
        assert_eq!(sent[0].data["role"], "client");
        assert_eq!(sent[0].data["clientToken"], "tok-1");
    }
}
