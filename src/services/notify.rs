//! Уведомления о терминальных переходах брони (письмо/пуш — на стороне
//! внешнего сервиса). Строго fire-and-forget: любая ошибка логируется и
//! никогда не влияет на исход самой брони.

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::models::Booking;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn booking_confirmed(&self, booking: &Booking);
    async fn booking_expired(&self, booking: &Booking);
}

/// Заглушка для стендов без сервиса уведомлений.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn booking_confirmed(&self, booking: &Booking) {
        debug!("notification skipped (no webhook configured): booking {} confirmed", booking.id);
    }

    async fn booking_expired(&self, booking: &Booking) {
        debug!("notification skipped (no webhook configured): booking {} expired", booking.id);
    }
}

/// HTTP-клиент сервиса уведомлений.
pub struct HttpNotifier {
    webhook_url: String,
    http_client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    async fn post_event(&self, event: &str, booking: &Booking) {
        let seats: Vec<String> = booking.seat_codes.iter().map(|c| c.to_string()).collect();
        let payload = json!({
            "event": event,
            "booking_id": booking.id,
            "show_id": booking.show_id,
            "user_id": booking.user_id,
            "seats": seats,
            "total_amount": booking.total_amount,
        });

        match self.http_client.post(&self.webhook_url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("notification '{}' for booking {} delivered", event, booking.id);
            }
            Ok(resp) => {
                warn!(
                    "notification '{}' for booking {} rejected: HTTP {}",
                    event,
                    booking.id,
                    resp.status()
                );
            }
            Err(e) => {
                warn!("notification '{}' for booking {} failed: {:?}", event, booking.id, e);
            }
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn booking_confirmed(&self, booking: &Booking) {
        self.post_event("booking_confirmed", booking).await;
    }

    async fn booking_expired(&self, booking: &Booking) {
        self.post_event("booking_expired", booking).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookingStatus, SeatCode};
    use chrono::Utc;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn booking() -> Booking {
        Booking {
            id: 5,
            show_id: 1,
            user_id: 10,
            seat_codes: vec![SeatCode::new('A', 1), SeatCode::new('A', 2)],
            total_amount: 1600.0,
            status: BookingStatus::Confirmed,
            hold_token: Uuid::new_v4(),
            hold_expires_at: Utc::now(),
            payment_ref: Some("pay-1".into()),
            created_at: Utc::now(),
            confirmed_at: Some(Utc::now()),
            cancelled_at: None,
        }
    }

    #[tokio::test]
    async fn posts_event_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notify"))
            .and(body_partial_json(serde_json::json!({
                "event": "booking_confirmed",
                "booking_id": 5,
                "seats": ["A1", "A2"],
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(format!("{}/notify", server.uri()));
        notifier.booking_confirmed(&booking()).await;
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(format!("{}/notify", server.uri()));
        // Не паникует и ничего не возвращает: ошибка только в логе
        notifier.booking_expired(&booking()).await;
    }
}
