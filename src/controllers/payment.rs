use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use std::sync::Arc;
use tracing::{info, warn};

use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook/payment", post(payment_webhook))
}

// POST /api/webhook/payment
//
// Вебхук от платёжного шлюза. Отвечаем 200 всегда: шлюз ретраит
// не-2xx до посинения, а наши переходы и так идемпотентны.
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    info!("Received payment webhook: {}", payload);

    let booking_id = payload
        .get("bookingId")
        .and_then(|v| v.as_i64())
        .or_else(|| {
            payload
                .get("bookingId")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
        });

    let status = payload
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_uppercase();

    let payment_ref = payload
        .get("paymentRef")
        .or_else(|| payload.get("paymentId"))
        .and_then(|v| v.as_str())
        .unwrap_or("external")
        .to_string();

    let Some(booking_id) = booking_id else {
        warn!("Payment webhook without bookingId: {}", payload);
        return (StatusCode::OK, Json(serde_json::json!({ "received": true })));
    };

    match status.as_str() {
        "CONFIRMED" | "SUCCEEDED" | "PAID" => {
            match state.orchestrator.confirm_payment(booking_id, &payment_ref).await {
                Ok(booking) => {
                    info!("Webhook confirmed booking {}", booking_id);
                    state.availability.invalidate(booking.show_id).await;
                }
                Err(e) => warn!("Webhook failed to confirm booking {}: {}", booking_id, e),
            }
        }
        "CANCELLED" | "FAILED" | "DECLINED" | "EXPIRED" => {
            match state.orchestrator.cancel(booking_id, "payment_failed").await {
                Ok(booking) => {
                    info!("Webhook cancelled booking {}", booking_id);
                    state.availability.invalidate(booking.show_id).await;
                }
                Err(e) => warn!("Webhook failed to cancel booking {}: {}", booking_id, e),
            }
        }
        other => {
            warn!("Unknown payment status '{}' for booking {}", other, booking_id);
        }
    }

    (StatusCode::OK, Json(serde_json::json!({ "received": true })))
}
