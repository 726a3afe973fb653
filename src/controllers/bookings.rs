use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use validator::Validate;

use crate::error::BookingError;
use crate::models::{Booking, BookingStatus, SeatCode};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", get(get_user_bookings))
        .route("/bookings/hold", post(create_hold))
        .route("/bookings/confirm", post(confirm_booking))
        .route("/bookings/cancel", post(cancel_booking))
}

/* ---------- helpers ---------- */

fn parse_seat_codes(raw: &[String]) -> Result<Vec<SeatCode>, BookingError> {
    raw.iter()
        .map(|s| SeatCode::from_str(s).map_err(|e| BookingError::Validation(e.to_string())))
        .collect()
}

/// Бронь чужого пользователя наружу не отличаем от несуществующей.
async fn owned_booking(
    state: &AppState,
    booking_id: i64,
    user_id: i64,
) -> Result<Booking, BookingError> {
    let booking = state
        .bookings
        .get(booking_id)
        .await?
        .ok_or(BookingError::BookingNotFound(booking_id))?;
    if booking.user_id != user_id {
        return Err(BookingError::BookingNotFound(booking_id));
    }
    Ok(booking)
}

/* ---------- ответы ---------- */

// Наружу бронь уходит без hold_token: токен — внутренняя собственность
// пары оркестратор/леджер
#[derive(Debug, Serialize)]
struct BookingResponse {
    booking_id: i64,
    show_id: i64,
    seats: Vec<String>,
    total_amount: f64,
    status: BookingStatus,
    hold_expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<Booking> for BookingResponse {
    fn from(b: Booking) -> Self {
        BookingResponse {
            booking_id: b.id,
            show_id: b.show_id,
            seats: b.seat_codes.iter().map(|c| c.to_string()).collect(),
            total_amount: b.total_amount,
            status: b.status,
            hold_expires_at: b.hold_expires_at,
            created_at: b.created_at,
        }
    }
}

/* ---------- handlers ---------- */

// POST /api/bookings/hold
#[derive(Debug, Deserialize, Validate)]
struct CreateHoldRequest {
    show_id: i64,
    #[validate(length(min = 1, max = 10, message = "от 1 до 10 мест за одну бронь"))]
    seat_codes: Vec<String>,
}

async fn create_hold(
    State(state): State<Arc<AppState>>,
    user: crate::middleware::AuthUser,
    Json(req): Json<CreateHoldRequest>,
) -> Result<impl IntoResponse, BookingError> {
    req.validate()
        .map_err(|e| BookingError::Validation(e.to_string()))?;
    if req.show_id <= 0 {
        return Err(BookingError::Validation("show_id должен быть > 0".to_string()));
    }

    let codes = parse_seat_codes(&req.seat_codes)?;
    let booking = state
        .orchestrator
        .create_hold(req.show_id, user.user_id, codes)
        .await?;

    state.availability.invalidate(booking.show_id).await;
    Ok((StatusCode::CREATED, Json(BookingResponse::from(booking))))
}

// POST /api/bookings/confirm
#[derive(Debug, Deserialize, Validate)]
struct ConfirmBookingRequest {
    booking_id: i64,
    #[validate(length(min = 1, message = "payment_ref не может быть пустым"))]
    payment_ref: String,
}

async fn confirm_booking(
    State(state): State<Arc<AppState>>,
    user: crate::middleware::AuthUser,
    Json(req): Json<ConfirmBookingRequest>,
) -> Result<impl IntoResponse, BookingError> {
    req.validate()
        .map_err(|e| BookingError::Validation(e.to_string()))?;

    // Проверка владельца до любых переходов
    owned_booking(&state, req.booking_id, user.user_id).await?;

    let booking = state
        .orchestrator
        .confirm_payment(req.booking_id, &req.payment_ref)
        .await?;

    state.availability.invalidate(booking.show_id).await;
    Ok((StatusCode::OK, Json(BookingResponse::from(booking))))
}

// POST /api/bookings/cancel
#[derive(Debug, Deserialize)]
struct CancelBookingRequest {
    booking_id: i64,
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: crate::middleware::AuthUser,
    Json(req): Json<CancelBookingRequest>,
) -> Result<impl IntoResponse, BookingError> {
    owned_booking(&state, req.booking_id, user.user_id).await?;

    let booking = state
        .orchestrator
        .cancel(req.booking_id, "user_request")
        .await?;

    state.availability.invalidate(booking.show_id).await;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "message": "Бронь успешно отменена"
        })),
    ))
}

// GET /api/bookings
async fn get_user_bookings(
    State(state): State<Arc<AppState>>,
    user: crate::middleware::AuthUser,
) -> Result<impl IntoResponse, BookingError> {
    let bookings = state.bookings.list_for_user(user.user_id).await?;
    let resp: Vec<BookingResponse> = bookings.into_iter().map(BookingResponse::from).collect();
    Ok((StatusCode::OK, Json(resp)))
}
