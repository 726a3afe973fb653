use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;

use crate::error::BookingError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/shows", get(list_shows))
        .route("/shows/{id}/availability", get(show_availability))
}

// GET /api/shows — афиша предстоящих сеансов
async fn list_shows(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, BookingError> {
    let shows = state.catalog.list_shows().await?;
    Ok((StatusCode::OK, Json(shows)))
}

// GET /api/shows/{id}/availability — карта состояний мест
//
// Ответ консультативный: место может показаться свободным и всё равно
// уйти конкуренту на hold. Авторитетный отказ даёт только POST /bookings/hold.
async fn show_availability(
    State(state): State<Arc<AppState>>,
    Path(show_id): Path<i64>,
) -> Result<impl IntoResponse, BookingError> {
    let seats = state
        .availability
        .seat_map(show_id)
        .await?
        .ok_or(BookingError::ShowNotFound(show_id))?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "show_id": show_id,
            "seats": seats,
        })),
    ))
}
