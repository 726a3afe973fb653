use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::models::{BookingStatus, SeatCode};

fn codes_to_strings(codes: &[SeatCode]) -> Vec<String> {
    codes.iter().map(|c| c.to_string()).collect()
}

/// Ошибки атомарного захвата мест в леджере.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ClaimError {
    /// Часть запрошенных мест занята (BOOKED либо живой чужой HELD).
    /// Список содержит ровно конфликтующие места.
    #[error("места недоступны: {}", codes_to_strings(.0).join(", "))]
    SeatsUnavailable(Vec<SeatCode>),
    /// Место отсутствует в зарегистрированной схеме сеанса.
    #[error("место {0} не существует в схеме сеанса")]
    UnknownSeat(SeatCode),
    /// Сеанс не зарегистрирован в леджере.
    #[error("сеанс {0} не зарегистрирован в леджере")]
    ShowNotRegistered(i64),
}

/// Ошибки перевода HELD -> BOOKED. Обе нетранзитивны для вызывающего:
/// нужен новый холд, повтор confirm бессмыслен.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfirmError {
    #[error("холд истёк")]
    HoldExpired,
    #[error("холд принадлежит другому владельцу")]
    HoldNotOwned,
    #[error("сеанс {0} не зарегистрирован в леджере")]
    ShowNotRegistered(i64),
}

/// Ошибки слоя хранения броней.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("запись не найдена")]
    NotFound,
    #[error("ошибка базы данных: {0}")]
    Database(#[from] sqlx::Error),
    /// Строка в БД не проходит доменную валидацию (битый код места/статус).
    #[error("повреждённые данные: {0}")]
    Corrupt(String),
}

/// Итоговая таксономия ошибок оркестратора. Каждый вариант различим для
/// вызывающего: перевыбрать места, перезапустить флоу или вернуть деньги —
/// решение принимает контроллер, не оркестратор.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),
    #[error("сеанс {0} не найден")]
    ShowNotFound(i64),
    #[error("бронь {0} не найдена")]
    BookingNotFound(i64),
    #[error("места уже заняты: {}", codes_to_strings(.0).join(", "))]
    SeatConflict(Vec<SeatCode>),
    #[error("холд истёк, требуется новый")]
    HoldExpired,
    #[error("холд принадлежит другой брони")]
    HoldNotOwned,
    #[error("бронь уже в статусе {0}")]
    InvalidState(BookingStatus),
    #[error("ошибка хранилища: {0}")]
    Store(#[from] StoreError),
}

impl BookingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BookingError::Validation(_) => StatusCode::BAD_REQUEST,
            BookingError::ShowNotFound(_) | BookingError::BookingNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            BookingError::SeatConflict(_)
            | BookingError::HoldExpired
            | BookingError::HoldNotOwned
            | BookingError::InvalidState(_) => StatusCode::CONFLICT,
            BookingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Инфраструктурные детали наружу не отдаём, только в лог
        if let BookingError::Store(ref e) = self {
            tracing::error!("store error: {:?}", e);
            let body = Json(json!({
                "success": false,
                "message": "Внутренняя ошибка сервиса"
            }));
            return (status, body).into_response();
        }

        let body = match &self {
            BookingError::SeatConflict(codes) => json!({
                "success": false,
                "reason": "SeatConflict",
                "message": self.to_string(),
                "conflicting_seats": codes_to_strings(codes),
            }),
            BookingError::HoldExpired => json!({
                "success": false,
                "reason": "HoldExpired",
                "message": self.to_string(),
            }),
            BookingError::HoldNotOwned => json!({
                "success": false,
                "reason": "HoldNotOwned",
                "message": self.to_string(),
            }),
            _ => json!({
                "success": false,
                "message": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            BookingError::Validation("пусто".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BookingError::ShowNotFound(1).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BookingError::SeatConflict(vec![]).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            BookingError::HoldExpired.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            BookingError::Store(StoreError::NotFound).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
