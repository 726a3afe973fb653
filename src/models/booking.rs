use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::seat::SeatCode;

/// Статус брони. Из PENDING ровно один выход: CONFIRMED, CANCELLED или
/// EXPIRED; все три терминальны.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BookingStatus::Pending),
            "CONFIRMED" => Some(BookingStatus::Confirmed),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            "EXPIRED" => Some(BookingStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Корзина мест одного пользователя на один сеанс.
///
/// Пока бронь в PENDING, она монопольно владеет HELD-записями своих мест;
/// `hold_token` — идентификатор владельца в леджере.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: i64,
    pub show_id: i64,
    pub user_id: i64,
    pub seat_codes: Vec<SeatCode>,
    /// Сумма по ценам категорий на момент холда, позже не пересчитывается.
    pub total_amount: f64,
    pub status: BookingStatus,
    pub hold_token: Uuid,
    pub hold_expires_at: DateTime<Utc>,
    pub payment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn hold_expired(&self, now: DateTime<Utc>) -> bool {
        self.hold_expires_at <= now
    }
}
