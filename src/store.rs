use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Postgres};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Booking, BookingStatus, SeatCode};

/// Повтор идемпотентной операции чтения с ограниченным экспоненциальным
/// backoff'ом. Только чтения: повтор claim/confirm после частичного
/// применения мог бы перевести уже захваченные места дважды, их
/// идемпотентность обеспечивается в самом леджере, а не повтором.
pub async fn with_read_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut delay = std::time::Duration::from_millis(50);

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(v) => return Ok(v),
            Err(StoreError::Database(e)) if attempt < MAX_ATTEMPTS && is_transient(&e) => {
                warn!("{} failed (attempt {}/{}): {:?}", op_name, attempt, MAX_ATTEMPTS, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop returns on the last attempt")
}

fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
    )
}

/// Параметры новой PENDING-брони.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub show_id: i64,
    pub user_id: i64,
    pub seat_codes: Vec<SeatCode>,
    pub total_amount: f64,
    pub hold_token: Uuid,
    pub hold_expires_at: DateTime<Utc>,
}

/// Хранилище броней. Статусные апдейты защищены guard'ом по текущему
/// статусу (`WHERE status = 'PENDING'`), поэтому их можно безопасно
/// повторять: второй вызов просто не находит строку.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn create(&self, new: NewBooking) -> Result<Booking, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Booking>, StoreError>;

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Booking>, StoreError>;

    /// PENDING -> CONFIRMED. `None`, если бронь уже не PENDING.
    async fn confirm(
        &self,
        id: i64,
        payment_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Booking>, StoreError>;

    /// PENDING -> CANCELLED. `None`, если бронь уже не PENDING.
    async fn cancel(&self, id: i64, at: DateTime<Utc>) -> Result<Option<Booking>, StoreError>;

    /// PENDING -> EXPIRED. `false`, если бронь уже не PENDING.
    async fn expire(&self, id: i64) -> Result<bool, StoreError>;

    /// PENDING -> EXPIRED по токену холда (путь sweeper'а).
    async fn expire_by_hold_token(&self, token: Uuid) -> Result<Option<Booking>, StoreError>;

    /// PENDING-брони с прошедшим дедлайном (второй проход sweeper'а).
    async fn pending_expired(&self, now: DateTime<Utc>) -> Result<Vec<Booking>, StoreError>;

    /// Брони сеанса в данном статусе (восстановление леджера на старте).
    async fn for_show_in_status(
        &self,
        show_id: i64,
        status: BookingStatus,
    ) -> Result<Vec<Booking>, StoreError>;
}

/* ---------- Postgres ---------- */

#[derive(FromRow)]
struct BookingRow {
    id: i64,
    show_id: i64,
    user_id: i64,
    seat_codes: Vec<String>,
    total_amount: f64,
    status: String,
    hold_token: Uuid,
    hold_expires_at: DateTime<Utc>,
    payment_ref: Option<String>,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, StoreError> {
        let seat_codes = row
            .seat_codes
            .iter()
            .map(|s| s.parse::<SeatCode>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Corrupt(format!("bookings.seat_codes: {e}")))?;
        let status = BookingStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("bookings.status '{}'", row.status)))?;

        Ok(Booking {
            id: row.id,
            show_id: row.show_id,
            user_id: row.user_id,
            seat_codes,
            total_amount: row.total_amount,
            status,
            hold_token: row.hold_token,
            hold_expires_at: row.hold_expires_at,
            payment_ref: row.payment_ref,
            created_at: row.created_at,
            confirmed_at: row.confirmed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

const BOOKING_COLUMNS: &str = "id, show_id, user_id, seat_codes, total_amount::FLOAT8 as total_amount, \
     status, hold_token, hold_expires_at, payment_ref, created_at, confirmed_at, cancelled_at";

pub struct PgBookingStore {
    pool: Pool<Postgres>,
}

impl PgBookingStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn create(&self, new: NewBooking) -> Result<Booking, StoreError> {
        let codes: Vec<String> = new.seat_codes.iter().map(|c| c.to_string()).collect();
        let row: BookingRow = sqlx::query_as(&format!(
            "INSERT INTO bookings
                 (show_id, user_id, seat_codes, total_amount, status, hold_token, hold_expires_at)
             VALUES ($1, $2, $3, $4, 'PENDING', $5, $6)
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(new.show_id)
        .bind(new.user_id)
        .bind(&codes)
        .bind(new.total_amount)
        .bind(new.hold_token)
        .bind(new.hold_expires_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, id: i64) -> Result<Option<Booking>, StoreError> {
        let pool = self.pool.clone();
        let row: Option<BookingRow> = with_read_retry("get_booking", || {
            let pool = pool.clone();
            async move {
                let row = sqlx::query_as(&format!(
                    "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"
                ))
                .bind(id)
                .fetch_optional(&pool)
                .await?;
                Ok(row)
            }
        })
        .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Booking>, StoreError> {
        let pool = self.pool.clone();
        let rows: Vec<BookingRow> = with_read_retry("list_bookings", || {
            let pool = pool.clone();
            async move {
                let rows = sqlx::query_as(&format!(
                    "SELECT {BOOKING_COLUMNS} FROM bookings
                     WHERE user_id = $1
                     ORDER BY created_at DESC"
                ))
                .bind(user_id)
                .fetch_all(&pool)
                .await?;
                Ok(rows)
            }
        })
        .await?;

        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn confirm(
        &self,
        id: i64,
        payment_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Booking>, StoreError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "UPDATE bookings
             SET status = 'CONFIRMED', payment_ref = $2, confirmed_at = $3
             WHERE id = $1 AND status = 'PENDING'
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(id)
        .bind(payment_ref)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn cancel(&self, id: i64, at: DateTime<Utc>) -> Result<Option<Booking>, StoreError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "UPDATE bookings
             SET status = 'CANCELLED', cancelled_at = $2
             WHERE id = $1 AND status = 'PENDING'
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn expire(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE bookings SET status = 'EXPIRED' WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn expire_by_hold_token(&self, token: Uuid) -> Result<Option<Booking>, StoreError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "UPDATE bookings
             SET status = 'EXPIRED'
             WHERE hold_token = $1 AND status = 'PENDING'
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn pending_expired(&self, now: DateTime<Utc>) -> Result<Vec<Booking>, StoreError> {
        let pool = self.pool.clone();
        let rows: Vec<BookingRow> = with_read_retry("pending_expired", || {
            let pool = pool.clone();
            async move {
                let rows = sqlx::query_as(&format!(
                    "SELECT {BOOKING_COLUMNS} FROM bookings
                     WHERE status = 'PENDING' AND hold_expires_at <= $1"
                ))
                .bind(now)
                .fetch_all(&pool)
                .await?;
                Ok(rows)
            }
        })
        .await?;

        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn for_show_in_status(
        &self,
        show_id: i64,
        status: BookingStatus,
    ) -> Result<Vec<Booking>, StoreError> {
        let pool = self.pool.clone();
        let status_str = status.as_str();
        let rows: Vec<BookingRow> = with_read_retry("for_show_in_status", || {
            let pool = pool.clone();
            async move {
                let rows = sqlx::query_as(&format!(
                    "SELECT {BOOKING_COLUMNS} FROM bookings
                     WHERE show_id = $1 AND status = $2"
                ))
                .bind(show_id)
                .bind(status_str)
                .fetch_all(&pool)
                .await?;
                Ok(rows)
            }
        })
        .await?;

        rows.into_iter().map(Booking::try_from).collect()
    }
}

/* ---------- In-memory (тесты и одноузловые стенды) ---------- */

#[derive(Default)]
pub struct MemoryBookingStore {
    bookings: Mutex<HashMap<i64, Booking>>,
    next_id: AtomicI64,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self {
            bookings: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn create(&self, new: NewBooking) -> Result<Booking, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let booking = Booking {
            id,
            show_id: new.show_id,
            user_id: new.user_id,
            seat_codes: new.seat_codes,
            total_amount: new.total_amount,
            status: BookingStatus::Pending,
            hold_token: new.hold_token,
            hold_expires_at: new.hold_expires_at,
            payment_ref: None,
            created_at: Utc::now(),
            confirmed_at: None,
            cancelled_at: None,
        };
        self.bookings.lock().unwrap().insert(id, booking.clone());
        Ok(booking)
    }

    async fn get(&self, id: i64) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.lock().unwrap().get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Booking>, StoreError> {
        let guard = self.bookings.lock().unwrap();
        let mut list: Vec<Booking> = guard
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn confirm(
        &self,
        id: i64,
        payment_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Booking>, StoreError> {
        let mut guard = self.bookings.lock().unwrap();
        match guard.get_mut(&id) {
            Some(b) if b.status == BookingStatus::Pending => {
                b.status = BookingStatus::Confirmed;
                b.payment_ref = Some(payment_ref.to_string());
                b.confirmed_at = Some(at);
                Ok(Some(b.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel(&self, id: i64, at: DateTime<Utc>) -> Result<Option<Booking>, StoreError> {
        let mut guard = self.bookings.lock().unwrap();
        match guard.get_mut(&id) {
            Some(b) if b.status == BookingStatus::Pending => {
                b.status = BookingStatus::Cancelled;
                b.cancelled_at = Some(at);
                Ok(Some(b.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire(&self, id: i64) -> Result<bool, StoreError> {
        let mut guard = self.bookings.lock().unwrap();
        match guard.get_mut(&id) {
            Some(b) if b.status == BookingStatus::Pending => {
                b.status = BookingStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_by_hold_token(&self, token: Uuid) -> Result<Option<Booking>, StoreError> {
        let mut guard = self.bookings.lock().unwrap();
        for b in guard.values_mut() {
            if b.hold_token == token && b.status == BookingStatus::Pending {
                b.status = BookingStatus::Expired;
                return Ok(Some(b.clone()));
            }
        }
        Ok(None)
    }

    async fn pending_expired(&self, now: DateTime<Utc>) -> Result<Vec<Booking>, StoreError> {
        let guard = self.bookings.lock().unwrap();
        Ok(guard
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.hold_expires_at <= now)
            .cloned()
            .collect())
    }

    async fn for_show_in_status(
        &self,
        show_id: i64,
        status: BookingStatus,
    ) -> Result<Vec<Booking>, StoreError> {
        let guard = self.bookings.lock().unwrap();
        Ok(guard
            .values()
            .filter(|b| b.show_id == show_id && b.status == status)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn new_booking() -> NewBooking {
        NewBooking {
            show_id: 1,
            user_id: 10,
            seat_codes: vec![SeatCode::new('A', 1)],
            total_amount: 500.0,
            hold_token: Uuid::new_v4(),
            hold_expires_at: Utc::now() + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn guarded_updates_fire_once() {
        let store = MemoryBookingStore::new();
        let b = store.create(new_booking()).await.unwrap();

        assert!(store.confirm(b.id, "pay-1", Utc::now()).await.unwrap().is_some());
        // Бронь уже CONFIRMED: guard не пропускает ни confirm, ни cancel, ни expire
        assert!(store.confirm(b.id, "pay-2", Utc::now()).await.unwrap().is_none());
        assert!(store.cancel(b.id, Utc::now()).await.unwrap().is_none());
        assert!(!store.expire(b.id).await.unwrap());

        let got = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(got.status, BookingStatus::Confirmed);
        assert_eq!(got.payment_ref.as_deref(), Some("pay-1"));
    }

    #[tokio::test]
    async fn expire_by_token_targets_only_pending() {
        let store = MemoryBookingStore::new();
        let b = store.create(new_booking()).await.unwrap();

        let expired = store.expire_by_hold_token(b.hold_token).await.unwrap();
        assert_eq!(expired.unwrap().id, b.id);
        // Второй раз бронь уже не PENDING
        assert!(store.expire_by_hold_token(b.hold_token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_retry_retries_transient_and_gives_up() {
        let attempts = AtomicU32::new(0);
        let res: Result<u32, StoreError> = with_read_retry("test_op", || {
            let n = attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if n < 1 {
                    Err(StoreError::Database(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::Relaxed), 2);

        // Невосстановимая ошибка не повторяется
        let attempts = AtomicU32::new(0);
        let res: Result<u32, StoreError> = with_read_retry("test_op", || {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { Err(StoreError::NotFound) }
        })
        .await;
        assert!(matches!(res, Err(StoreError::NotFound)));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }
}
