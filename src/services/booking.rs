//! booking.rs
//!
//! Оркестратор бронирования — конечный автомат одной брони:
//! PENDING -> CONFIRMED | CANCELLED | EXPIRED.
//!
//! Ключевые компоненты:
//! 1.  **create_hold**: валидация корзины по схеме зала, расчёт суммы по
//!     ценам категорий и атомарный захват мест в леджере. Если бронь не
//!     удалось сохранить после успешного захвата, захват компенсируется
//!     `release` до возврата ошибки.
//! 2.  **confirm_payment**: вызывается только после подтверждения оплаты
//!     внешним шлюзом. Истёкший холд означает EXPIRED-бронь и ошибку
//!     `HoldExpired` — возврат денег инициирует внешний контур, не мы.
//! 3.  **cancel**: добровольный отказ, валиден только из PENDING.
//!
//! Ни claim, ни confirm никогда не повторяются молча: каждая неудача
//! возвращается различимой ошибкой, решение — за вызывающим.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::ShowCatalog;
use crate::error::{BookingError, ClaimError, ConfirmError};
use crate::ledger::ReservationLedger;
use crate::models::{Booking, BookingStatus, SeatCode};
use crate::services::notify::Notifier;
use crate::store::{BookingStore, NewBooking};

pub struct BookingOrchestrator {
    ledger: Arc<ReservationLedger>,
    store: Arc<dyn BookingStore>,
    catalog: Arc<dyn ShowCatalog>,
    notifier: Arc<dyn Notifier>,
    hold_ttl: Duration,
}

impl BookingOrchestrator {
    pub fn new(
        ledger: Arc<ReservationLedger>,
        store: Arc<dyn BookingStore>,
        catalog: Arc<dyn ShowCatalog>,
        notifier: Arc<dyn Notifier>,
        hold_ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            catalog,
            notifier,
            hold_ttl,
        }
    }

    /// Захват корзины мест: PENDING-бронь с дедлайном оплаты.
    pub async fn create_hold(
        &self,
        show_id: i64,
        user_id: i64,
        seat_codes: Vec<SeatCode>,
    ) -> Result<Booking, BookingError> {
        if seat_codes.is_empty() {
            return Err(BookingError::Validation("список мест пуст".to_string()));
        }
        let mut unique = seat_codes.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != seat_codes.len() {
            return Err(BookingError::Validation(
                "список мест содержит дубликаты".to_string(),
            ));
        }

        let layout = self
            .catalog
            .layout(show_id)
            .await?
            .ok_or(BookingError::ShowNotFound(show_id))?;

        for code in &unique {
            if !layout.contains(code) {
                return Err(BookingError::Validation(format!(
                    "место {code} отсутствует в схеме сеанса"
                )));
            }
        }

        // Сумма по ценам категорий на момент холда; дальше не пересчитывается
        let total_amount = layout.total_price(&unique).ok_or_else(|| {
            BookingError::Validation("часть мест отсутствует в схеме сеанса".to_string())
        })?;

        self.ledger.ensure_show(show_id, layout.seat_codes());

        let holder = Uuid::new_v4();
        let grant = self
            .ledger
            .try_claim(show_id, &unique, holder, self.hold_ttl)
            .await
            .map_err(|e| match e {
                ClaimError::SeatsUnavailable(seats) => BookingError::SeatConflict(seats),
                ClaimError::UnknownSeat(code) => BookingError::Validation(format!(
                    "место {code} отсутствует в схеме сеанса"
                )),
                ClaimError::ShowNotRegistered(id) => BookingError::ShowNotFound(id),
            })?;

        let created = self
            .store
            .create(NewBooking {
                show_id,
                user_id,
                seat_codes: unique.clone(),
                total_amount,
                hold_token: holder,
                hold_expires_at: grant.expires_at,
            })
            .await;

        let booking = match created {
            Ok(b) => b,
            Err(e) => {
                // Захват уже применён, бронь не сохранилась: компенсируем,
                // иначе места зависнут до истечения TTL
                warn!("booking insert failed after claim, releasing seats: {:?}", e);
                self.ledger.release(show_id, &unique, holder).await;
                return Err(e.into());
            }
        };

        info!(
            "hold created: booking={} show={} seats={} total={} deadline={}",
            booking.id,
            show_id,
            booking.seat_codes.len(),
            booking.total_amount,
            booking.hold_expires_at
        );
        Ok(booking)
    }

    /// Подтверждение оплаченной брони. Вызывать только после того, как
    /// внешний шлюз подтвердил платёж.
    pub async fn confirm_payment(
        &self,
        booking_id: i64,
        payment_ref: &str,
    ) -> Result<Booking, BookingError> {
        let booking = self
            .store
            .get(booking_id)
            .await?
            .ok_or(BookingError::BookingNotFound(booking_id))?;

        match booking.status {
            BookingStatus::Pending => {}
            // Повторная доставка вебхука: подтверждённая бронь — успех
            BookingStatus::Confirmed => return Ok(booking),
            BookingStatus::Expired => return Err(BookingError::HoldExpired),
            BookingStatus::Cancelled => {
                return Err(BookingError::InvalidState(booking.status))
            }
        }

        let now = Utc::now();
        if booking.hold_expired(now) {
            self.expire_booking(&booking).await?;
            return Err(BookingError::HoldExpired);
        }

        let ledger_result = self
            .ledger
            .confirm(
                booking.show_id,
                &booking.seat_codes,
                booking.hold_token,
                booking.id,
            )
            .await;

        match ledger_result {
            Ok(()) => {}
            Err(ConfirmError::HoldExpired) => {
                // Гонка с дедлайном: леджер — арбитр, бронь истекла
                self.expire_booking(&booking).await?;
                return Err(BookingError::HoldExpired);
            }
            Err(ConfirmError::HoldNotOwned) => {
                // Места уже переуступлены после истечения; бронь закрываем
                self.store.expire(booking.id).await?;
                return Err(BookingError::HoldNotOwned);
            }
            Err(ConfirmError::ShowNotRegistered(id)) => {
                return Err(BookingError::ShowNotFound(id))
            }
        }

        let confirmed = match self.store.confirm(booking.id, payment_ref, now).await? {
            Some(b) => b,
            None => {
                // Guard по статусу не прошёл: перечитываем и отвечаем по факту
                let current = self
                    .store
                    .get(booking.id)
                    .await?
                    .ok_or(BookingError::BookingNotFound(booking.id))?;
                if current.status == BookingStatus::Confirmed {
                    current
                } else {
                    warn!(
                        "booking {} left ledger BOOKED but store status is {}",
                        booking.id, current.status
                    );
                    return Err(BookingError::InvalidState(current.status));
                }
            }
        };

        info!(
            "booking confirmed: booking={} payment_ref={}",
            confirmed.id, payment_ref
        );
        self.spawn_notify_confirmed(confirmed.clone());
        Ok(confirmed)
    }

    /// Добровольная отмена PENDING-брони.
    pub async fn cancel(&self, booking_id: i64, reason: &str) -> Result<Booking, BookingError> {
        let booking = self
            .store
            .get(booking_id)
            .await?
            .ok_or(BookingError::BookingNotFound(booking_id))?;

        if booking.status != BookingStatus::Pending {
            return Err(BookingError::InvalidState(booking.status));
        }

        self.ledger
            .release(booking.show_id, &booking.seat_codes, booking.hold_token)
            .await;

        let cancelled = match self.store.cancel(booking.id, Utc::now()).await? {
            Some(b) => b,
            None => {
                let current = self
                    .store
                    .get(booking.id)
                    .await?
                    .ok_or(BookingError::BookingNotFound(booking.id))?;
                return Err(BookingError::InvalidState(current.status));
            }
        };

        info!("booking cancelled: booking={} reason={}", cancelled.id, reason);
        Ok(cancelled)
    }

    /// Истечение холда, обнаруженное лениво в confirm-пути.
    async fn expire_booking(&self, booking: &Booking) -> Result<(), BookingError> {
        self.ledger
            .release(booking.show_id, &booking.seat_codes, booking.hold_token)
            .await;
        if self.store.expire(booking.id).await? {
            let mut expired = booking.clone();
            expired.status = BookingStatus::Expired;
            self.spawn_notify_expired(expired);
        }
        Ok(())
    }

    fn spawn_notify_confirmed(&self, booking: Booking) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.booking_confirmed(&booking).await;
        });
    }

    fn spawn_notify_expired(&self, booking: Booking) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.booking_expired(&booking).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryShowCatalog;
    use crate::models::{SeatInfo, SeatStateKind, Show, ShowLayout};
    use crate::services::notify::NoopNotifier;
    use crate::store::MemoryBookingStore;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    fn codes(list: &[&str]) -> Vec<SeatCode> {
        list.iter().map(|s| SeatCode::from_str(s).unwrap()).collect()
    }

    fn test_show(show_id: i64) -> (Show, ShowLayout) {
        let show = Show {
            id: show_id,
            movie_title: "Солярис".into(),
            theatre: "Центральный".into(),
            screen: "Зал 1".into(),
            starts_at: Utc::now() + Duration::hours(3),
        };
        let mut seats = BTreeMap::new();
        for code in codes(&["A1", "A2"]) {
            seats.insert(code, SeatInfo { tier: "vip".into(), price: 1500.0 });
        }
        seats.insert(
            SeatCode::new('B', 1),
            SeatInfo { tier: "standard".into(), price: 800.0 },
        );
        (show, ShowLayout::new(show_id, seats))
    }

    struct Fixture {
        orchestrator: BookingOrchestrator,
        ledger: Arc<ReservationLedger>,
        store: Arc<MemoryBookingStore>,
    }

    fn fixture(hold_ttl: Duration) -> Fixture {
        let ledger = Arc::new(ReservationLedger::new());
        let store = Arc::new(MemoryBookingStore::new());
        let catalog = Arc::new(MemoryShowCatalog::new());
        let (show, layout) = test_show(1);
        catalog.insert(show, layout);

        let orchestrator = BookingOrchestrator::new(
            ledger.clone(),
            store.clone(),
            catalog,
            Arc::new(NoopNotifier),
            hold_ttl,
        );
        Fixture {
            orchestrator,
            ledger,
            store,
        }
    }

    #[tokio::test]
    async fn hold_validations() {
        let f = fixture(Duration::minutes(5));

        let err = f.orchestrator.create_hold(1, 10, vec![]).await.unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));

        let err = f
            .orchestrator
            .create_hold(1, 10, codes(&["A1", "A1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));

        let err = f
            .orchestrator
            .create_hold(1, 10, codes(&["Z9"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));

        let err = f
            .orchestrator
            .create_hold(77, 10, codes(&["A1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::ShowNotFound(77)));
    }

    #[tokio::test]
    async fn hold_then_confirm_books_exactly_the_cart() {
        let f = fixture(Duration::minutes(5));

        let booking = f
            .orchestrator
            .create_hold(1, 10, codes(&["A1", "A2"]))
            .await
            .unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.total_amount, 3000.0);

        let confirmed = f
            .orchestrator
            .confirm_payment(booking.id, "pay-42")
            .await
            .unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(confirmed.payment_ref.as_deref(), Some("pay-42"));

        let snap = f.ledger.snapshot(1).await.unwrap();
        assert_eq!(snap[&SeatCode::new('A', 1)], SeatStateKind::Booked);
        assert_eq!(snap[&SeatCode::new('A', 2)], SeatStateKind::Booked);
        // Никакое другое место не изменилось
        assert_eq!(snap[&SeatCode::new('B', 1)], SeatStateKind::Free);

        // Повторный confirm (повторный вебхук) — тот же успех
        let again = f
            .orchestrator
            .confirm_payment(booking.id, "pay-42")
            .await
            .unwrap();
        assert_eq!(again.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn contention_scenario_a1_a2_b1() {
        let f = fixture(Duration::minutes(5));

        // X держит {A1, A2}
        let x = f
            .orchestrator
            .create_hold(1, 10, codes(&["A1", "A2"]))
            .await
            .unwrap();
        assert_eq!(x.total_amount, 1500.0 + 1500.0);

        // Y просит {A2, B1}: конфликт ровно по A2
        let err = f
            .orchestrator
            .create_hold(1, 20, codes(&["A2", "B1"]))
            .await
            .unwrap_err();
        match err {
            BookingError::SeatConflict(seats) => assert_eq!(seats, codes(&["A2"])),
            other => panic!("unexpected error: {other}"),
        }

        // X оплачивает: A1, A2 проданы
        f.orchestrator.confirm_payment(x.id, "pay-x").await.unwrap();

        // Y повторяет {A2, B1}: A2 теперь продано навсегда
        let err = f
            .orchestrator
            .create_hold(1, 20, codes(&["A2", "B1"]))
            .await
            .unwrap_err();
        match err {
            BookingError::SeatConflict(seats) => assert_eq!(seats, codes(&["A2"])),
            other => panic!("unexpected error: {other}"),
        }

        // Один B1 — пожалуйста
        let y = f
            .orchestrator
            .create_hold(1, 20, codes(&["B1"]))
            .await
            .unwrap();
        assert_eq!(y.total_amount, 800.0);
    }

    #[tokio::test]
    async fn expired_hold_cannot_be_confirmed() {
        let f = fixture(Duration::seconds(0));

        let booking = f
            .orchestrator
            .create_hold(1, 10, codes(&["A1"]))
            .await
            .unwrap();

        let err = f
            .orchestrator
            .confirm_payment(booking.id, "pay-late")
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::HoldExpired));

        // Бронь помечена EXPIRED, место освобождено
        let current = f.store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(current.status, BookingStatus::Expired);
        let snap = f.ledger.snapshot(1).await.unwrap();
        assert_eq!(snap[&SeatCode::new('A', 1)], SeatStateKind::Free);

        // Последующий confirm отвечает тем же HoldExpired
        let err = f
            .orchestrator
            .confirm_payment(booking.id, "pay-later")
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::HoldExpired));
    }

    #[tokio::test]
    async fn cancel_releases_seats_and_is_pending_only() {
        let f = fixture(Duration::minutes(5));

        let booking = f
            .orchestrator
            .create_hold(1, 10, codes(&["A1", "B1"]))
            .await
            .unwrap();

        let cancelled = f
            .orchestrator
            .cancel(booking.id, "передумал")
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);

        let snap = f.ledger.snapshot(1).await.unwrap();
        assert!(snap.values().all(|k| *k == SeatStateKind::Free));

        // Повторная отмена — уже невалидный переход
        let err = f.orchestrator.cancel(booking.id, "ещё раз").await.unwrap_err();
        assert!(matches!(
            err,
            BookingError::InvalidState(BookingStatus::Cancelled)
        ));

        // Места снова доступны другому пользователю
        f.orchestrator
            .create_hold(1, 20, codes(&["A1", "B1"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_booking_is_not_found() {
        let f = fixture(Duration::minutes(5));
        assert!(matches!(
            f.orchestrator.confirm_payment(404, "x").await.unwrap_err(),
            BookingError::BookingNotFound(404)
        ));
        assert!(matches!(
            f.orchestrator.cancel(404, "x").await.unwrap_err(),
            BookingError::BookingNotFound(404)
        ));
    }
}
