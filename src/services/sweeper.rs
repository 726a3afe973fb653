//! Фоновый sweeper: возвращает в оборот места под истёкшими холдами и
//! закрывает соответствующие PENDING-брони. Конкурирует с confirm'ами на
//! живых холдах — арбитром в этой гонке служит переходной guard леджера,
//! sweeper лишь пожинает то, что уже истекло по значению.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::cache::AvailabilityService;
use crate::ledger::ReservationLedger;
use crate::services::notify::Notifier;
use crate::store::BookingStore;

pub struct ExpirySweeper {
    ledger: Arc<ReservationLedger>,
    store: Arc<dyn BookingStore>,
    notifier: Arc<dyn Notifier>,
    availability: Option<AvailabilityService>,
}

#[derive(Debug, Default, PartialEq)]
pub struct SweepStats {
    pub holds_reclaimed: usize,
    pub bookings_expired: usize,
}

impl ExpirySweeper {
    pub fn new(
        ledger: Arc<ReservationLedger>,
        store: Arc<dyn BookingStore>,
        notifier: Arc<dyn Notifier>,
        availability: Option<AvailabilityService>,
    ) -> Self {
        Self {
            ledger,
            store,
            notifier,
            availability,
        }
    }

    /// Один проход. Идемпотентен: повторный запуск на том же состоянии
    /// ничего не находит и ничего не ломает.
    pub async fn run_once(&self) -> SweepStats {
        let now = Utc::now();
        let mut stats = SweepStats::default();

        // 1) Реклейм истёкших холдов из леджера и закрытие их броней
        let reclaimed = self.ledger.sweep_expired(now).await;
        for hold in &reclaimed {
            stats.holds_reclaimed += 1;
            match self.store.expire_by_hold_token(hold.holder).await {
                Ok(Some(booking)) => {
                    stats.bookings_expired += 1;
                    info!(
                        "🧹 expired hold reclaimed: booking={} show={} seats={}",
                        booking.id,
                        hold.show_id,
                        hold.seats.len()
                    );
                    self.invalidate(hold.show_id).await;
                    self.notifier.booking_expired(&booking).await;
                }
                Ok(None) => {
                    // Бронь уже закрыта другим путём, реклейм мест достаточен
                    self.invalidate(hold.show_id).await;
                }
                Err(e) => {
                    error!(
                        "failed to expire booking for hold {}: {:?}",
                        hold.holder, e
                    );
                }
            }
        }

        // 2) PENDING-брони с прошедшим дедлайном, чьи места уже переуступлены
        //    ленивым try_claim (в реклейме леджера их не было)
        match self.store.pending_expired(now).await {
            Ok(stale) => {
                for booking in stale {
                    // Confirm мог уже победить в леджере (места BOOKED), а
                    // запись CONFIRMED в хранилище ещё не дойти. Арбитр —
                    // леджер: такую бронь не трогаем, её закроет отложенный
                    // store.confirm
                    if self
                        .ledger
                        .is_booked_by(booking.show_id, &booking.seat_codes, booking.id)
                        .await
                    {
                        continue;
                    }
                    self.ledger
                        .release(booking.show_id, &booking.seat_codes, booking.hold_token)
                        .await;
                    match self.store.expire(booking.id).await {
                        Ok(true) => {
                            stats.bookings_expired += 1;
                            info!("🧹 stale pending booking {} expired", booking.id);
                            self.invalidate(booking.show_id).await;
                            self.notifier.booking_expired(&booking).await;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!("failed to expire stale booking {}: {:?}", booking.id, e);
                        }
                    }
                }
            }
            Err(e) => error!("failed to list stale pending bookings: {:?}", e),
        }

        if stats.holds_reclaimed > 0 || stats.bookings_expired > 0 {
            info!(
                "🧹 sweep done: {} holds reclaimed, {} bookings expired",
                stats.holds_reclaimed, stats.bookings_expired
            );
        }
        stats
    }

    async fn invalidate(&self, show_id: i64) {
        if let Some(ref availability) = self.availability {
            availability.invalidate(show_id).await;
        }
    }
}
