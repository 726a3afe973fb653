//! ledger
//!
//! Леджер резерваций — единственный источник истины о состоянии мест.
//!
//! Ключевые решения:
//! 1.  Запись на каждое место — тегированное состояние FREE / HELD / BOOKED,
//!     а не строка статуса. Недопустимый переход невозможно записать.
//! 2.  Все мультиместные переходы одного сеанса сериализуются одним
//!     асинхронным мьютексом этого сеанса: захват нескольких мест либо
//!     применяется целиком, либо не применяется вовсе. Частичного успеха
//!     не существует. Места при этом обходятся в фиксированном порядке
//!     `SeatCode` (ряд, номер), поэтому список конфликтов детерминирован.
//! 3.  Истечение холда проверяется по значению `expires_at` внутри перехода.
//!     В гонке confirm против sweeper'а побеждает тот, кто первым взял
//!     мьютекс и увидел ещё живой (или уже истёкший) холд.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ClaimError, ConfirmError};
use crate::models::{SeatCode, SeatState, SeatStateKind};

/// Выданный холд: владелец и его дедлайн.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoldGrant {
    pub holder: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Результат реклейма sweeper'а: чей холд истёк и какие места вернулись в FREE.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedHold {
    pub show_id: i64,
    pub holder: Uuid,
    pub seats: Vec<SeatCode>,
}

struct ShowSeats {
    seats: Mutex<HashMap<SeatCode, SeatState>>,
}

pub struct ReservationLedger {
    shows: RwLock<HashMap<i64, Arc<ShowSeats>>>,
}

impl Default for ReservationLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self {
            shows: RwLock::new(HashMap::new()),
        }
    }

    /// Регистрирует сеанс, создавая FREE-записи на всю его схему.
    /// Идемпотентно: уже зарегистрированный сеанс не трогается.
    pub fn ensure_show(&self, show_id: i64, codes: impl IntoIterator<Item = SeatCode>) {
        let mut shows = self.shows.write().unwrap();
        shows.entry(show_id).or_insert_with(|| {
            let seats = codes.into_iter().map(|c| (c, SeatState::Free)).collect();
            Arc::new(ShowSeats {
                seats: Mutex::new(seats),
            })
        });
    }

    fn show(&self, show_id: i64) -> Option<Arc<ShowSeats>> {
        self.shows.read().unwrap().get(&show_id).cloned()
    }

    /// Атомарный захват набора мест: всё или ничего.
    ///
    /// Успех только если каждое запрошенное место FREE либо под истёкшим
    /// чужим холдом (ленивый реклейм). Иначе — `SeatsUnavailable` ровно с
    /// теми местами, которые заняты.
    pub async fn try_claim(
        &self,
        show_id: i64,
        codes: &[SeatCode],
        holder: Uuid,
        ttl: Duration,
    ) -> Result<HoldGrant, ClaimError> {
        let show = self
            .show(show_id)
            .ok_or(ClaimError::ShowNotRegistered(show_id))?;

        let mut sorted = codes.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut seats = show.seats.lock().await;
        let now = Utc::now();

        for code in &sorted {
            if !seats.contains_key(code) {
                return Err(ClaimError::UnknownSeat(*code));
            }
        }

        let conflicts: Vec<SeatCode> = sorted
            .iter()
            .filter(|c| !seats[c].is_claimable(now))
            .copied()
            .collect();
        if !conflicts.is_empty() {
            return Err(ClaimError::SeatsUnavailable(conflicts));
        }

        let expires_at = now + ttl;
        for code in &sorted {
            seats.insert(*code, SeatState::Held { holder, expires_at });
        }

        Ok(HoldGrant { holder, expires_at })
    }

    /// Перевод HELD(holder) -> BOOKED(booking_id) для всего набора.
    ///
    /// Проверка владельца и дедлайна выполняется по значению под мьютексом —
    /// confirm никогда не проходит для холда, чей `expires_at` уже в прошлом,
    /// даже если sweeper ещё не добрался до этих мест. Повторный confirm той
    /// же брони по уже BOOKED-местам — no-op (повторная доставка вебхука).
    pub async fn confirm(
        &self,
        show_id: i64,
        codes: &[SeatCode],
        holder: Uuid,
        booking_id: i64,
    ) -> Result<(), ConfirmError> {
        let show = self
            .show(show_id)
            .ok_or(ConfirmError::ShowNotRegistered(show_id))?;

        let mut sorted = codes.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut seats = show.seats.lock().await;
        let now = Utc::now();

        // Сначала валидация всего набора, запись — только если набор целиком
        // проходит. Никаких частично подтверждённых корзин.
        for code in &sorted {
            match seats.get(code) {
                Some(SeatState::Held { holder: h, expires_at }) if *h == holder => {
                    if *expires_at <= now {
                        return Err(ConfirmError::HoldExpired);
                    }
                }
                Some(SeatState::Booked { booking_id: b }) if *b == booking_id => {}
                _ => return Err(ConfirmError::HoldNotOwned),
            }
        }

        for code in &sorted {
            seats.insert(*code, SeatState::Booked { booking_id });
        }

        Ok(())
    }

    /// Возврат HELD(holder) -> FREE. Идемпотентно: чужие, свободные и уже
    /// переиспользованные места молча пропускаются.
    pub async fn release(&self, show_id: i64, codes: &[SeatCode], holder: Uuid) {
        let Some(show) = self.show(show_id) else {
            return;
        };

        let mut seats = show.seats.lock().await;
        for code in codes {
            if let Some(SeatState::Held { holder: h, .. }) = seats.get(code) {
                if *h == holder {
                    seats.insert(*code, SeatState::Free);
                }
            }
        }
    }

    /// Мгновенный снимок состояния сеанса. Истёкшие холды показываются как
    /// FREE (наружу таймаут уже наступил, реклейм — дело техники).
    pub async fn snapshot(&self, show_id: i64) -> Option<BTreeMap<SeatCode, SeatStateKind>> {
        let show = self.show(show_id)?;
        let seats = show.seats.lock().await;
        let now = Utc::now();
        Some(
            seats
                .iter()
                .map(|(code, state)| (*code, state.kind(now)))
                .collect(),
        )
    }

    /// Забронированы ли места в пользу данной брони. `confirm` переводит
    /// корзину целиком, поэтому достаточно найти хотя бы одну BOOKED-запись
    /// с этим `booking_id`.
    pub async fn is_booked_by(&self, show_id: i64, codes: &[SeatCode], booking_id: i64) -> bool {
        let Some(show) = self.show(show_id) else {
            return false;
        };
        let seats = show.seats.lock().await;
        codes.iter().any(|code| {
            matches!(seats.get(code), Some(SeatState::Booked { booking_id: b }) if *b == booking_id)
        })
    }

    /// Восстановление BOOKED-записей при старте из подтверждённых броней.
    pub async fn restore_booked(&self, show_id: i64, codes: &[SeatCode], booking_id: i64) {
        let Some(show) = self.show(show_id) else {
            return;
        };
        let mut seats = show.seats.lock().await;
        for code in codes {
            seats.insert(*code, SeatState::Booked { booking_id });
        }
    }

    /// Восстановление живого холда при старте из PENDING-брони.
    pub async fn restore_hold(
        &self,
        show_id: i64,
        codes: &[SeatCode],
        holder: Uuid,
        expires_at: DateTime<Utc>,
    ) {
        let Some(show) = self.show(show_id) else {
            return;
        };
        let mut seats = show.seats.lock().await;
        for code in codes {
            // BOOKED не перетираем: подтверждённая запись сильнее холда
            if matches!(seats.get(code), Some(SeatState::Free)) {
                seats.insert(*code, SeatState::Held { holder, expires_at });
            }
        }
    }

    /// Системный реклейм всех истёкших холдов; возвращает их сгруппированными
    /// по владельцу. Эквивалент `release`, выполненный не владельцем, а
    /// системой, и такой же идемпотентный.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<ReclaimedHold> {
        let shows: Vec<(i64, Arc<ShowSeats>)> = {
            let guard = self.shows.read().unwrap();
            guard.iter().map(|(id, s)| (*id, s.clone())).collect()
        };

        let mut reclaimed = Vec::new();
        for (show_id, show) in shows {
            let mut seats = show.seats.lock().await;
            let mut by_holder: BTreeMap<Uuid, Vec<SeatCode>> = BTreeMap::new();

            for (code, state) in seats.iter() {
                if let SeatState::Held { holder, expires_at } = state {
                    if *expires_at <= now {
                        by_holder.entry(*holder).or_default().push(*code);
                    }
                }
            }

            for (holder, mut codes) in by_holder {
                codes.sort();
                for code in &codes {
                    seats.insert(*code, SeatState::Free);
                }
                reclaimed.push(ReclaimedHold {
                    show_id,
                    holder,
                    seats: codes,
                });
            }
        }

        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::str::FromStr;

    fn codes(list: &[&str]) -> Vec<SeatCode> {
        list.iter().map(|s| SeatCode::from_str(s).unwrap()).collect()
    }

    fn ledger_with(show_id: i64, layout: &[&str]) -> ReservationLedger {
        let ledger = ReservationLedger::new();
        ledger.ensure_show(show_id, codes(layout));
        ledger
    }

    #[tokio::test]
    async fn claim_is_all_or_nothing() {
        let ledger = ledger_with(1, &["A1", "A2", "B1"]);
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();

        ledger
            .try_claim(1, &codes(&["A1", "A2"]), x, Duration::minutes(5))
            .await
            .unwrap();

        // Y просит пересекающийся набор: отказ, и ровно по A2
        let err = ledger
            .try_claim(1, &codes(&["A2", "B1"]), y, Duration::minutes(5))
            .await
            .unwrap_err();
        assert_eq!(err, ClaimError::SeatsUnavailable(codes(&["A2"])));

        // B1 при этом остался свободен
        let snap = ledger.snapshot(1).await.unwrap();
        assert_eq!(snap[&SeatCode::new('B', 1)], SeatStateKind::Free);
    }

    #[tokio::test]
    async fn claim_reclaims_expired_foreign_hold() {
        let ledger = ledger_with(1, &["A1"]);
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();

        // Холд X с нулевым TTL истекает сразу
        ledger
            .try_claim(1, &codes(&["A1"]), x, Duration::seconds(0))
            .await
            .unwrap();

        // Y захватывает поверх истёкшего холда
        ledger
            .try_claim(1, &codes(&["A1"]), y, Duration::minutes(5))
            .await
            .unwrap();

        // Ленивая переуступка: confirm X теперь невозможен
        let err = ledger.confirm(1, &codes(&["A1"]), x, 100).await.unwrap_err();
        assert_eq!(err, ConfirmError::HoldNotOwned);
    }

    #[tokio::test]
    async fn unknown_seat_is_rejected() {
        let ledger = ledger_with(1, &["A1"]);
        let err = ledger
            .try_claim(1, &codes(&["A1", "Z9"]), Uuid::new_v4(), Duration::minutes(5))
            .await
            .unwrap_err();
        assert_eq!(err, ClaimError::UnknownSeat(SeatCode::new('Z', 9)));
    }

    #[tokio::test]
    async fn confirm_happy_path_books_exactly_the_requested_seats() {
        let ledger = ledger_with(1, &["A1", "A2", "B1"]);
        let x = Uuid::new_v4();

        ledger
            .try_claim(1, &codes(&["A1", "A2"]), x, Duration::minutes(5))
            .await
            .unwrap();
        ledger.confirm(1, &codes(&["A1", "A2"]), x, 42).await.unwrap();

        let snap = ledger.snapshot(1).await.unwrap();
        assert_eq!(snap[&SeatCode::new('A', 1)], SeatStateKind::Booked);
        assert_eq!(snap[&SeatCode::new('A', 2)], SeatStateKind::Booked);
        assert_eq!(snap[&SeatCode::new('B', 1)], SeatStateKind::Free);

        // Повторный confirm той же брони — no-op
        ledger.confirm(1, &codes(&["A1", "A2"]), x, 42).await.unwrap();
    }

    #[tokio::test]
    async fn confirm_fails_by_value_before_any_sweep() {
        let ledger = ledger_with(1, &["A1"]);
        let x = Uuid::new_v4();

        ledger
            .try_claim(1, &codes(&["A1"]), x, Duration::seconds(0))
            .await
            .unwrap();

        // Sweeper не запускался, но по значению дедлайн уже в прошлом
        let err = ledger.confirm(1, &codes(&["A1"]), x, 7).await.unwrap_err();
        assert_eq!(err, ConfirmError::HoldExpired);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let ledger = ledger_with(1, &["A1", "A2"]);
        let x = Uuid::new_v4();

        ledger
            .try_claim(1, &codes(&["A1", "A2"]), x, Duration::minutes(5))
            .await
            .unwrap();

        ledger.release(1, &codes(&["A1", "A2"]), x).await;
        // Повторный release и release чужих/несуществующих мест — no-op
        ledger.release(1, &codes(&["A1", "A2"]), x).await;
        ledger.release(1, &codes(&["A1"]), Uuid::new_v4()).await;
        ledger.release(99, &codes(&["A1"]), x).await;

        let snap = ledger.snapshot(1).await.unwrap();
        assert!(snap.values().all(|k| *k == SeatStateKind::Free));
    }

    #[tokio::test]
    async fn sweep_reclaims_only_expired_and_groups_by_holder() {
        let ledger = ledger_with(1, &["A1", "A2", "B1"]);
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();

        ledger
            .try_claim(1, &codes(&["A1", "A2"]), x, Duration::seconds(0))
            .await
            .unwrap();
        ledger
            .try_claim(1, &codes(&["B1"]), y, Duration::minutes(5))
            .await
            .unwrap();

        let reclaimed = ledger.sweep_expired(Utc::now()).await;
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].holder, x);
        assert_eq!(reclaimed[0].seats, codes(&["A1", "A2"]));

        // Повторный проход ничего не находит
        assert!(ledger.sweep_expired(Utc::now()).await.is_empty());

        let snap = ledger.snapshot(1).await.unwrap();
        assert_eq!(snap[&SeatCode::new('A', 1)], SeatStateKind::Free);
        assert_eq!(snap[&SeatCode::new('B', 1)], SeatStateKind::Held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_overlapping_claims_have_one_winner_per_seat() {
        let ledger = Arc::new(ledger_with(1, &["A1", "A2", "A3", "A4"]));
        let contested = codes(&["A2", "A3"]);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let want = contested.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .try_claim(1, &want, Uuid::new_v4(), Duration::minutes(5))
                    .await
            }));
        }

        let mut winners = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => winners += 1,
                Err(ClaimError::SeatsUnavailable(seats)) => {
                    // Проигравшие видят ровно оспариваемые места
                    assert_eq!(seats, contested);
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
    }

    proptest::proptest! {
        /// Для любых двух наборов мест второй захват проходит тогда и только
        /// тогда, когда наборы не пересекаются, а при отказе список
        /// конфликтов — в точности пересечение в порядке SeatCode.
        #[test]
        fn second_claim_conflicts_are_exactly_the_intersection(
            first in proptest::collection::btree_set(0u32..24, 1..8),
            second in proptest::collection::btree_set(0u32..24, 1..8),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let all: Vec<SeatCode> =
                    (0u32..24).map(|i| SeatCode::new(char::from(b'A' + (i / 6) as u8), i % 6 + 1)).collect();
                let pick = |idx: &BTreeSet<u32>| -> Vec<SeatCode> {
                    idx.iter().map(|i| all[*i as usize]).collect()
                };

                let ledger = ReservationLedger::new();
                ledger.ensure_show(1, all.iter().copied());

                let a = pick(&first);
                let b = pick(&second);
                ledger
                    .try_claim(1, &a, Uuid::new_v4(), Duration::minutes(5))
                    .await
                    .unwrap();

                let expected: Vec<SeatCode> =
                    second.intersection(&first).map(|i| all[*i as usize]).collect();
                match ledger.try_claim(1, &b, Uuid::new_v4(), Duration::minutes(5)).await {
                    Ok(_) => assert!(expected.is_empty()),
                    Err(ClaimError::SeatsUnavailable(got)) => assert_eq!(got, expected),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            });
        }
    }
}
