use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::seat::SeatCode;

/// Один сеанс (фильм + зал + время начала).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Show {
    pub id: i64,
    pub movie_title: String,
    pub theatre: String,
    pub screen: String,
    pub starts_at: DateTime<Utc>,
}

/// Ценовая категория и цена одного места.
///
/// Цена фиксируется при создании сеанса (price-at-booking-time): последующие
/// изменения тарифа категорию уже созданного сеанса не трогают.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatInfo {
    pub tier: String,
    pub price: f64,
}

/// Неизменяемая схема зала сеанса: код места -> категория и цена.
///
/// Схема фиксируется при создании сеанса и не мутируется, пока по ней
/// существуют резервации.
#[derive(Debug, Clone)]
pub struct ShowLayout {
    pub show_id: i64,
    seats: BTreeMap<SeatCode, SeatInfo>,
}

impl ShowLayout {
    pub fn new(show_id: i64, seats: BTreeMap<SeatCode, SeatInfo>) -> Self {
        Self { show_id, seats }
    }

    pub fn contains(&self, code: &SeatCode) -> bool {
        self.seats.contains_key(code)
    }

    pub fn seat_info(&self, code: &SeatCode) -> Option<&SeatInfo> {
        self.seats.get(code)
    }

    pub fn seat_codes(&self) -> impl Iterator<Item = SeatCode> + '_ {
        self.seats.keys().copied()
    }

    /// Суммарная стоимость набора мест. `None`, если какое-то место
    /// отсутствует в схеме.
    pub fn total_price(&self, codes: &[SeatCode]) -> Option<f64> {
        codes
            .iter()
            .map(|c| self.seats.get(c).map(|s| s.price))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ShowLayout {
        let mut seats = BTreeMap::new();
        seats.insert(
            SeatCode::new('A', 1),
            SeatInfo { tier: "vip".into(), price: 1500.0 },
        );
        seats.insert(
            SeatCode::new('B', 1),
            SeatInfo { tier: "standard".into(), price: 800.0 },
        );
        ShowLayout::new(7, seats)
    }

    #[test]
    fn total_price_sums_known_seats() {
        let l = layout();
        let total = l
            .total_price(&[SeatCode::new('A', 1), SeatCode::new('B', 1)])
            .unwrap();
        assert_eq!(total, 2300.0);
    }

    #[test]
    fn total_price_is_none_for_unknown_seat() {
        let l = layout();
        assert!(l.total_price(&[SeatCode::new('Z', 9)]).is_none());
    }
}
