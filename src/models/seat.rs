use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Адрес места в зале: буква ряда + номер колонки ("A1", "B12").
///
/// Порядок (`Ord`) — сначала ряд, потом номер. Этот порядок фиксирован для
/// всех вызовов `try_claim`, чтобы конфликты по пересекающимся наборам мест
/// всегда разрешались детерминированно.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeatCode {
    pub row: char,
    pub number: u32,
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("некорректный код места '{0}': ожидается буква ряда и номер, например A1")]
pub struct SeatCodeParseError(pub String);

impl SeatCode {
    pub fn new(row: char, number: u32) -> Self {
        Self { row, number }
    }
}

impl fmt::Display for SeatCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row, self.number)
    }
}

impl FromStr for SeatCode {
    type Err = SeatCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let row = chars
            .next()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_uppercase())
            .ok_or_else(|| SeatCodeParseError(s.to_string()))?;

        let digits = chars.as_str();
        let number: u32 = digits
            .parse()
            .map_err(|_| SeatCodeParseError(s.to_string()))?;
        if number == 0 {
            return Err(SeatCodeParseError(s.to_string()));
        }

        Ok(SeatCode { row, number })
    }
}

// В JSON и в БД код места живет как строка
impl Serialize for SeatCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SeatCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Состояние записи резервации одного места.
///
/// Допустимые переходы: FREE -> HELD -> BOOKED и FREE -> HELD -> FREE.
/// Прямого перехода FREE -> BOOKED нет.
#[derive(Debug, Clone, PartialEq)]
pub enum SeatState {
    Free,
    Held {
        holder: Uuid,
        expires_at: DateTime<Utc>,
    },
    Booked {
        booking_id: i64,
    },
}

impl SeatState {
    /// Просрочен ли холд. Проверка по значению `expires_at`, а не по факту
    /// прохода sweeper'а — значение и есть единственный арбитр таймаута.
    pub fn is_expired_hold(&self, now: DateTime<Utc>) -> bool {
        matches!(self, SeatState::Held { expires_at, .. } if *expires_at <= now)
    }

    /// Можно ли захватить место заново: свободно либо холд истёк.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self {
            SeatState::Free => true,
            SeatState::Held { expires_at, .. } => *expires_at <= now,
            SeatState::Booked { .. } => false,
        }
    }

    /// Публичный вид состояния (без владельца и дедлайна).
    pub fn kind(&self, now: DateTime<Utc>) -> SeatStateKind {
        match self {
            SeatState::Free => SeatStateKind::Free,
            // Истёкший холд снаружи уже выглядит свободным
            SeatState::Held { expires_at, .. } if *expires_at <= now => SeatStateKind::Free,
            SeatState::Held { .. } => SeatStateKind::Held,
            SeatState::Booked { .. } => SeatStateKind::Booked,
        }
    }
}

/// Вид состояния места для выдачи наружу (схема зала в UI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeatStateKind {
    Free,
    Held,
    Booked,
}

impl fmt::Display for SeatStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeatStateKind::Free => write!(f, "FREE"),
            SeatStateKind::Held => write!(f, "HELD"),
            SeatStateKind::Booked => write!(f, "BOOKED"),
        }
    }
}
