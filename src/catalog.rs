use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::error::StoreError;
use crate::models::{SeatCode, SeatInfo, Show, ShowLayout};
use crate::store::with_read_retry;

/// Read-only каталог сеансов и схем залов.
///
/// Оркестратор валидирует запросы и считает суммы только через этот
/// интерфейс; управление каталогом (CRUD кинотеатров и фильмов) живёт в
/// другом сервисе.
#[async_trait]
pub trait ShowCatalog: Send + Sync {
    async fn list_shows(&self) -> Result<Vec<Show>, StoreError>;

    async fn show(&self, show_id: i64) -> Result<Option<Show>, StoreError>;

    /// Схема зала сеанса: код места -> категория и цена.
    async fn layout(&self, show_id: i64) -> Result<Option<ShowLayout>, StoreError>;
}

/* ---------- Postgres ---------- */

pub struct PgShowCatalog {
    pool: Pool<Postgres>,
}

impl PgShowCatalog {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShowCatalog for PgShowCatalog {
    async fn list_shows(&self) -> Result<Vec<Show>, StoreError> {
        let pool = self.pool.clone();
        with_read_retry("list_shows", || {
            let pool = pool.clone();
            async move {
                let shows = sqlx::query_as::<_, Show>(
                    "SELECT id, movie_title, theatre, screen, starts_at
                     FROM shows
                     WHERE starts_at > NOW()
                     ORDER BY starts_at",
                )
                .fetch_all(&pool)
                .await?;
                Ok(shows)
            }
        })
        .await
    }

    async fn show(&self, show_id: i64) -> Result<Option<Show>, StoreError> {
        let pool = self.pool.clone();
        with_read_retry("get_show", || {
            let pool = pool.clone();
            async move {
                let show = sqlx::query_as::<_, Show>(
                    "SELECT id, movie_title, theatre, screen, starts_at
                     FROM shows WHERE id = $1",
                )
                .bind(show_id)
                .fetch_optional(&pool)
                .await?;
                Ok(show)
            }
        })
        .await
    }

    async fn layout(&self, show_id: i64) -> Result<Option<ShowLayout>, StoreError> {
        let pool = self.pool.clone();
        let rows: Vec<(String, String, f64)> = with_read_retry("get_layout", || {
            let pool = pool.clone();
            async move {
                let rows = sqlx::query_as(
                    "SELECT seat_code, tier, price::FLOAT8 as price
                     FROM show_seats
                     WHERE show_id = $1
                     ORDER BY seat_code",
                )
                .bind(show_id)
                .fetch_all(&pool)
                .await?;
                Ok(rows)
            }
        })
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut seats = BTreeMap::new();
        for (code, tier, price) in rows {
            let code: SeatCode = code
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("seat_code '{code}' в show_seats")))?;
            seats.insert(code, SeatInfo { tier, price });
        }

        Ok(Some(ShowLayout::new(show_id, seats)))
    }
}

/* ---------- In-memory (тесты и одноузловые стенды) ---------- */

#[derive(Default)]
pub struct MemoryShowCatalog {
    shows: RwLock<HashMap<i64, (Show, ShowLayout)>>,
}

impl MemoryShowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, show: Show, layout: ShowLayout) {
        self.shows
            .write()
            .unwrap()
            .insert(show.id, (show, layout));
    }
}

#[async_trait]
impl ShowCatalog for MemoryShowCatalog {
    async fn list_shows(&self) -> Result<Vec<Show>, StoreError> {
        let guard = self.shows.read().unwrap();
        let mut shows: Vec<Show> = guard.values().map(|(s, _)| s.clone()).collect();
        shows.sort_by_key(|s| (s.starts_at, s.id));
        Ok(shows)
    }

    async fn show(&self, show_id: i64) -> Result<Option<Show>, StoreError> {
        Ok(self
            .shows
            .read()
            .unwrap()
            .get(&show_id)
            .map(|(s, _)| s.clone()))
    }

    async fn layout(&self, show_id: i64) -> Result<Option<ShowLayout>, StoreError> {
        Ok(self
            .shows
            .read()
            .unwrap()
            .get(&show_id)
            .map(|(_, l)| l.clone()))
    }
}
