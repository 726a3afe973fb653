use std::collections::BTreeMap;
use std::sync::Arc;

use redis::AsyncCommands;
use tracing::{debug, info};

use crate::catalog::ShowCatalog;
use crate::error::BookingError;
use crate::ledger::ReservationLedger;
use crate::models::SeatStateKind;
use crate::redis_client::RedisClient;

/// Read-side сервис доступности: схема зала ⊕ снимок леджера.
///
/// Снимки кешируются в Redis с TTL не больше интервала sweeper'а, так что
/// окно устаревания ограничено. Сервис сугубо консультативный: показать
/// место свободным он может с опозданием, но источником истины остаётся
/// `try_claim` — именно он авторитетно отказывает.
#[derive(Clone)]
pub struct AvailabilityService {
    redis: RedisClient,
    ledger: Arc<ReservationLedger>,
    catalog: Arc<dyn ShowCatalog>,
    ttl_seconds: u64,
}

impl AvailabilityService {
    pub fn new(
        redis: RedisClient,
        ledger: Arc<ReservationLedger>,
        catalog: Arc<dyn ShowCatalog>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            redis,
            ledger,
            catalog,
            ttl_seconds,
        }
    }

    fn cache_key(show_id: i64) -> String {
        format!("availability:{}", show_id)
    }

    /// Карта состояний мест сеанса. `None` — сеанс неизвестен.
    pub async fn seat_map(
        &self,
        show_id: i64,
    ) -> Result<Option<BTreeMap<String, SeatStateKind>>, BookingError> {
        // Сначала пробуем кеш
        if let Some(cached) = self.get_from_cache(show_id).await {
            return Ok(Some(cached));
        }

        // Кеш пуст или Redis лежит — собираем снимок из леджера
        let Some(layout) = self.catalog.layout(show_id).await? else {
            return Ok(None);
        };
        self.ledger.ensure_show(show_id, layout.seat_codes());

        let snapshot = self.ledger.snapshot(show_id).await.unwrap_or_default();
        let map: BTreeMap<String, SeatStateKind> = snapshot
            .into_iter()
            .map(|(code, kind)| (code.to_string(), kind))
            .collect();

        self.save_to_cache(show_id, &map).await;
        Ok(Some(map))
    }

    /// Сброс кеша сеанса после любого перехода его мест.
    pub async fn invalidate(&self, show_id: i64) {
        let mut conn = self.redis.conn.clone();
        let _: Result<(), _> = conn.del(Self::cache_key(show_id)).await;
        info!("Invalidated availability cache for show {}", show_id);
    }

    async fn get_from_cache(&self, show_id: i64) -> Option<BTreeMap<String, SeatStateKind>> {
        let mut conn = self.redis.conn.clone();
        let data: String = conn.get(Self::cache_key(show_id)).await.ok()?;
        serde_json::from_str(&data).ok()
    }

    async fn save_to_cache(&self, show_id: i64, map: &BTreeMap<String, SeatStateKind>) {
        let Ok(data) = serde_json::to_string(map) else {
            return;
        };
        let mut conn = self.redis.conn.clone();
        // Redis недоступен — не страшно, следующий запрос соберёт снимок заново
        if let Err(e) = conn
            .set_ex::<_, _, ()>(Self::cache_key(show_id), data, self.ttl_seconds)
            .await
        {
            debug!("failed to cache availability for show {}: {:?}", show_id, e);
        }
    }
}
