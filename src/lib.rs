pub mod cache;
pub mod catalog;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod redis_client;
pub mod services;
pub mod store;

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::cache::AvailabilityService;
use crate::catalog::{PgShowCatalog, ShowCatalog};
use crate::ledger::ReservationLedger;
use crate::models::BookingStatus;
use crate::services::booking::BookingOrchestrator;
use crate::services::notify::{HttpNotifier, NoopNotifier, Notifier};
use crate::store::{BookingStore, PgBookingStore};

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub db: database::Database,
    pub redis: redis_client::RedisClient,
    pub config: config::Config,
    pub ledger: Arc<ReservationLedger>,
    pub bookings: Arc<dyn BookingStore>,
    pub catalog: Arc<dyn ShowCatalog>,
    pub orchestrator: Arc<BookingOrchestrator>,
    pub availability: AvailabilityService,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub async fn new(config: config::Config) -> anyhow::Result<Arc<Self>> {
        let db = database::Database::new(&config.database.url, config.database.pool_size).await?;

        db.run_migrations().await?;

        let redis = redis_client::RedisClient::new(&config.redis.url).await?;

        let ledger = Arc::new(ReservationLedger::new());
        let bookings: Arc<dyn BookingStore> = Arc::new(PgBookingStore::new(db.pool.clone()));
        let catalog: Arc<dyn ShowCatalog> = Arc::new(PgShowCatalog::new(db.pool.clone()));

        // Леджер живёт в памяти процесса, после рестарта его надо
        // восстановить из Postgres до приёма первого запроса
        recover_ledger(&ledger, catalog.as_ref(), bookings.as_ref()).await?;

        let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
            Some(url) => Arc::new(HttpNotifier::new(url.clone())),
            None => Arc::new(NoopNotifier),
        };

        let orchestrator = Arc::new(BookingOrchestrator::new(
            ledger.clone(),
            bookings.clone(),
            catalog.clone(),
            notifier.clone(),
            chrono::Duration::seconds(config.booking.hold_ttl_seconds),
        ));

        let availability = AvailabilityService::new(
            redis.clone(),
            ledger.clone(),
            catalog.clone(),
            config.booking.availability_ttl_seconds,
        );

        Ok(Arc::new(Self {
            db,
            redis,
            config,
            ledger,
            bookings,
            catalog,
            orchestrator,
            availability,
            notifier,
        }))
    }
}

/// Прогрев леджера из персистентного состояния: схемы залов, затем
/// подтверждённые брони и ещё живые холды. Истёкшие холды не
/// восстанавливаем, их закроет первый же проход sweeper'а.
async fn recover_ledger(
    ledger: &ReservationLedger,
    catalog: &dyn ShowCatalog,
    bookings: &dyn BookingStore,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let shows = catalog.list_shows().await?;
    let mut restored_bookings = 0usize;
    let mut restored_holds = 0usize;

    for show in &shows {
        let Some(layout) = catalog.layout(show.id).await? else {
            warn!("Show {} has no seat layout, skipping recovery", show.id);
            continue;
        };
        ledger.ensure_show(show.id, layout.seat_codes());

        for booking in bookings
            .for_show_in_status(show.id, BookingStatus::Confirmed)
            .await?
        {
            ledger
                .restore_booked(show.id, &booking.seat_codes, booking.id)
                .await;
            restored_bookings += 1;
        }

        for booking in bookings
            .for_show_in_status(show.id, BookingStatus::Pending)
            .await?
        {
            if booking.hold_expired(now) {
                continue;
            }
            ledger
                .restore_hold(
                    show.id,
                    &booking.seat_codes,
                    booking.hold_token,
                    booking.hold_expires_at,
                )
                .await;
            restored_holds += 1;
        }
    }

    info!(
        "Ledger recovered: {} shows, {} confirmed bookings, {} live holds",
        shows.len(),
        restored_bookings,
        restored_holds
    );
    Ok(())
}
