use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cinema_booking::{config::Config, controllers, services::sweeper::ExpirySweeper, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.app.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Cinema Booking API");

    let app_state = AppState::new(config.clone()).await?;

    // --- Start background tasks ---

    // Sweeper: реклейм истёкших холдов и закрытие их броней
    let sweeper = ExpirySweeper::new(
        app_state.ledger.clone(),
        app_state.bookings.clone(),
        app_state.notifier.clone(),
        Some(app_state.availability.clone()),
    );
    let sweep_interval = Duration::from_secs(config.booking.sweep_interval_seconds);
    task::spawn(async move {
        loop {
            sweeper.run_once().await;
            tokio::time::sleep(sweep_interval).await;
        }
    });

    // --- Start the web server ---

    let app = Router::new()
        .route("/", get(|| async { "Cinema Booking API v1.0" }))
        .route("/health", get(|| async { "OK" }))
        // Mount the routes from the controllers module
        .nest("/api", controllers::routes())
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
