//! Registry API Server
//!
//! Serves the organization billing endpoints and receives provider webhooks.

use std::net::SocketAddr;

use axum::http::{header, HeaderValue, Method};
use registry_api::{routes::create_router, AppState, Config};
use registry_billing::BillingService;
use registry_shared::{create_pool, run_migrations};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,registry_api=debug,registry_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Registry API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        run_migrations(&pool).await?;
        tracing::info!("Database migrations applied");
    } else {
        tracing::info!("Skipping database migrations (RUN_MIGRATIONS=false)");
    }

    let billing = BillingService::from_env(pool.clone())?;
    if billing.is_mock() {
        tracing::warn!("Mock billing backend active; /mock/billing routes are enabled");
    }

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]);

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(pool, config, billing);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
