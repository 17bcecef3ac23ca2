mod alerts;
mod api_keys;
mod audit;
mod config;
mod cost;
mod drift;
mod error;
mod extensions;
mod extractor;
mod ingestion;
mod instances;
mod notify;
mod protocol;
mod rate_limit;
mod rbac;
mod routes;
mod scheduled_tasks;
mod security;
mod session;
mod teams;
mod templates;
mod timeseries;
mod users;
mod ws_agent;
mod ws_terminal;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use routes::api_routes;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Console API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).json().init();

    dotenvy::dotenv().ok();
    let db_url = config::DATABASE_URL.as_str();
    let pool = PgPoolOptions::new().max_connections(5).connect(db_url).await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(?error, "database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE");
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    ingestion::spawn_stale_sweep(pool.clone());
    alerts::spawn(pool.clone(), std::sync::Arc::new(notify::WebhookSink::new()));
    scheduled_tasks::spawn(pool.clone());
    drift::spawn_scan_loop(pool.clone());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "listening for incoming connections");
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;

    Ok(())
}
