//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use schoolbell_core::config::{GatewayConfig, SchoolbellConfig};
use schoolbell_dispatch::{NotifyDb, TriggerEvaluator};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Dispatch engine; cheap to clone, runs may overlap.
    pub evaluator: TriggerEvaluator,
    /// Same database the engine writes to; used for settings, preferences and run history.
    pub db: Arc<NotifyDb>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/notifications/run", post(super::routes::run_notifications))
        .route("/api/v1/notifications/runs", get(super::routes::list_runs))
        .route("/api/v1/categories", get(super::routes::list_categories))
        .route(
            "/api/v1/institutions/{id}/settings/{category}",
            get(super::routes::get_setting),
        )
        .route(
            "/api/v1/institutions/{id}/settings/{category}",
            put(super::routes::update_setting),
        )
        .route("/api/v1/preferences", put(super::routes::update_preference))
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: SCHOOLBELL_CORS_ORIGINS=https://portal.school.ac.ke
            if let Ok(origins_str) = std::env::var("SCHOOLBELL_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: &SchoolbellConfig, db: Arc<NotifyDb>) -> anyhow::Result<()> {
    let evaluator = TriggerEvaluator::from_config(config, db.clone())?;

    let state = AppState {
        gateway_config: config.gateway.clone(),
        start_time: std::time::Instant::now(),
        evaluator,
        db,
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Schoolbell gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
