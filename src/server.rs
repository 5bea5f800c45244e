//! HTTP server bootstrap for the key transparency sequencer.
//!
//! This module wires together:
//! - configuration
//! - database connection pool (batch definitions and mutation logs)
//! - map and root-log backends with their verifying clients
//! - the sequencer and its periodic worker
//! - the Axum router

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::clients::{VerifyingLogClient, VerifyingMapClient};
use crate::crypto::SigningKeyPair;
use crate::infra::{
    os_shutdown_signal, GracefulShutdownConfig, InMemoryLogService, InMemoryMapService,
    PgBatchStore, PgMutationLog, ShutdownCoordinator,
};
use crate::metrics::MetricsRegistry;
use crate::sequencer::{spawn_sequencer_worker, Sequencer, SequencerConfig, VersionedEntryResolver};
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Server listen address.
    pub listen_addr: SocketAddr,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Hex Ed25519 secret for map roots; generated when unset.
    pub map_signing_key: Option<String>,
    /// Hex Ed25519 secret for root-log roots; generated when unset.
    pub log_signing_key: Option<String>,
    pub sequencer: SequencerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/keytrans_sequencer".to_string());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;

        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            database_url,
            listen_addr,
            max_connections,
            map_signing_key: std::env::var("MAP_SIGNING_KEY").ok(),
            log_signing_key: std::env::var("LOG_SIGNING_KEY").ok(),
            sequencer: SequencerConfig::from_env(),
        })
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub sequencer: Arc<Sequencer>,
    pub metrics: Arc<MetricsRegistry>,
}

fn load_key(name: &str, hex: Option<&str>) -> anyhow::Result<SigningKeyPair> {
    match hex {
        Some(hex) => SigningKeyPair::from_hex(hex).with_context(|| format!("invalid {name}")),
        None => {
            warn!("{name} not set, generating an ephemeral key");
            Ok(SigningKeyPair::generate())
        }
    }
}

/// Start the HTTP server and the sequencer worker.
pub async fn run() -> anyhow::Result<()> {
    let telemetry = TelemetryConfig::from_env();
    init_telemetry(&telemetry).map_err(|e| anyhow::anyhow!("telemetry init failed: {e}"))?;

    info!("Starting keytrans-sequencer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    info!("Connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("database connection failed")?;

    let batches = Arc::new(PgBatchStore::new(pool.clone()));
    batches.initialize().await?;
    let mutations = Arc::new(PgMutationLog::new(pool.clone()));
    mutations.initialize().await?;

    let map_key = load_key("MAP_SIGNING_KEY", config.map_signing_key.as_deref())?;
    let log_key = load_key("LOG_SIGNING_KEY", config.log_signing_key.as_deref())?;
    info!(
        map_public_key = %hex::encode(map_key.public_key_bytes()),
        log_public_key = %hex::encode(log_key.public_key_bytes()),
        "Root signing keys loaded"
    );

    let map_service = Arc::new(InMemoryMapService::new(map_key));
    let log_service = Arc::new(InMemoryLogService::new(log_key));
    for directory_id in &config.sequencer.directories {
        map_service.create_directory(directory_id).await;
        log_service.create_directory(directory_id).await;
    }

    let log_client = Arc::new(VerifyingLogClient::new(
        log_service.clone(),
        log_service.verifier(),
    ));
    let map_client = Arc::new(
        VerifyingMapClient::new(map_service.clone(), map_service.verifier())
            .with_log(log_client.clone()),
    );

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let sequencer = Arc::new(
        Sequencer::new(
            config.sequencer.clone(),
            mutations,
            batches,
            map_client,
            log_client,
            Arc::new(VersionedEntryResolver::new()),
        )
        .with_metrics(metrics.clone())
        .with_shutdown(coordinator.signal()),
    );

    let (worker, _control) = spawn_sequencer_worker(sequencer.clone(), coordinator.signal());

    let state = AppState { sequencer, metrics };
    let app = build_router().with_state(state);

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    let shutdown = GracefulShutdownConfig::default();
    let signal_coordinator = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            os_shutdown_signal().await;
            signal_coordinator.shutdown();
            tokio::time::sleep(shutdown.shutdown_delay).await;
        })
        .await?;

    coordinator.shutdown();
    if tokio::time::timeout(shutdown.drain_timeout, worker)
        .await
        .is_err()
    {
        warn!("Sequencer worker did not stop within the drain timeout");
    }

    pool.close().await;
    shutdown_telemetry();
    info!("Shutdown complete");
    Ok(())
}

/// Router with the API under `/api` plus health and metrics endpoints.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .nest("/api", crate::api::router())
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "keytrans-sequencer",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

/// Metrics as JSON, or Prometheus text with `?format=prometheus`.
async fn metrics_endpoint(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    if query.format.as_deref() == Some("prometheus") {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            state.metrics.to_prometheus().await,
        )
            .into_response()
    } else {
        Json(state.metrics.to_json().await).into_response()
    }
}
