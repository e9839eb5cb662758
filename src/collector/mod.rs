//! Collector server: batch ingest endpoint and store statistics

pub mod ingest;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use deadpool_postgres::Pool;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::CollectorConfig;
use crate::errors::{ErrorCode, ErrorEnvelope};
use crate::storage::repository::LogRepository;
use crate::storage::{ensure_schema, init_pool};

/// Shared state for collector handlers
#[derive(Clone)]
pub struct CollectorState {
    pub pool: Pool,
    /// Client for the best-effort cache-invalidation call
    pub http: reqwest::Client,
    pub analysis_url: Option<String>,
}

/// Start the collector: pool init (fatal on failure after retries), schema
/// bootstrap, then serve until the shutdown signal fires.
pub async fn run(
    config: CollectorConfig,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let pool = init_pool(&config.database).await?;
    ensure_schema(&pool).await?;

    let state = CollectorState {
        pool,
        http: reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?,
        analysis_url: config.analysis_url.clone(),
    };

    let app = router(state);

    tracing::info!("collector listening on {}", config.bind_addr);
    let listener = TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await?;

    tracing::info!("collector shut down gracefully");
    Ok(())
}

pub fn router(state: CollectorState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/logs", post(receive_logs))
        .route("/stats", get(stats))
        .with_state(Arc::new(state))
}

async fn liveness() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "log-collector"}))
}

/// `POST /logs`: decompress if needed, validate, coerce, bulk-insert.
///
/// Responses: 200 `{"status":"ok","count":N}`, 400 on malformed input,
/// 500 with a sanitized envelope on store failure.
async fn receive_logs(
    State(state): State<Arc<CollectorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ErrorEnvelope> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);

    let raw_records = ingest::parse_batch(&body, gzipped)
        .map_err(|reason| ErrorEnvelope::new(ErrorCode::InvalidRequest, reason))?;

    if raw_records.is_empty() {
        return Ok(Json(json!({"status": "ok", "count": 0})));
    }

    let now = Utc::now();
    let rows: Vec<_> = raw_records
        .into_iter()
        .map(|raw| ingest::coerce(raw, now))
        .collect();

    let count = ingest::insert_batch(&state.pool, &rows)
        .await
        .map_err(|e| ErrorEnvelope::new(ErrorCode::DatabaseError, e.to_string()))?;

    tracing::debug!("ingested batch of {count}");
    notify_analysis(&state);

    Ok(Json(json!({"status": "ok", "count": count})))
}

/// Fire-and-forget cache invalidation so analyses never serve results that
/// predate the rows just written. Failures only log.
fn notify_analysis(state: &CollectorState) {
    let Some(base) = state.analysis_url.clone() else {
        return;
    };
    let http = state.http.clone();
    tokio::spawn(async move {
        let url = format!("{base}/invalidate_cache");
        if let Err(e) = http.post(&url).send().await {
            tracing::debug!("cache invalidation call failed: {e}");
        }
    });
}

async fn stats(
    State(state): State<Arc<CollectorState>>,
) -> Result<Json<crate::storage::repository::LogStats>, ErrorEnvelope> {
    let repo = LogRepository::new(state.pool.clone());
    let stats = repo
        .stats()
        .await
        .map_err(|e| ErrorEnvelope::new(ErrorCode::DatabaseError, e.to_string()))?;
    Ok(Json(stats))
}
