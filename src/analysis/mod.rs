//! Analysis server: Text-to-SQL over the log store with streaming,
//! conversation context, caching and anomaly alerts

pub mod events;
pub mod handlers;
pub mod stream;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::agent::SqlAgent;
use crate::alerting::AlertingService;
use crate::cache::QueryCache;
use crate::config::AnalysisConfig;
use crate::conversation::ConversationStore;
use crate::llm::{ChatModel, LlmClient};
use crate::storage::init_pool;
use crate::storage::repository::{LogRepository, QueryRepository, SchemaRepository};
use crate::supervisor;
use events::StreamEvent;
use ws::SubscriberSet;

/// Detector tick interval
const ANOMALY_INTERVAL: Duration = Duration::from_secs(300);

/// Everything the handlers share; the supervised singletons of the process
pub struct AnalysisApp {
    pub agent: SqlAgent,
    pub llm: Arc<dyn ChatModel>,
    pub log_repo: LogRepository,
    pub cache: Arc<QueryCache>,
    pub conversations: Arc<ConversationStore>,
    pub alerting: Arc<AlertingService>,
    pub subscribers: Arc<SubscriberSet>,
}

/// Start the analysis server: pool (fatal after retries), LLM client,
/// supervised anomaly detector, then serve until shutdown.
pub async fn run(
    config: AnalysisConfig,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let pool = init_pool(&config.database).await?;

    let llm: Arc<dyn ChatModel> = Arc::new(LlmClient::new(config.llm.clone())?);
    let schema_repo = SchemaRepository::new(pool.clone());
    let query_repo = QueryRepository::new(pool.clone());
    let log_repo = LogRepository::new(pool.clone());
    let conversations = Arc::new(ConversationStore::new());
    let cache = Arc::new(QueryCache::new(config.cache));
    let alerting = Arc::new(AlertingService::new(query_repo.clone()));
    let subscribers = Arc::new(SubscriberSet::new());

    let app = Arc::new(AnalysisApp {
        agent: SqlAgent::new(
            llm.clone(),
            schema_repo,
            query_repo,
            conversations.clone(),
        ),
        llm,
        log_repo,
        cache,
        conversations,
        alerting,
        subscribers,
    });

    spawn_anomaly_detector(app.clone());

    let router = router(app);

    tracing::info!("analysis server listening on {}", config.bind_addr);
    let listener = TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await?;

    tracing::info!("analysis server shut down gracefully");
    Ok(())
}

pub fn router(app: Arc<AnalysisApp>) -> Router {
    Router::new()
        .route("/", get(handlers::liveness))
        .route("/query", post(handlers::query))
        .route("/summarize", post(handlers::summarize))
        .route("/services", get(handlers::services))
        .route("/stats", get(handlers::stats))
        .route("/alerts/history", get(handlers::alert_history))
        .route("/alerts/check", post(handlers::check_alerts))
        .route("/invalidate_cache", post(handlers::invalidate_cache))
        .route("/ws/query", get(ws::ws_query))
        .with_state(app)
}

/// Periodic anomaly detection under supervision: every tick runs the three
/// checks and pushes findings to all streaming subscribers.
fn spawn_anomaly_detector(app: Arc<AnalysisApp>) {
    // The healthy-runtime threshold must outlast the tick interval, or a
    // detector that sleeps a full tick and then fails its first check would
    // reset the failure budget on every restart.
    supervisor::spawn_supervised("anomaly-detector", ANOMALY_INTERVAL * 2, move || {
        anomaly_loop(app.clone())
    });
}

async fn anomaly_loop(app: Arc<AnalysisApp>) -> anyhow::Result<()> {
    loop {
        tokio::time::sleep(ANOMALY_INTERVAL).await;
        let alerts = app.alerting.check_anomalies().await?;
        if alerts.is_empty() {
            continue;
        }
        tracing::info!("anomaly detector raised {} alert(s)", alerts.len());
        for alert in alerts {
            app.subscribers.broadcast(&StreamEvent::Alert { alert });
        }
    }
}
