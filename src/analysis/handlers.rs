// REST surface of the analysis server

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::events::StreamEvent;
use super::stream::{self, QueryRequest, Terminal};
use super::AnalysisApp;
use crate::agent::prompts;
use crate::errors::{ErrorCode, ErrorEnvelope};

pub async fn liveness() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "log-analysis"}))
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /query
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub question: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_max_results() -> usize {
    100
}

/// Synchronous Text-to-SQL: collects the whole run, returns the terminal
pub async fn query(
    State(app): State<Arc<AnalysisApp>>,
    Json(body): Json<QueryBody>,
) -> Result<Json<super::events::CompleteResult>, ErrorEnvelope> {
    if body.question.trim().is_empty() {
        return Err(ErrorEnvelope::new(
            ErrorCode::MissingParameter,
            "question must not be empty",
        ));
    }

    let request = QueryRequest {
        question: body.question,
        max_results: body.max_results,
        conversation_id: "default".to_string(),
        time_range: None,
    };

    match stream::execute_query(&app, request).await {
        Terminal::Complete(result) => Ok(Json(result)),
        Terminal::Error(envelope) => Err(envelope),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /summarize
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SummarizeBody {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub insight: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SummarizeResponse {
    pub summary: String,
}

/// Summarize a conversation transcript with the LLM
pub async fn summarize(
    State(app): State<Arc<AnalysisApp>>,
    Json(body): Json<SummarizeBody>,
) -> Result<Json<SummarizeResponse>, ErrorEnvelope> {
    if body.messages.is_empty() {
        return Err(ErrorEnvelope::new(
            ErrorCode::MissingParameter,
            "messages must not be empty",
        ));
    }

    let transcript = render_transcript(&body.messages);
    let prompt = prompts::conversation_summary(&transcript);

    let summary = app
        .llm
        .complete(&prompt)
        .await
        .map_err(|e| ErrorEnvelope::new(e.error_code(), e.to_string()))?;

    Ok(Json(SummarizeResponse {
        summary: summary.trim().to_string(),
    }))
}

/// User turns render as questions, assistant turns as result counts plus a
/// truncated insight line.
fn render_transcript(messages: &[ChatMessage]) -> String {
    let mut lines = Vec::new();
    let mut question_no = 0usize;
    for message in messages {
        match message.role.as_str() {
            "user" => {
                question_no += 1;
                lines.push(format!("{question_no}. Q: {}", message.content));
            }
            "ai" | "assistant" => {
                let result = message
                    .count
                    .map(|count| format!("{count}건"))
                    .unwrap_or_else(|| "N/A".to_string());
                lines.push(format!("   A: {result}"));
                if let Some(insight) = &message.insight {
                    let short: String = insight.chars().take(100).collect();
                    lines.push(format!("   인사이트: {short}..."));
                }
            }
            _ => {}
        }
    }
    lines.join("\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Store views
// ─────────────────────────────────────────────────────────────────────────────

pub async fn services(
    State(app): State<Arc<AnalysisApp>>,
) -> Result<Json<serde_json::Value>, ErrorEnvelope> {
    let services = app
        .log_repo
        .services()
        .await
        .map_err(|e| ErrorEnvelope::new(ErrorCode::DatabaseError, e.to_string()))?;
    Ok(Json(json!({"services": services})))
}

/// Store statistics plus the result-cache state
pub async fn stats(
    State(app): State<Arc<AnalysisApp>>,
) -> Result<Json<serde_json::Value>, ErrorEnvelope> {
    let stats = app
        .log_repo
        .stats()
        .await
        .map_err(|e| ErrorEnvelope::new(ErrorCode::DatabaseError, e.to_string()))?;
    let mut value = serde_json::to_value(&stats)
        .map_err(|e| ErrorEnvelope::new(ErrorCode::InternalError, e.to_string()))?;
    if let Some(object) = value.as_object_mut() {
        object.insert("cache".to_string(), json!(app.cache.stats().await));
    }
    Ok(Json(value))
}

// ─────────────────────────────────────────────────────────────────────────────
// Alerts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    20
}

pub async fn alert_history(
    State(app): State<Arc<AnalysisApp>>,
    Query(params): Query<HistoryParams>,
) -> Json<serde_json::Value> {
    let alerts = app.alerting.history(params.limit).await;
    Json(json!({"alerts": alerts}))
}

/// Manual anomaly sweep; findings are recorded and broadcast as usual
pub async fn check_alerts(
    State(app): State<Arc<AnalysisApp>>,
) -> Result<Json<serde_json::Value>, ErrorEnvelope> {
    let alerts = app
        .alerting
        .check_anomalies()
        .await
        .map_err(|e| ErrorEnvelope::new(ErrorCode::DatabaseError, e.to_string()))?;

    for alert in &alerts {
        app.subscribers.broadcast(&StreamEvent::Alert {
            alert: alert.clone(),
        });
    }

    Ok(Json(json!({"alerts": alerts, "count": alerts.len()})))
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache control
// ─────────────────────────────────────────────────────────────────────────────

/// Invoked by the collector after inserts to guarantee freshness
pub async fn invalidate_cache(State(app): State<Arc<AnalysisApp>>) -> Json<serde_json::Value> {
    app.cache.invalidate_all().await;
    Json(json!({
        "status": "cache_invalidated",
        "message": "모든 캐시가 무효화되었습니다",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_rendering_pairs_questions_and_answers() {
        let messages = vec![
            ChatMessage {
                role: "user".to_string(),
                content: "payment-api 에러".to_string(),
                sql: None,
                count: None,
                insight: None,
            },
            ChatMessage {
                role: "ai".to_string(),
                content: String::new(),
                sql: Some("SELECT 1".to_string()),
                count: Some(12),
                insight: Some("에러가 집중됨".to_string()),
            },
            ChatMessage {
                role: "user".to_string(),
                content: "그 서비스 느린 API".to_string(),
                sql: None,
                count: None,
                insight: None,
            },
        ];
        let text = render_transcript(&messages);
        assert!(text.contains("1. Q: payment-api 에러"));
        assert!(text.contains("A: 12건"));
        assert!(text.contains("인사이트: 에러가 집중됨..."));
        assert!(text.contains("2. Q: 그 서비스 느린 API"));
    }

    #[test]
    fn assistant_without_count_renders_na() {
        let messages = vec![ChatMessage {
            role: "assistant".to_string(),
            content: String::new(),
            sql: None,
            count: None,
            insight: None,
        }];
        assert!(render_transcript(&messages).contains("A: N/A"));
    }
}
