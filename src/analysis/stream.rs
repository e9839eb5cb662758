// Streaming facade over the workflow
//
// One entry point serves both surfaces: `run_query` drives the cache check
// and the workflow, reports every event through the callback in order, and
// returns the terminal. The WebSocket controller forwards events as they
// appear; the synchronous endpoint ignores them and uses the return value.

use super::events::{CompleteResult, StreamEvent};
use super::AnalysisApp;
use crate::agent::{AgentState, MAX_SQL_RETRIES};
use crate::cache::QueryCache;
use crate::conversation::ConversationTurn;
use crate::errors::{ErrorCode, ErrorEnvelope};
use crate::model::TimeRange;
use chrono::Utc;

/// A query as submitted over either surface
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    pub max_results: usize,
    pub conversation_id: String,
    pub time_range: Option<TimeRange>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            max_results: 100,
            conversation_id: "default".to_string(),
            time_range: None,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone)]
pub enum Terminal {
    Complete(CompleteResult),
    Error(ErrorEnvelope),
}

/// Execute a query, streaming events through `on_event`.
///
/// Event order: `cache_hit` short-circuits everything; otherwise
/// `node_start`/domain events/`node_end` per stage in visit order, then the
/// terminal (`complete` or `error`), which is both emitted and returned.
pub async fn run_query<F>(app: &AnalysisApp, request: QueryRequest, mut on_event: F) -> Terminal
where
    F: FnMut(StreamEvent),
{
    let cache_key = QueryCache::cache_key(&request.question, request.max_results);

    if let Some(cached) = app.cache.get(&cache_key).await {
        if let Ok(result) = serde_json::from_value::<CompleteResult>(cached) {
            on_event(StreamEvent::CacheHit {
                message: "결과를 캐시에서 가져왔습니다".to_string(),
            });
            on_event(StreamEvent::Complete(result.clone()));
            return Terminal::Complete(result);
        }
    }

    let mut state = AgentState::new(request.question.clone(), request.max_results)
        .with_conversation(request.conversation_id.clone())
        .with_time_range(request.time_range.clone());
    state.cache_key = cache_key.clone();

    app.agent.run(&mut state, &mut on_event).await;

    let terminal = format_final_result(&state);
    match &terminal {
        Terminal::Complete(result) => {
            let had_clarifications = !state.clarifications_needed.is_empty();
            if !had_clarifications {
                app.conversations
                    .add_turn(
                        &state.conversation_id,
                        ConversationTurn {
                            question: state.question.clone(),
                            resolved_question: state.resolved_question.clone(),
                            sql: state.generated_sql.clone(),
                            result_count: result.count,
                            focus: state.current_focus.clone(),
                            timestamp: Utc::now(),
                        },
                    )
                    .await;

                // Clarification runs are never cached: an ambiguous question
                // must clarify again next time.
                if let Ok(value) = serde_json::to_value(result) {
                    app.cache.set(cache_key, value).await;
                }
            }
            on_event(StreamEvent::Complete(result.clone()));
        }
        Terminal::Error(envelope) => {
            on_event(StreamEvent::error(envelope.clone()));
        }
    }

    terminal
}

/// Synchronous surface: run to completion, return only the terminal
pub async fn execute_query(app: &AnalysisApp, request: QueryRequest) -> Terminal {
    run_query(app, request, |_event| {}).await
}

/// Fold the final state into a terminal payload
fn format_final_result(state: &AgentState) -> Terminal {
    if let Some(message) = &state.error_message {
        return Terminal::Error(ErrorEnvelope::new(
            state.error_code.unwrap_or(ErrorCode::InternalError),
            message,
        ));
    }

    if state.retry_count >= MAX_SQL_RETRIES {
        if let Some(validation_error) = &state.validation_error {
            return Terminal::Error(ErrorEnvelope::new(
                ErrorCode::InvalidSql,
                format!("SQL validation failed after {MAX_SQL_RETRIES} retries: {validation_error}"),
            ));
        }
    }

    Terminal::Complete(CompleteResult {
        sql: (!state.generated_sql.is_empty()).then(|| state.generated_sql.clone()),
        results: state.formatted.data.clone(),
        count: state.formatted.count,
        displayed: state.formatted.displayed,
        truncated: state.formatted.truncated,
        execution_time_ms: state.execution_time_ms,
        insight: state.insight.clone(),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn fatal_error_becomes_error_terminal() {
        let mut state = AgentState::new("q", 100);
        state.fail(ErrorCode::DatabaseError, "connection refused");

        match format_final_result(&state) {
            Terminal::Error(envelope) => {
                assert_eq!(envelope.error_code, ErrorCode::DatabaseError);
            }
            Terminal::Complete(_) => panic!("expected error terminal"),
        }
    }

    #[test]
    fn exhausted_validation_is_invalid_sql() {
        let mut state = AgentState::new("delete logs from yesterday", 100);
        state.retry_count = 3;
        state.validation_error = Some("Dangerous keyword detected: DELETE".to_string());

        match format_final_result(&state) {
            Terminal::Error(envelope) => {
                assert_eq!(envelope.error_code, ErrorCode::InvalidSql);
                assert!(envelope
                    .message
                    .contains("SQL validation failed after 3 retries"));
            }
            Terminal::Complete(_) => panic!("expected error terminal"),
        }
    }

    #[test]
    fn recovered_validation_failures_still_complete() {
        let mut state = AgentState::new("q", 100);
        state.retry_count = 2;
        state.validation_error = None;
        state.generated_sql = "SELECT 1".to_string();

        match format_final_result(&state) {
            Terminal::Complete(result) => {
                assert_eq!(result.sql.as_deref(), Some("SELECT 1"));
                assert!(result.error.is_none());
            }
            Terminal::Error(_) => panic!("expected complete terminal"),
        }
    }

    #[test]
    fn clarification_run_completes_with_empty_payload() {
        let state = AgentState::new("에러 로그", 100);
        match format_final_result(&state) {
            Terminal::Complete(result) => {
                assert_eq!(result.sql, None);
                assert_eq!(result.count, 0);
                assert!(!result.truncated);
            }
            Terminal::Error(_) => panic!("expected complete terminal"),
        }
    }
}
