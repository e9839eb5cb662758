// Stages: schema retrieval, SQL generation, validation, execution, insight

use super::{sqlcheck, AgentState, SqlAgent};
use crate::analysis::events::StreamEvent;
use crate::conversation::extract_focus;
use crate::errors::{sanitize_message, ErrorCode};
use serde_json::json;

impl SqlAgent {
    /// Fetch schema text and the diverse sample for prompt injection
    pub(super) async fn retrieve_schema(&self, state: &mut AgentState) -> Vec<StreamEvent> {
        const NODE: &str = "retrieve_schema";

        let schema = match self.schema_repo.table_schema().await {
            Ok(schema) => schema,
            Err(e) => return vec![schema_failure(state, NODE, e)],
        };
        let sample = match self.schema_repo.sample_data().await {
            Ok(sample) => sample,
            Err(e) => return vec![schema_failure(state, NODE, e)],
        };

        state.schema_info = schema;
        state.sample_data = sample;

        vec![StreamEvent::NodeComplete {
            node: NODE,
            status: "completed",
            data: json!({
                "schema_retrieved": true,
                "sample_count": 10,
            }),
        }]
    }

    /// Ask the model for a statement and pull the SQL out of the response
    pub(super) async fn generate_sql(&self, state: &mut AgentState) -> Vec<StreamEvent> {
        const NODE: &str = "generate_sql";

        let prompt = super::prompts::sql_generation(
            &state.schema_info,
            &state.sample_data,
            &state.resolved_question,
            state.max_results,
        );

        match self.llm.complete(&prompt).await {
            Ok(response) => {
                let sql = sqlcheck::extract_sql(&response);
                state.generated_sql = sql.clone();
                vec![StreamEvent::NodeComplete {
                    node: NODE,
                    status: "completed",
                    data: json!({
                        "sql_generated": true,
                        "sql_length": sql.len(),
                    }),
                }]
            }
            Err(e) => {
                state.fail(e.error_code(), e.to_string());
                vec![StreamEvent::NodeComplete {
                    node: NODE,
                    status: "failed",
                    data: json!({
                        "error": e.to_string(),
                        "error_type": e.error_code(),
                    }),
                }]
            }
        }
    }

    /// Safety policy first, then a syntax parse; failures loop back to
    /// generation via the router.
    pub(super) fn validate_sql(&self, state: &mut AgentState) -> Vec<StreamEvent> {
        const NODE: &str = "validate_sql";

        let verdict = sqlcheck::validate_safety(&state.generated_sql)
            .and_then(|()| sqlcheck::validate_syntax(&state.generated_sql));

        match verdict {
            Ok(()) => {
                state.validation_error = None;
                vec![StreamEvent::NodeComplete {
                    node: NODE,
                    status: "completed",
                    data: json!({"validation_passed": true}),
                }]
            }
            Err(reason) => {
                state.retry_count += 1;
                state.validation_error = Some(reason.clone());
                vec![StreamEvent::ValidationFailed {
                    node: NODE,
                    message: format!("SQL 검증 실패: {reason}"),
                    data: json!({
                        "error": reason,
                        "retry_count": state.retry_count,
                    }),
                }]
            }
        }
    }

    /// Run the validated statement and capture the focus it implies
    pub(super) async fn execute_query(&self, state: &mut AgentState) -> Vec<StreamEvent> {
        const NODE: &str = "execute_query";

        match self.query_repo.execute_sql(&state.generated_sql).await {
            Ok((rows, elapsed_ms)) => {
                state.formatted = sqlcheck::format_results(&rows, state.max_results);
                state.current_focus = extract_focus(&state.generated_sql);
                state.execution_time_ms = elapsed_ms;
                state.query_results = rows;
                vec![StreamEvent::NodeComplete {
                    node: NODE,
                    status: "completed",
                    data: json!({
                        "result_count": state.query_results.len(),
                        "execution_time_ms": elapsed_ms,
                    }),
                }]
            }
            Err(e) => {
                let reason = sanitize_message(&e.to_string());
                state.fail(ErrorCode::DatabaseError, reason.clone());
                vec![StreamEvent::ExecutionFailed {
                    node: NODE,
                    message: format!("쿼리 실행 실패: {reason}"),
                    data: json!({"error": reason}),
                }]
            }
        }
    }

    /// Summarize the first rows into prose (요약 / 인사이트 / 추천)
    pub(super) async fn generate_insight(&self, state: &mut AgentState) -> Vec<StreamEvent> {
        const NODE: &str = "generate_insight";

        let preview: Vec<_> = state.query_results.iter().take(10).collect();
        let preview_text = serde_json::to_string_pretty(&preview).unwrap_or_default();

        let prompt = super::prompts::insight_generation(
            &state.question,
            &state.generated_sql,
            &preview_text,
            state.query_results.len(),
            state.execution_time_ms,
        );

        match self.llm.complete(&prompt).await {
            Ok(insight) => {
                let insight = insight.trim().to_string();
                state.insight = Some(insight);
                vec![StreamEvent::NodeComplete {
                    node: NODE,
                    status: "completed",
                    data: json!({"insight_generated": true}),
                }]
            }
            Err(e) => {
                state.fail(e.error_code(), e.to_string());
                vec![StreamEvent::NodeComplete {
                    node: NODE,
                    status: "failed",
                    data: json!({
                        "error": e.to_string(),
                        "error_type": e.error_code(),
                    }),
                }]
            }
        }
    }
}

fn schema_failure(state: &mut AgentState, node: &'static str, e: anyhow::Error) -> StreamEvent {
    let reason = sanitize_message(&e.to_string());
    state.fail(ErrorCode::DatabaseError, format!("스키마 조회 실패: {reason}"));
    StreamEvent::NodeComplete {
        node,
        status: "failed",
        data: json!({"error": reason}),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::scripted_agent;
    use super::super::{next_node, Node};
    use super::*;
    use crate::llm::LlmError;

    #[tokio::test]
    async fn generated_sql_is_extracted_from_fences() {
        let agent = scripted_agent(vec![Ok(
            "```sql\nSELECT id FROM logs WHERE deleted = FALSE;\n```".to_string(),
        )]);
        let mut state = AgentState::new("에러 로그", 100);

        let events = agent.generate_sql(&mut state).await;
        assert_eq!(state.generated_sql, "SELECT id FROM logs WHERE deleted = FALSE;");
        assert_eq!(events[0].data()["sql_generated"], true);
    }

    #[tokio::test]
    async fn llm_failure_during_generation_is_fatal() {
        let agent = scripted_agent(vec![Err(LlmError::Timeout(60))]);
        let mut state = AgentState::new("에러 로그", 100);

        agent.generate_sql(&mut state).await;
        assert!(state.error_message.is_some());
        assert_eq!(state.error_code, Some(ErrorCode::LlmTimeout));
        assert_eq!(next_node(Node::GenerateSql, &state), None);
    }

    #[tokio::test]
    async fn validation_pass_and_fail_paths() {
        let agent = scripted_agent(vec![]);
        let mut state = AgentState::new("에러 로그", 100);

        state.generated_sql =
            "SELECT id FROM logs WHERE deleted = FALSE ORDER BY created_at DESC".to_string();
        let events = agent.validate_sql(&mut state);
        assert!(state.validation_error.is_none());
        assert_eq!(events[0].data()["validation_passed"], true);

        state.generated_sql = "DELETE FROM logs".to_string();
        let events = agent.validate_sql(&mut state);
        assert_eq!(state.retry_count, 1);
        assert!(state.validation_error.is_some());
        assert!(matches!(events[0], StreamEvent::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn three_validation_failures_exhaust_the_loop() {
        let agent = scripted_agent(vec![]);
        let mut state = AgentState::new("delete logs from yesterday", 100);
        state.generated_sql = "DELETE FROM logs WHERE created_at < NOW()".to_string();

        for expected_retry in 1..=3u32 {
            agent.validate_sql(&mut state);
            assert_eq!(state.retry_count, expected_retry);
        }
        assert_eq!(next_node(Node::ValidateSql, &state), None);
    }

    #[tokio::test]
    async fn insight_failure_is_a_workflow_failure() {
        let agent = scripted_agent(vec![Err(LlmError::Other("boom".to_string()))]);
        let mut state = AgentState::new("에러 로그", 100);

        agent.generate_insight(&mut state).await;
        assert_eq!(state.error_code, Some(ErrorCode::LlmError));
        assert!(state.insight.is_none());
    }
}
