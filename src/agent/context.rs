// Stage: reference resolution against the conversation context

use super::{AgentState, SqlAgent};
use crate::analysis::events::StreamEvent;
use serde_json::json;

const NODE: &str = "resolve_context";

impl SqlAgent {
    /// Rewrite references ("그 서비스", "그 에러", "그때", ...) into their
    /// concrete referents from focus and history. Always runs; an unchanged
    /// question passes through untouched. An LLM failure here is soft - the
    /// original question continues down the pipeline.
    pub(super) async fn resolve_context(&self, state: &mut AgentState) -> Vec<StreamEvent> {
        let context = self.conversations.context(&state.conversation_id).await;
        state.current_focus = context.focus.clone();

        let prompt = super::prompts::context_resolution(&context, &state.question);
        match self.llm.complete(&prompt).await {
            Ok(response) => {
                let resolved = response.trim().to_string();
                let modified = !resolved.is_empty() && resolved != state.question;
                if modified {
                    state.resolved_question = resolved.clone();
                }
                vec![StreamEvent::ContextResolved {
                    node: NODE,
                    data: json!({
                        "resolution_needed": modified,
                        "original_question": state.question,
                        "resolved_question": if modified { json!(resolved) } else { json!(null) },
                        "focus": state.current_focus,
                    }),
                }]
            }
            Err(e) => {
                tracing::warn!("context resolution failed, keeping original question: {e}");
                vec![StreamEvent::ContextResolved {
                    node: NODE,
                    data: json!({
                        "resolution_needed": false,
                        "original_question": state.question,
                        "resolved_question": null,
                        "focus": state.current_focus,
                        "error": e.to_string(),
                    }),
                }]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::scripted_agent;
    use super::*;
    use crate::conversation::ConversationTurn;
    use crate::llm::LlmError;
    use chrono::Utc;

    #[tokio::test]
    async fn unchanged_question_is_not_marked_resolved() {
        let agent = scripted_agent(vec![Ok("최근 에러".to_string())]);
        let mut state = AgentState::new("최근 에러", 100);

        let events = agent.resolve_context(&mut state).await;
        assert_eq!(state.resolved_question, "최근 에러");
        let data = events[0].data();
        assert_eq!(data["resolution_needed"], false);
        assert_eq!(data["resolved_question"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn references_are_rewritten_from_focus() {
        let agent = scripted_agent(vec![Ok("payment-api의 느린 API".to_string())]);
        agent
            .conversations
            .add_turn(
                "c1",
                ConversationTurn {
                    question: "payment-api 에러".to_string(),
                    resolved_question: "payment-api 에러".to_string(),
                    sql: "SELECT * FROM logs WHERE service = 'payment-api' AND deleted = FALSE"
                        .to_string(),
                    result_count: 12,
                    focus: crate::conversation::extract_focus(
                        "SELECT * FROM logs WHERE service = 'payment-api'",
                    ),
                    timestamp: Utc::now(),
                },
            )
            .await;

        let mut state = AgentState::new("그 서비스의 느린 API", 100).with_conversation("c1");
        let events = agent.resolve_context(&mut state).await;

        assert_eq!(state.resolved_question, "payment-api의 느린 API");
        assert_eq!(state.current_focus.service.as_deref(), Some("payment-api"));
        assert_eq!(events[0].data()["resolution_needed"], true);
    }

    #[tokio::test]
    async fn llm_failure_is_soft() {
        let agent = scripted_agent(vec![Err(LlmError::RateLimited)]);
        let mut state = AgentState::new("그 에러 더 자세히", 100);

        let events = agent.resolve_context(&mut state).await;
        assert_eq!(state.resolved_question, "그 에러 더 자세히");
        assert_eq!(events[0].data()["resolution_needed"], false);
        assert!(events[0].data()["error"].is_string());
    }
}
