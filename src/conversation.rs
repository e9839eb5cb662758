// Conversation sessions: turn history and the current focus
//
// Each session keeps its last 10 turns and a focus map describing what the
// conversation is "about" right now - the service, error type and time range
// of the last executed query. The focus feeds reference resolution on the
// next turn ("그 서비스", "그 에러", "그때").

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;
use tokio::sync::Mutex;

/// Turns retained per session
const MAX_TURNS: usize = 10;

/// Turns shown to the context-resolution prompt
const HISTORY_WINDOW: usize = 3;

/// The implicit subject of the conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Focus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
}

impl Focus {
    pub fn is_empty(&self) -> bool {
        self.service.is_none() && self.error_type.is_none() && self.time_range.is_none()
    }

    /// Compact rendering for prompt injection, e.g.
    /// `service=payment-api, time_range=1 hour`
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(service) = &self.service {
            parts.push(format!("service={service}"));
        }
        if let Some(error_type) = &self.error_type {
            parts.push(format!("error_type={error_type}"));
        }
        if let Some(time_range) = &self.time_range {
            parts.push(format!("time_range={time_range}"));
        }
        if parts.is_empty() {
            "(none)".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Extract the focus entities from an executed statement: the first
/// `service = '…'`, `error_type = '…'` and `INTERVAL '…'` occurrences.
pub fn extract_focus(sql: &str) -> Focus {
    static SERVICE: OnceLock<Regex> = OnceLock::new();
    static ERROR_TYPE: OnceLock<Regex> = OnceLock::new();
    static INTERVAL: OnceLock<Regex> = OnceLock::new();

    let service = SERVICE
        .get_or_init(|| Regex::new(r"(?i)service\s*=\s*'([^']+)'").unwrap())
        .captures(sql)
        .map(|caps| caps[1].to_string());
    let error_type = ERROR_TYPE
        .get_or_init(|| Regex::new(r"(?i)error_type\s*=\s*'([^']+)'").unwrap())
        .captures(sql)
        .map(|caps| caps[1].to_string());
    let time_range = INTERVAL
        .get_or_init(|| Regex::new(r"(?i)INTERVAL\s*'([^']+)'").unwrap())
        .captures(sql)
        .map(|caps| caps[1].trim().to_string());

    Focus {
        service,
        error_type,
        time_range,
    }
}

/// One question-and-result within a session
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub question: String,
    pub resolved_question: String,
    pub sql: String,
    pub result_count: usize,
    pub focus: Focus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ConversationSession {
    turns: VecDeque<ConversationTurn>,
    current_focus: Focus,
}

impl ConversationSession {
    fn add_turn(&mut self, turn: ConversationTurn) {
        self.current_focus = turn.focus.clone();
        self.turns.push_back(turn);
        while self.turns.len() > MAX_TURNS {
            self.turns.pop_front();
        }
    }
}

/// A prior turn as shown to the resolution prompt
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub question: String,
    pub sql: String,
    pub count: usize,
}

/// What context resolution needs from the store
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub focus: Focus,
    pub history: Vec<HistoryEntry>,
}

impl ConversationContext {
    /// Render the history window for the prompt
    pub fn format_history(&self) -> String {
        if self.history.is_empty() {
            return "No previous conversation".to_string();
        }
        self.history
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                format!(
                    "{}. Q: {}\n   SQL: {}\n   Results: {}건",
                    i + 1,
                    entry.question,
                    entry.sql,
                    entry.count
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// In-memory session store; no persistence across restarts
#[derive(Default)]
pub struct ConversationStore {
    sessions: Mutex<HashMap<String, ConversationSession>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn after a successful analysis; the turn's focus becomes
    /// the session's current focus.
    pub async fn add_turn(&self, conversation_id: &str, turn: ConversationTurn) {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(conversation_id.to_string())
            .or_default()
            .add_turn(turn);
    }

    /// Focus plus the last three turns for reference resolution
    pub async fn context(&self, conversation_id: &str) -> ConversationContext {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(conversation_id) else {
            return ConversationContext::default();
        };
        ConversationContext {
            focus: session.current_focus.clone(),
            history: session
                .turns
                .iter()
                .rev()
                .take(HISTORY_WINDOW)
                .rev()
                .map(|turn| HistoryEntry {
                    question: turn.question.clone(),
                    sql: turn.sql.clone(),
                    count: turn.result_count,
                })
                .collect(),
        }
    }

    /// Forget a session entirely (used when a streaming channel goes away)
    pub async fn clear_session(&self, conversation_id: &str) {
        self.sessions.lock().await.remove(conversation_id);
    }

    #[cfg(test)]
    async fn turn_count(&self, conversation_id: &str) -> usize {
        self.sessions
            .lock()
            .await
            .get(conversation_id)
            .map(|s| s.turns.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(question: &str, sql: &str) -> ConversationTurn {
        ConversationTurn {
            question: question.to_string(),
            resolved_question: question.to_string(),
            sql: sql.to_string(),
            result_count: 5,
            focus: extract_focus(sql),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn focus_extraction_from_sql() {
        let sql = "SELECT * FROM logs WHERE service = 'payment-api' \
                   AND error_type = 'TimeoutError' \
                   AND created_at > NOW() - INTERVAL '1 hour' AND deleted = FALSE";
        let focus = extract_focus(sql);
        assert_eq!(focus.service.as_deref(), Some("payment-api"));
        assert_eq!(focus.error_type.as_deref(), Some("TimeoutError"));
        assert_eq!(focus.time_range.as_deref(), Some("1 hour"));
    }

    #[test]
    fn focus_extraction_takes_first_interval() {
        let sql = "SELECT * FROM logs WHERE created_at > NOW() - INTERVAL '24 hours' \
                   AND created_at < NOW() - INTERVAL '1 hour' AND deleted = FALSE";
        assert_eq!(extract_focus(sql).time_range.as_deref(), Some("24 hours"));
    }

    #[test]
    fn empty_focus_from_plain_sql() {
        let focus = extract_focus("SELECT COUNT(*) FROM logs WHERE deleted = FALSE");
        assert!(focus.is_empty());
        assert_eq!(focus.describe(), "(none)");
    }

    #[tokio::test]
    async fn sessions_are_bounded_to_ten_turns() {
        let store = ConversationStore::new();
        for i in 0..15 {
            store
                .add_turn("s1", turn(&format!("question {i}"), "SELECT 1"))
                .await;
        }
        assert_eq!(store.turn_count("s1").await, 10);

        let context = store.context("s1").await;
        assert_eq!(context.history.len(), 3);
        assert_eq!(context.history[2].question, "question 14");
        assert_eq!(context.history[0].question, "question 12");
    }

    #[tokio::test]
    async fn add_turn_overwrites_focus() {
        let store = ConversationStore::new();
        store
            .add_turn("s1", turn("q1", "SELECT * FROM logs WHERE service = 'payment-api'"))
            .await;
        store
            .add_turn("s1", turn("q2", "SELECT * FROM logs WHERE service = 'order-api'"))
            .await;

        let context = store.context("s1").await;
        assert_eq!(context.focus.service.as_deref(), Some("order-api"));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = ConversationStore::new();
        store
            .add_turn("a", turn("qa", "SELECT * FROM logs WHERE service = 'payment-api'"))
            .await;

        let other = store.context("b").await;
        assert!(other.focus.is_empty());
        assert!(other.history.is_empty());
    }

    #[tokio::test]
    async fn clear_session_forgets_everything() {
        let store = ConversationStore::new();
        store
            .add_turn("s1", turn("q", "SELECT * FROM logs WHERE service = 'payment-api'"))
            .await;
        store.clear_session("s1").await;
        assert!(store.context("s1").await.focus.is_empty());
    }

    #[test]
    fn history_formatting_for_prompt() {
        let context = ConversationContext {
            focus: Focus::default(),
            history: vec![HistoryEntry {
                question: "payment-api 에러".to_string(),
                sql: "SELECT 1".to_string(),
                count: 12,
            }],
        };
        let rendered = context.format_history();
        assert!(rendered.contains("1. Q: payment-api 에러"));
        assert!(rendered.contains("Results: 12건"));

        let empty = ConversationContext::default();
        assert_eq!(empty.format_history(), "No previous conversation");
    }
}
