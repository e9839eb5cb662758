// Events that flow from the workflow to streaming and synchronous clients
//
// One enum covers the whole stream vocabulary; the JSON shape is
// `{"type": "node_complete", ...}` via internal tagging, so WebSocket
// consumers can dispatch on `type` alone. Workflow nodes append these to the
// agent state; the facade forwards them as they appear.

use crate::alerting::Alert;
use crate::errors::{ErrorCode, ErrorEnvelope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal payload of a successful run; also the unit stored in the result
/// cache so a cache hit replays the identical payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteResult {
    pub sql: Option<String>,
    pub results: Vec<Value>,
    pub count: usize,
    pub displayed: usize,
    pub truncated: bool,
    pub execution_time_ms: f64,
    pub insight: Option<String>,
    pub error: Option<String>,
}

/// Canonical event stream (§ the streaming facade)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Emitted before any node event when the cache already holds the answer
    CacheHit { message: String },

    NodeStart {
        node: &'static str,
    },
    NodeEnd {
        node: &'static str,
        data: Value,
    },

    // Domain events appended by nodes
    ContextResolved {
        node: &'static str,
        data: Value,
    },
    FiltersExtracted {
        node: &'static str,
        message: String,
        data: Value,
    },
    ClarificationNeeded {
        node: &'static str,
        message: String,
        data: Value,
    },
    ClarificationSkipped {
        node: &'static str,
        message: String,
        data: Value,
    },
    NodeComplete {
        node: &'static str,
        status: &'static str,
        data: Value,
    },
    ValidationFailed {
        node: &'static str,
        message: String,
        data: Value,
    },
    ExecutionFailed {
        node: &'static str,
        message: String,
        data: Value,
    },

    // Terminals
    Complete(CompleteResult),
    Error {
        error_code: ErrorCode,
        message: String,
        request_id: String,
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        message: String,
    },

    /// Pushed by the anomaly detector, outside any workflow
    Alert {
        alert: Alert,
    },
}

impl StreamEvent {
    pub fn error(envelope: ErrorEnvelope) -> Self {
        StreamEvent::Error {
            error_code: envelope.error_code,
            message: envelope.message,
            request_id: envelope.request_id,
            timestamp: envelope.timestamp,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Complete(_) | StreamEvent::Error { .. } | StreamEvent::Cancelled { .. }
        )
    }

    /// The `data` payload of a node event, used to fill `node_end`
    pub fn data(&self) -> Value {
        match self {
            StreamEvent::ContextResolved { data, .. }
            | StreamEvent::NodeEnd { data, .. }
            | StreamEvent::FiltersExtracted { data, .. }
            | StreamEvent::ClarificationNeeded { data, .. }
            | StreamEvent::ClarificationSkipped { data, .. }
            | StreamEvent::NodeComplete { data, .. }
            | StreamEvent::ValidationFailed { data, .. }
            | StreamEvent::ExecutionFailed { data, .. } => data.clone(),
            _ => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_tag_with_snake_case_type() {
        let event = StreamEvent::NodeStart {
            node: "generate_sql",
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node_start");
        assert_eq!(value["node"], "generate_sql");
    }

    #[test]
    fn complete_flattens_result_fields() {
        let event = StreamEvent::Complete(CompleteResult {
            sql: Some("SELECT 1".to_string()),
            results: vec![json!({"n": 1})],
            count: 1,
            displayed: 1,
            truncated: false,
            execution_time_ms: 12.34,
            insight: Some("요약".to_string()),
            error: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "complete");
        assert_eq!(value["sql"], "SELECT 1");
        assert_eq!(value["count"], 1);
    }

    #[test]
    fn complete_result_round_trips_through_cache_representation() {
        let result = CompleteResult {
            sql: Some("SELECT 1".to_string()),
            results: vec![],
            count: 0,
            displayed: 0,
            truncated: false,
            execution_time_ms: 0.0,
            insight: None,
            error: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        let back: CompleteResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn terminal_detection() {
        assert!(StreamEvent::Cancelled {
            message: "x".to_string()
        }
        .is_terminal());
        assert!(!StreamEvent::NodeStart { node: "clarifier" }.is_terminal());
    }
}
