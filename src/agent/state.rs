// Workflow state
//
// One mutable state value travels node to node; every node reads a subset,
// writes a subset, and appends to `events`. The `events` list is append-only
// by convention - nothing ever removes or rewrites an entry.

use crate::analysis::events::StreamEvent;
use crate::conversation::Focus;
use crate::errors::ErrorCode;
use crate::model::TimeRange;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shaped query results for the terminal payload
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormattedResults {
    pub count: usize,
    pub displayed: usize,
    pub data: Vec<Value>,
    pub truncated: bool,
}

/// A structured follow-up question returned to the caller when the engine
/// cannot safely choose defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    #[serde(rename = "type")]
    pub kind: ClarificationKind,
    pub field: ClarificationField,
    pub question: String,
    pub options: Vec<String>,
    pub required: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_custom: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationKind {
    MissingInfo,
    AmbiguousTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationField {
    Service,
    Time,
}

/// The clarifier's structured reading of a question
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryAnalysis {
    pub has_service: bool,
    pub service_type: ServiceMention,
    pub mentioned_services: Vec<String>,
    pub is_aggregation: bool,
    pub is_filter_query: bool,
    pub has_time: bool,
    pub time_clarity: TimeClarity,
    pub needs_service_clarification: bool,
    pub needs_time_clarification: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMention {
    Specific,
    Aggregation,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeClarity {
    Clear,
    Ambiguous,
    #[default]
    None,
}

/// Everything the workflow reads and writes across its stages
#[derive(Debug, Clone)]
pub struct AgentState {
    // Inputs
    pub question: String,
    pub max_results: usize,
    pub conversation_id: String,
    /// Client-supplied structured time range (wins over LLM extraction)
    pub time_range_structured: Option<TimeRange>,

    // Context resolution
    pub resolved_question: String,
    pub current_focus: Focus,

    // Schema retrieval
    pub schema_info: String,
    pub sample_data: String,

    // SQL generation and validation
    pub generated_sql: String,
    pub validation_error: Option<String>,
    pub retry_count: u32,

    // Execution
    pub query_results: Vec<Map<String, Value>>,
    pub execution_time_ms: f64,
    pub formatted: FormattedResults,

    // Insight
    pub insight: Option<String>,

    // Fatal error, if any node failed
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,

    // Filter extraction
    pub extracted_service: Option<String>,
    pub extracted_time_range: Option<TimeRange>,
    pub extraction_confidence: f64,

    // Clarification
    pub clarifications_needed: Vec<Clarification>,
    pub clarification_count: u32,
    pub query_analysis: Option<QueryAnalysis>,

    // Cache metadata
    pub cache_key: String,
    pub cache_hit: bool,

    // Event accumulation (append-only)
    pub events: Vec<StreamEvent>,
}

impl AgentState {
    pub fn new(question: impl Into<String>, max_results: usize) -> Self {
        let question = question.into();
        Self {
            resolved_question: question.clone(),
            question,
            max_results,
            conversation_id: "default".to_string(),
            time_range_structured: None,
            current_focus: Focus::default(),
            schema_info: String::new(),
            sample_data: String::new(),
            generated_sql: String::new(),
            validation_error: None,
            retry_count: 0,
            query_results: Vec::new(),
            execution_time_ms: 0.0,
            formatted: FormattedResults::default(),
            insight: None,
            error_message: None,
            error_code: None,
            extracted_service: None,
            extracted_time_range: None,
            extraction_confidence: 0.0,
            clarifications_needed: Vec::new(),
            clarification_count: 0,
            query_analysis: None,
            cache_key: String::new(),
            cache_hit: false,
            events: Vec::new(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_time_range(mut self, range: Option<TimeRange>) -> Self {
        self.time_range_structured = range;
        self
    }

    /// Record a fatal failure; the router ends the run on the next edge
    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.error_code = Some(code);
        self.error_message = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_defaults() {
        let state = AgentState::new("최근 에러", 100);
        assert_eq!(state.resolved_question, state.question);
        assert_eq!(state.conversation_id, "default");
        assert_eq!(state.retry_count, 0);
        assert!(state.events.is_empty());
    }

    #[test]
    fn clarification_serializes_with_wire_names() {
        let clarification = Clarification {
            kind: ClarificationKind::AmbiguousTime,
            field: ClarificationField::Time,
            question: "시간 범위를 명확히 해주세요".to_string(),
            options: vec!["최근 1시간".to_string()],
            required: true,
            allow_custom: true,
        };
        let value = serde_json::to_value(&clarification).unwrap();
        assert_eq!(value["type"], "ambiguous_time");
        assert_eq!(value["field"], "time");
        assert_eq!(value["allow_custom"], true);

        let no_custom = Clarification {
            allow_custom: false,
            ..clarification
        };
        let value = serde_json::to_value(&no_custom).unwrap();
        assert!(value.get("allow_custom").is_none());
    }

    #[test]
    fn query_analysis_tolerates_partial_json() {
        let analysis: QueryAnalysis = serde_json::from_str(
            r#"{"service_type": "aggregation", "is_aggregation": true}"#,
        )
        .unwrap();
        assert_eq!(analysis.service_type, ServiceMention::Aggregation);
        assert!(analysis.is_aggregation);
        assert_eq!(analysis.time_clarity, TimeClarity::None);
        assert!(!analysis.needs_service_clarification);
    }
}
