// Stage: filter extraction (service + time range)
//
// A caller-supplied structured time range wins for the time dimension; the
// service dimension (and the time dimension when nothing was supplied) comes
// from the LLM under a JSON response contract. Model output that fails the
// TimeRange bounds is discarded - no extraction beats a wrong one.

use super::{extract_json, AgentState, SqlAgent};
use crate::analysis::events::StreamEvent;
use crate::model::{TimeRange, TimeRangeWire};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

const NODE: &str = "extract_filters";

/// The JSON contract the extraction prompts ask for
#[derive(Debug, Default, Deserialize)]
struct FilterResponse {
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    time_range: Option<TimeRangeWire>,
    #[serde(default)]
    confidence: f64,
}

/// Parse and bounds-check a model response.
/// Returns (service, time_range, confidence); an invalid time range is None.
fn parse_filter_response(
    content: &str,
    accept_time: bool,
    today: NaiveDate,
) -> (Option<String>, Option<TimeRange>, f64) {
    let Some(value) = extract_json(content) else {
        return (None, None, 0.0);
    };
    let Ok(parsed) = serde_json::from_value::<FilterResponse>(value) else {
        return (None, None, 0.0);
    };

    let time_range = if accept_time {
        parsed.time_range.and_then(|wire| {
            wire.into_range_at(today).unwrap_or_else(|e| {
                tracing::warn!("discarding extracted time range: {e}");
                None
            })
        })
    } else {
        None
    };

    (parsed.service, time_range, parsed.confidence)
}

impl SqlAgent {
    /// Produce the (service, time range, confidence) triple for this run
    pub(super) async fn extract_filters(&self, state: &mut AgentState) -> Vec<StreamEvent> {
        let today = Utc::now().date_naive();
        let question = state.resolved_question.clone();
        let has_custom_time = state.time_range_structured.is_some();

        let prompt = if has_custom_time {
            super::prompts::service_extraction(&question)
        } else {
            super::prompts::filter_extraction(&question, &today.format("%Y-%m-%d").to_string())
        };

        let (service, llm_time_range, confidence) = match self.llm.complete(&prompt).await {
            Ok(content) => parse_filter_response(&content, !has_custom_time, today),
            Err(e) => {
                tracing::warn!("filter extraction failed: {e}");
                state.extraction_confidence = 0.0;
                return vec![StreamEvent::FiltersExtracted {
                    node: NODE,
                    message: "필터 추출 실패".to_string(),
                    data: json!({
                        "service": null,
                        "time_range": null,
                        "confidence": 0.0,
                        "error": e.to_string(),
                    }),
                }];
            }
        };

        state.extracted_service = service.clone();
        state.extracted_time_range = state.time_range_structured.clone().or(llm_time_range);
        state.extraction_confidence = confidence;

        let time_value = state
            .extracted_time_range
            .as_ref()
            .map(|range| serde_json::to_value(range).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);

        let mut parts = Vec::new();
        if let Some(service) = &service {
            parts.push(format!("서비스: {service}"));
        }
        if let Some(range) = &state.extracted_time_range {
            parts.push(format!("시간: {}", range.describe()));
        }
        let message = if parts.is_empty() {
            "추출된 필터 없음".to_string()
        } else {
            format!("필터 추출: {}", parts.join(", "))
        };

        vec![StreamEvent::FiltersExtracted {
            node: NODE,
            message,
            data: json!({
                "service": service,
                "time_range": time_value,
                "confidence": confidence,
                "source": if has_custom_time { "custom_input" } else { "llm_extraction" },
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::scripted_agent;
    use super::*;
    use crate::model::TimeUnit;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parses_service_and_relative_range() {
        let content = r#"{"service": "payment-api",
            "time_range": {"type": "relative", "relative": {"value": 3, "unit": "h"}, "absolute": null},
            "confidence": 0.9}"#;
        let (service, range, confidence) =
            parse_filter_response(content, true, day("2026-08-01"));
        assert_eq!(service.as_deref(), Some("payment-api"));
        assert_eq!(
            range,
            Some(TimeRange::Relative {
                value: 3,
                unit: TimeUnit::Hours
            })
        );
        assert_eq!(confidence, 0.9);
    }

    #[test]
    fn out_of_bounds_llm_range_is_discarded() {
        let content = r#"{"service": null,
            "time_range": {"type": "relative", "relative": {"value": 9999, "unit": "h"}, "absolute": null},
            "confidence": 0.8}"#;
        let (_, range, confidence) = parse_filter_response(content, true, day("2026-08-01"));
        assert_eq!(range, None, "invalid extraction treated as no extraction");
        assert_eq!(confidence, 0.8);
    }

    #[test]
    fn time_is_ignored_when_custom_range_present() {
        let content = r#"{"service": "order-api",
            "time_range": {"type": "relative", "relative": {"value": 1, "unit": "h"}, "absolute": null},
            "confidence": 0.7}"#;
        let (service, range, _) = parse_filter_response(content, false, day("2026-08-01"));
        assert_eq!(service.as_deref(), Some("order-api"));
        assert_eq!(range, None);
    }

    #[test]
    fn non_json_output_yields_nothing() {
        let (service, range, confidence) =
            parse_filter_response("I could not determine filters.", true, day("2026-08-01"));
        assert_eq!(service, None);
        assert_eq!(range, None);
        assert_eq!(confidence, 0.0);
    }

    #[tokio::test]
    async fn custom_range_wins_over_llm_extraction() {
        let agent = scripted_agent(vec![Ok(r#"{"service": "payment-api", "confidence": 1.0}"#
            .to_string())]);
        let custom = TimeRange::Absolute {
            start: day("2026-07-01"),
            end: day("2026-07-15"),
        };
        let mut state =
            AgentState::new("payment-api 에러", 100).with_time_range(Some(custom.clone()));

        let events = agent.extract_filters(&mut state).await;
        assert_eq!(state.extracted_time_range, Some(custom));
        assert_eq!(state.extracted_service.as_deref(), Some("payment-api"));
        assert_eq!(events[0].data()["source"], "custom_input");
    }

    #[tokio::test]
    async fn llm_failure_reports_zero_confidence() {
        let agent = scripted_agent(vec![Err(crate::llm::LlmError::RateLimited)]);
        let mut state = AgentState::new("에러 로그", 100);

        let events = agent.extract_filters(&mut state).await;
        assert_eq!(state.extraction_confidence, 0.0);
        assert_eq!(events[0].data()["confidence"], 0.0);
    }
}
