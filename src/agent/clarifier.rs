// Stage: clarification
//
// One LLM pass classifies the question (service mention, aggregation vs
// filter, time clarity); the rules below turn that analysis into structured
// follow-up questions. Two clarifications per run is the ceiling - after
// that the stage passes through so a stubborn conversation cannot loop.

use super::state::{
    Clarification, ClarificationField, ClarificationKind, QueryAnalysis, ServiceMention,
    TimeClarity,
};
use super::{extract_json, AgentState, SqlAgent};
use crate::analysis::events::StreamEvent;
use serde_json::json;

const NODE: &str = "clarifier";

/// Clarification attempts allowed per run
const MAX_CLARIFICATIONS: u32 = 2;

const TIME_PRESETS: &[&str] = &[
    "최근 1시간",
    "최근 6시간",
    "최근 24시간",
    "최근 48시간",
    "최근 7일",
    "사용자 지정...",
];

/// Apply the clarification rules to an analysis.
///
/// - A filter query without any service asks which service (options come
///   from the store, plus "전체"); aggregation queries never ask.
/// - An ambiguous time always asks (required); an absent time on an
///   aggregation query asks optionally.
fn build_clarifications(analysis: &QueryAnalysis, services: &[String]) -> Vec<Clarification> {
    let mut clarifications = Vec::new();

    let aggregation =
        analysis.is_aggregation || analysis.service_type == ServiceMention::Aggregation;

    if analysis.needs_service_clarification && !aggregation && !services.is_empty() {
        let mut options: Vec<String> = services.to_vec();
        options.push("전체".to_string());
        clarifications.push(Clarification {
            kind: ClarificationKind::MissingInfo,
            field: ClarificationField::Service,
            question: "어떤 서비스의 로그를 분석할까요?".to_string(),
            options,
            required: false,
            allow_custom: false,
        });
    }

    if analysis.needs_time_clarification {
        match analysis.time_clarity {
            TimeClarity::Ambiguous => {
                clarifications.push(Clarification {
                    kind: ClarificationKind::AmbiguousTime,
                    field: ClarificationField::Time,
                    question: "시간 범위를 명확히 해주세요".to_string(),
                    options: TIME_PRESETS.iter().map(|s| s.to_string()).collect(),
                    required: true,
                    allow_custom: true,
                });
            }
            TimeClarity::None if analysis.is_aggregation => {
                let mut options: Vec<String> =
                    TIME_PRESETS.iter().map(|s| s.to_string()).collect();
                options.push("전체".to_string());
                clarifications.push(Clarification {
                    kind: ClarificationKind::MissingInfo,
                    field: ClarificationField::Time,
                    question: "분석할 기간을 선택하세요".to_string(),
                    options,
                    required: false,
                    allow_custom: true,
                });
            }
            _ => {}
        }
    }

    clarifications
}

impl SqlAgent {
    pub(super) async fn clarify(&self, state: &mut AgentState) -> Vec<StreamEvent> {
        if state.clarification_count >= MAX_CLARIFICATIONS {
            return vec![StreamEvent::ClarificationSkipped {
                node: NODE,
                message: "재질문 최대 횟수 초과 - 현재 정보로 진행합니다".to_string(),
                data: json!({"reason": "max_attempts_reached"}),
            }];
        }

        let prompt = super::prompts::clarification_analysis(&state.resolved_question);
        let analysis = match self.llm.complete(&prompt).await {
            Ok(content) => match extract_json(&content)
                .and_then(|value| serde_json::from_value::<QueryAnalysis>(value).ok())
            {
                Some(analysis) => analysis,
                None => {
                    // Unparseable analysis: pass through rather than block
                    return Vec::new();
                }
            },
            Err(e) => {
                tracing::warn!("clarification analysis failed, passing through: {e}");
                return Vec::new();
            }
        };

        tracing::debug!(
            service_type = ?analysis.service_type,
            is_aggregation = analysis.is_aggregation,
            time_clarity = ?analysis.time_clarity,
            "clarifier analysis: {}",
            analysis.reasoning
        );

        let services = if analysis.needs_service_clarification {
            self.query_repo.distinct_services().await.unwrap_or_else(|e| {
                tracing::warn!("could not list services for clarification: {e}");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let clarifications = build_clarifications(&analysis, &services);
        let analysis_value = serde_json::to_value(&analysis).unwrap_or(json!({}));
        state.query_analysis = Some(analysis);

        if clarifications.is_empty() {
            return vec![StreamEvent::ClarificationSkipped {
                node: NODE,
                message: "재질문 건너뜀".to_string(),
                data: json!({
                    "reason": "no_clarification_needed",
                    "analysis": analysis_value,
                }),
            }];
        }

        state.clarification_count += 1;
        state.clarifications_needed = clarifications.clone();

        vec![StreamEvent::ClarificationNeeded {
            node: NODE,
            message: format!("추가 정보가 필요합니다 ({}개)", clarifications.len()),
            data: json!({
                "questions": clarifications,
                "count": clarifications.len(),
                "analysis": analysis_value,
            }),
        }]
    }
}
