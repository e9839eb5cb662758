// Prompt templates for every LLM call in the workflow
//
// Builders rather than raw constants so call sites cannot forget a
// placeholder. The wording tracks the behavior the rest of the pipeline
// depends on: fenced SQL output, JSON-only extraction responses, Korean
// user-facing analysis text.

use crate::conversation::ConversationContext;

/// SQL generation: schema + diverse sample + hard rules + few-shot patterns
pub fn sql_generation(
    schema_info: &str,
    sample_data: &str,
    question: &str,
    max_results: usize,
) -> String {
    format!(
        r#"You are an expert PostgreSQL database analyst specializing in log analysis systems.

# Database Schema
{schema_info}

# Sample Data
{sample_data}

# Important Rules
1. **ALWAYS** include: `WHERE deleted = FALSE`
2. **ONLY** generate SELECT queries (no INSERT, UPDATE, DELETE, DROP)
3. Use proper indexes for performance:
   - idx_service_level_time: (service, level, created_at DESC)
   - idx_error_time: (error_type, created_at DESC)
   - idx_user_time: (user_id, created_at DESC)
   - idx_trace: (trace_id)
4. Always add `ORDER BY created_at DESC` for time-series data
5. Limit results to prevent overload (MAX {max_results})
6. Use `NOW() - INTERVAL '...'` for relative time filtering
7. For absolute date ranges use `created_at >= 'start'` and `created_at < 'end + 1 day'` (end-exclusive)
8. For JSONB metadata queries, use `->>` for text or `->` for JSON

# Field Descriptions
- **path**: Backend API endpoint (/api/v1/payment) or Frontend page (/checkout)
- **log_type**: BACKEND, FRONTEND, MOBILE, IOT, WORKER
- **level**: TRACE, DEBUG, INFO, WARN, ERROR, FATAL
- **trace_id**: Distributed tracing ID (connect frontend <-> backend)
- **function_name**, **file_path**: Extracted from stack trace
- **metadata**: JSONB with performance, browser, business context

# Example Queries

Q: "최근 1시간 에러 로그"
A:
```sql
SELECT id, created_at, service, level, message, error_type
FROM logs
WHERE level = 'ERROR'
  AND created_at > NOW() - INTERVAL '1 hour'
  AND deleted = FALSE
ORDER BY created_at DESC
LIMIT 100;
```

Q: "payment-api 서비스에서 가장 많이 발생한 에러 top 5"
A:
```sql
SELECT error_type, COUNT(*) as count,
       COUNT(DISTINCT user_id) as affected_users
FROM logs
WHERE service = 'payment-api'
  AND level = 'ERROR'
  AND deleted = FALSE
GROUP BY error_type
ORDER BY count DESC
LIMIT 5;
```

Q: "느린 API 찾기 (1초 이상)"
A:
```sql
SELECT path, AVG(duration_ms) as avg_ms, COUNT(*) as count
FROM logs
WHERE duration_ms > 1000
  AND log_type = 'BACKEND'
  AND deleted = FALSE
  AND created_at > NOW() - INTERVAL '24 hours'
GROUP BY path
ORDER BY avg_ms DESC
LIMIT 10;
```

Q: "최근 24시간 에러 발생 추이 (1시간 단위)"
A:
```sql
SELECT
  DATE_TRUNC('hour', created_at) as time_bucket,
  COUNT(*) as error_count,
  COUNT(DISTINCT service) as service_count
FROM logs
WHERE level = 'ERROR'
  AND created_at > NOW() - INTERVAL '24 hours'
  AND deleted = FALSE
GROUP BY DATE_TRUNC('hour', created_at)
ORDER BY time_bucket DESC;
```

# Aggregation Rules
- "개수", "서비스별", "시간대별" questions MUST use GROUP BY
- "추이", "분포", "집계" questions MUST use GROUP BY
- "평균", "최대/최소", "합계" questions MUST use aggregation functions
- Use DATE_TRUNC('hour' | 'day' | 'minute', created_at) for time buckets and
  GROUP BY the same expression
- Filter with WHERE before GROUP BY, ORDER BY aggregated results, and LIMIT

# User Question
{question}

# Your Task
Generate **ONLY the SQL query** without any explanation.
The SQL must be valid PostgreSQL syntax and follow all rules above.

SQL:"#
    )
}

/// Insight generation over the first rows of a result set
pub fn insight_generation(
    question: &str,
    sql: &str,
    results_preview: &str,
    count: usize,
    execution_time_ms: f64,
) -> String {
    format!(
        r#"You are a log analysis expert. Analyze the query results and provide actionable insights in Korean.

# Original Question
{question}

# Generated SQL
```sql
{sql}
```

# Query Results
{results_preview}

# Execution Info
- Result count: {count}
- Execution time: {execution_time_ms}ms

# Your Task
Provide a concise analysis in Korean (2-4 sentences):
1. **요약**: What do the results show?
2. **인사이트**: Any patterns, anomalies, or important findings?
3. **추천**: Actionable recommendations (if applicable)

Analysis:"#
    )
}

/// Reference resolution against conversation history and focus
pub fn context_resolution(context: &ConversationContext, question: &str) -> String {
    format!(
        r#"당신은 대화 맥락을 이해하는 질문 분석 전문가입니다.
사용자의 질문을 대화 히스토리와 현재 포커스를 고려하여 분석하고 명확하게 만드세요.

# 대화 히스토리
{history}

# 현재 포커스
{focus}

# 사용자 질문
{question}

# 분석 작업

1. **참조 해석**: 질문에 대명사나 참조가 있으면 구체적으로 변환
   - "그 에러" -> 이전 대화에서 언급된 구체적 error_type
   - "그 서비스" -> 이전 대화에서 언급된 구체적 service
   - "그때" -> 이전 대화에서 언급된 구체적 time_range
   - "더 자세히" -> 이전 쿼리 파라미터 유지
   - "같은 서비스", "이 에러" -> 포커스의 구체적 값

2. **맥락 보강**: 포커스에 service가 있고 질문에 명시 안 되어 있으면 같은 서비스 가정.
   단, 사용자가 명시적으로 다른 대상을 지정하면 그것을 우선.

3. **원본 유지**: 참조나 맥락 보강이 필요 없으면 원본 질문 그대로 반환.

# 출력 형식
명확하게 해석된 질문만 반환하세요. 설명이나 주석 없이 질문만 출력하세요.

해석된 질문:"#,
        history = context.format_history(),
        focus = context.focus.describe(),
    )
}

/// Full filter extraction: service and structured time range
pub fn filter_extraction(question: &str, today: &str) -> String {
    format!(
        r#"다음 자연어 질문에서 로그 필터를 추출하세요.

질문: "{question}"

추출할 필터:
1. **서비스명**: payment-api, order-api, user-api, auth-api, inventory-api, notification-api, web-app 중 하나
   - "결제", "페이먼트" -> payment-api
   - "주문" -> order-api
   - "사용자", "유저" -> user-api
   - "인증", "로그인" -> auth-api
   - "재고" -> inventory-api
   - "알림", "노티" -> notification-api

2. **시간 범위** (구조화된 형식):
   a) 상대 시간:
      - "최근 N시간/일/주/월" -> {{"type": "relative", "relative": {{"value": N, "unit": "h/d/w/m"}}, "absolute": null}}
      - 예: "최근 3시간" -> {{"type": "relative", "relative": {{"value": 3, "unit": "h"}}, "absolute": null}}

   b) 절대 날짜:
      - 예: "2025년 1월 1일부터 1월 31일까지" ->
        {{"type": "absolute", "relative": null, "absolute": {{"start": "2025-01-01", "end": "2025-01-31"}}}}

   c) 자연어 표현 (오늘 날짜: {today}):
      - "작년", "이번 달", "지난주" -> 오늘 날짜 기준의 절대 날짜 범위
      - "오늘" -> {{"type": "relative", "relative": {{"value": 24, "unit": "h"}}, "absolute": null}}
      - "어제" -> {{"type": "relative", "relative": {{"value": 48, "unit": "h"}}, "absolute": null}}
      - "최근", "방금", "조금 전" -> {{"type": "relative", "relative": {{"value": 1, "unit": "h"}}, "absolute": null}}

   d) 명시 없음:
      - {{"type": null, "relative": null, "absolute": null}}

**중요**:
- 질문에 명시적으로 언급된 것만 추출하세요
- 오늘 날짜({today})를 기준으로 상대적 날짜를 계산하세요
- JSON 형식으로만 응답하세요

응답 형식 (JSON만):
{{
  "service": "payment-api" | "order-api" | "user-api" | "auth-api" | "inventory-api" | "notification-api" | "web-app" | null,
  "time_range": {{
    "type": "relative" | "absolute" | null,
    "relative": {{"value": N, "unit": "h/d/w/m"}} | null,
    "absolute": {{"start": "YYYY-MM-DD", "end": "YYYY-MM-DD"}} | null
  }},
  "confidence": 0.0 ~ 1.0
}}"#
    )
}

/// Service-only extraction, used when the caller already supplied a time range
pub fn service_extraction(question: &str) -> String {
    format!(
        r#"다음 자연어 질문에서 서비스명을 추출하세요.

질문: "{question}"

추출할 서비스:
- payment-api, order-api, user-api, auth-api, inventory-api, notification-api, web-app 중 하나
- "결제", "페이먼트" -> payment-api
- "주문" -> order-api
- "사용자", "유저" -> user-api
- "인증", "로그인" -> auth-api
- "재고" -> inventory-api
- "알림", "노티" -> notification-api

**중요**: 질문에 명시적으로 언급된 것만 추출하세요. 없으면 null을 반환하세요.

응답 형식 (JSON만):
{{
  "service": "payment-api" | "order-api" | "user-api" | "auth-api" | "inventory-api" | "notification-api" | "web-app" | null,
  "confidence": 0.0 ~ 1.0
}}"#
    )
}

/// Question analysis for the clarifier
pub fn clarification_analysis(question: &str) -> String {
    format!(
        r#"다음 자연어 질문을 분석하세요.

질문: "{question}"

분석 항목:
1. **서비스 정보**:
   - has_service: 서비스 언급 여부 (true/false)
   - service_type: "specific" (구체적 서비스명) | "aggregation" ("서비스별", "전체 서비스" 등 집계 표현) | "none"
   - mentioned_services: 언급된 서비스명 배열

2. **쿼리 유형**:
   - is_aggregation: 집계 쿼리 여부 (GROUP BY 필요; "서비스별 에러 개수", "시간대별 추이")
   - is_filter_query: 필터 쿼리 여부 (WHERE 필요; "payment-api 에러 로그")

3. **시간 정보**:
   - has_time: 시간 정보 명시 여부
   - time_clarity: "clear" ("최근 1시간", "오늘") | "ambiguous" ("얼마 전", "조금 전") | "none"

4. **재질문 필요성**:
   - needs_service_clarification: 필터 쿼리인데 서비스가 없으면 true. 집계 쿼리면 항상 false.
   - needs_time_clarification: 모호한 시간 표현이면 true.

**판단 기준**:
- "최근 24시간 서비스별 에러 개수" -> service_type="aggregation", needs_service_clarification=false
- "payment-api 에러 로그" -> service_type="specific", needs_service_clarification=false
- "에러 로그 조회" -> service_type="none", is_filter_query=true, needs_service_clarification=true
- "전체 서비스의 에러 로그 조회" -> service_type="aggregation", needs_service_clarification=false
- "조금 전 로그" -> time_clarity="ambiguous", needs_time_clarification=true

**응답 형식** (JSON만):
{{
  "has_service": true/false,
  "service_type": "specific" | "aggregation" | "none",
  "mentioned_services": ["service1"],
  "is_aggregation": true/false,
  "is_filter_query": true/false,
  "has_time": true/false,
  "time_clarity": "clear" | "ambiguous" | "none",
  "needs_service_clarification": true/false,
  "needs_time_clarification": true/false,
  "reasoning": "간단한 설명"
}}"#
    )
}

/// Conversation summarization for `POST /summarize`
pub fn conversation_summary(conversation_text: &str) -> String {
    format!(
        r#"다음 대화 내용을 핵심만 간결하게 요약하세요.

# 대화 내용
{conversation_text}

# 요약 지침
- 주요 질문과 결과를 중심으로 요약
- 1-3문장으로 간결하게
- 서비스명, 에러 유형, 시간 범위 등 핵심 정보 포함
- "사용자가 ~를 조회하여 ~건의 결과를 확인했습니다" 형식

요약:"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationContext;

    #[test]
    fn sql_prompt_carries_question_and_limit() {
        let prompt = sql_generation("Table: logs", "Sample", "최근 1시간 에러", 50);
        assert!(prompt.contains("최근 1시간 에러"));
        assert!(prompt.contains("MAX 50"));
        assert!(prompt.contains("deleted = FALSE"));
    }

    #[test]
    fn filter_prompt_is_anchored_to_today() {
        let prompt = filter_extraction("작년 에러", "2026-08-01");
        assert!(prompt.contains("2026-08-01"));
    }

    #[test]
    fn context_prompt_renders_empty_history() {
        let prompt = context_resolution(&ConversationContext::default(), "그 서비스 에러");
        assert!(prompt.contains("No previous conversation"));
        assert!(prompt.contains("(none)"));
        assert!(prompt.contains("그 서비스 에러"));
    }
}
