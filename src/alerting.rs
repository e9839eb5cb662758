// Anomaly detection over the log store
//
// Three checks run on every tick, each producing at most one alert:
// error-rate spike (last 5 min vs the 30-35-minute-ago baseline), slow APIs
// (>2 s, grouped by path and service), and services that went silent.
// Alerts land in a bounded in-memory history and are broadcast to stream
// subscribers by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::storage::repository::QueryRepository;

/// Alerts retained in memory
const HISTORY_CAP: usize = 100;

/// Spike threshold: +10% over baseline
const SPIKE_THRESHOLD: f64 = 0.1;

/// Spike severity escalation: +50% over baseline
const SPIKE_CRITICAL: f64 = 0.5;

/// Slow API threshold in milliseconds
const SLOW_API_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ErrorRateSpike,
    SlowApi,
    ServiceDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// An anomaly-detector finding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertType,
    pub severity: Severity,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

pub struct AlertingService {
    query_repo: QueryRepository,
    history: Mutex<VecDeque<Alert>>,
}

impl AlertingService {
    pub fn new(query_repo: QueryRepository) -> Self {
        Self {
            query_repo,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Run all checks, record findings in history, return them.
    ///
    /// A store failure surfaces as an error so the supervisor sees the task
    /// failing instead of silently checking nothing.
    pub async fn check_anomalies(&self) -> anyhow::Result<Vec<Alert>> {
        let mut alerts = Vec::new();

        if let Some(alert) = self.check_error_rate_spike().await? {
            alerts.push(alert);
        }
        if let Some(alert) = self.check_slow_apis().await? {
            alerts.push(alert);
        }
        if let Some(alert) = self.check_service_down().await? {
            alerts.push(alert);
        }

        if !alerts.is_empty() {
            let mut history = self.history.lock().await;
            for alert in &alerts {
                history.push_back(alert.clone());
            }
            while history.len() > HISTORY_CAP {
                history.pop_front();
            }
        }

        Ok(alerts)
    }

    /// Most recent alerts, oldest first, capped at `limit`
    pub async fn history(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Error count in the last 5 minutes vs the 30-35-minute-ago window.
    /// A zero baseline produces no alert (nothing meaningful to compare).
    async fn check_error_rate_spike(&self) -> anyhow::Result<Option<Alert>> {
        let (current_rows, _) = self
            .query_repo
            .execute_sql(
                "SELECT COUNT(*) AS error_count
                 FROM logs
                 WHERE level = 'ERROR'
                   AND created_at > NOW() - INTERVAL '5 minutes'
                   AND deleted = FALSE",
            )
            .await?;
        let (baseline_rows, _) = self
            .query_repo
            .execute_sql(
                "SELECT COUNT(*) AS error_count
                 FROM logs
                 WHERE level = 'ERROR'
                   AND created_at BETWEEN NOW() - INTERVAL '35 minutes'
                                      AND NOW() - INTERVAL '30 minutes'
                   AND deleted = FALSE",
            )
            .await?;

        let current = count_of(&current_rows, "error_count");
        let baseline = count_of(&baseline_rows, "error_count");

        Ok(evaluate_spike(current, baseline))
    }

    /// Paths averaging over 2 s in the last 10 minutes, 3+ occurrences,
    /// top 5 by average duration.
    async fn check_slow_apis(&self) -> anyhow::Result<Option<Alert>> {
        let sql = format!(
            "SELECT path, service, AVG(duration_ms) AS avg_duration, COUNT(*) AS count
             FROM logs
             WHERE duration_ms > {SLOW_API_MS}
               AND path IS NOT NULL
               AND created_at > NOW() - INTERVAL '10 minutes'
               AND deleted = FALSE
             GROUP BY path, service
             HAVING COUNT(*) >= 3
             ORDER BY avg_duration DESC
             LIMIT 5"
        );
        let (rows, _) = self.query_repo.execute_sql(&sql).await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(Alert {
            kind: AlertType::SlowApi,
            severity: Severity::Warning,
            message: format!("{}개 느린 API 감지 (>2초)", rows.len()),
            data: json!({ "slow_apis": rows }),
            timestamp: Utc::now(),
        }))
    }

    /// Services active in the last hour that produced nothing in the last
    /// 5 minutes.
    async fn check_service_down(&self) -> anyhow::Result<Option<Alert>> {
        let (active_rows, _) = self
            .query_repo
            .execute_sql(
                "SELECT DISTINCT service
                 FROM logs
                 WHERE created_at > NOW() - INTERVAL '1 hour'
                   AND service IS NOT NULL
                   AND deleted = FALSE",
            )
            .await?;

        let mut down = Vec::new();
        for row in &active_rows {
            let Some(service) = row.get("service").and_then(Value::as_str) else {
                continue;
            };
            let escaped = service.replace('\'', "''");
            let sql = format!(
                "SELECT COUNT(*) AS count
                 FROM logs
                 WHERE service = '{escaped}'
                   AND created_at > NOW() - INTERVAL '5 minutes'
                   AND deleted = FALSE"
            );
            let (rows, _) = self.query_repo.execute_sql(&sql).await?;
            if count_of(&rows, "count") == 0 {
                down.push(service.to_string());
            }
        }

        if down.is_empty() {
            return Ok(None);
        }

        Ok(Some(Alert {
            kind: AlertType::ServiceDown,
            severity: Severity::Critical,
            message: format!("{}개 서비스 로그 없음 (5분)", down.len()),
            data: json!({ "services": down }),
            timestamp: Utc::now(),
        }))
    }
}

fn count_of(rows: &[serde_json::Map<String, Value>], column: &str) -> i64 {
    rows.first()
        .and_then(|row| row.get(column))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Spike rule as a pure function of the two counts
fn evaluate_spike(current: i64, baseline: i64) -> Option<Alert> {
    if baseline <= 0 {
        return None;
    }
    let ratio = (current - baseline) as f64 / baseline as f64;
    if ratio <= SPIKE_THRESHOLD {
        return None;
    }

    let severity = if ratio > SPIKE_CRITICAL {
        Severity::Critical
    } else {
        Severity::Warning
    };
    let spike_percentage = (ratio * 1000.0).round() / 10.0;

    Some(Alert {
        kind: AlertType::ErrorRateSpike,
        severity,
        message: format!("에러율 {spike_percentage:.1}% 증가 감지 (최근 5분)"),
        data: json!({
            "current_count": current,
            "baseline_count": baseline,
            "spike_percentage": spike_percentage,
        }),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_baseline_never_alerts() {
        assert_eq!(evaluate_spike(100, 0), None);
        assert_eq!(evaluate_spike(0, 0), None);
    }

    #[test]
    fn small_increase_is_ignored() {
        assert!(evaluate_spike(105, 100).is_none(), "+5% is below threshold");
        assert!(evaluate_spike(110, 100).is_none(), "+10% is not strictly above");
    }

    #[test]
    fn moderate_spike_is_warning() {
        let alert = evaluate_spike(120, 100).unwrap();
        assert_eq!(alert.kind, AlertType::ErrorRateSpike);
        assert_eq!(alert.severity, Severity::Warning);
        assert_eq!(alert.data["spike_percentage"], 20.0);
    }

    #[test]
    fn large_spike_is_critical() {
        let alert = evaluate_spike(100, 10).unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.data["spike_percentage"].as_f64().unwrap() >= 50.0);
    }

    #[test]
    fn error_drop_is_not_a_spike() {
        assert!(evaluate_spike(10, 100).is_none());
    }

    #[test]
    fn alert_serializes_with_type_key() {
        let alert = evaluate_spike(200, 100).unwrap();
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["type"], "error_rate_spike");
        assert_eq!(value["severity"], "critical");
    }

    #[tokio::test]
    async fn history_is_bounded_and_ordered() {
        use crate::agent::testing::lazy_pool;
        let service = AlertingService::new(QueryRepository::new(lazy_pool()));

        {
            let mut history = service.history.lock().await;
            for i in 0..150 {
                history.push_back(Alert {
                    kind: AlertType::SlowApi,
                    severity: Severity::Warning,
                    message: format!("alert {i}"),
                    data: json!({}),
                    timestamp: Utc::now(),
                });
            }
            while history.len() > HISTORY_CAP {
                history.pop_front();
            }
        }

        let recent = service.history(20).await;
        assert_eq!(recent.len(), 20);
        assert_eq!(recent.last().unwrap().message, "alert 149");
        assert_eq!(recent.first().unwrap().message, "alert 130");
    }
}
