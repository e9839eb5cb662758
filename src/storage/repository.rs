// Typed access to the log store
//
// Three repositories, one concern each:
// - SchemaRepository feeds the SQL-generation prompt (schema text + a diverse
//   sample chosen so the model sees error, latency and multi-service rows,
//   not whatever happens to be newest);
// - QueryRepository executes generated read-only SQL and normalizes row
//   values to JSON;
// - LogRepository serves the canned aggregates behind /services and /stats.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::Pool;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Instant;
use tokio_postgres::types::Type;
use tokio_postgres::Row;

// ─────────────────────────────────────────────────────────────────────────────
// Schema repository
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SchemaRepository {
    pool: Pool,
}

impl SchemaRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Render the logs table schema from the information schema as compact
    /// text for prompt injection.
    pub async fn table_schema(&self) -> anyhow::Result<String> {
        let client = self.pool.get().await.context("pool acquire")?;
        let rows = client
            .query(
                "SELECT column_name, data_type, is_nullable, column_default
                 FROM information_schema.columns
                 WHERE table_name = $1
                 ORDER BY ordinal_position",
                &[&"logs"],
            )
            .await
            .context("schema introspection")?;

        let mut out = String::from("Table: logs\nColumns:\n");
        for row in &rows {
            let name: &str = row.get(0);
            let data_type: &str = row.get(1);
            let nullable: &str = row.get(2);
            let default: Option<&str> = row.get(3);
            let nullable = if nullable == "YES" { "NULL" } else { "NOT NULL" };
            out.push_str(&format!("  - {name}: {data_type} {nullable}"));
            if let Some(default) = default {
                out.push_str(&format!(" DEFAULT {default}"));
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// A 10-row diverse sample: 3 recent errors, 3 slow calls (>1 s),
    /// 4 distinct services.
    ///
    /// Diversity is deliberate: the model has to learn aggregation,
    /// performance and filtering patterns, which random recent rows rarely
    /// exhibit together.
    pub async fn sample_data(&self) -> anyhow::Result<String> {
        let client = self.pool.get().await.context("pool acquire")?;
        let rows = client
            .query(
                r#"
                (
                    SELECT id, created_at, level, log_type, service, error_type,
                           message, duration_ms, path
                    FROM logs
                    WHERE deleted = FALSE AND level = 'ERROR'
                    ORDER BY created_at DESC
                    LIMIT 3
                )
                UNION ALL
                (
                    SELECT id, created_at, level, log_type, service, error_type,
                           message, duration_ms, path
                    FROM logs
                    WHERE deleted = FALSE AND duration_ms > 1000
                    ORDER BY created_at DESC
                    LIMIT 3
                )
                UNION ALL
                (
                    SELECT DISTINCT ON (service)
                           id, created_at, level, log_type, service, error_type,
                           message, duration_ms, path
                    FROM logs
                    WHERE deleted = FALSE
                    ORDER BY service, created_at DESC
                    LIMIT 4
                )
                "#,
                &[],
            )
            .await
            .context("sample query")?;

        let mut out = String::from("Sample Data (Diverse 10 logs):\n");
        for row in &rows {
            let level: &str = row.get("level");
            let service: Option<&str> = row.get("service");
            let error_type: Option<&str> = row.get("error_type");
            let message: &str = row.get("message");
            let duration_ms: Option<f64> = row.get("duration_ms");
            let path: Option<&str> = row.get("path");

            out.push_str(&format!("  - [{level}] {}", service.unwrap_or("unknown")));
            if let Some(ms) = duration_ms {
                out.push_str(&format!(", {ms:.0}ms"));
            }
            if let Some(err) = error_type {
                out.push_str(&format!(", {err}"));
            }
            if let Some(p) = path {
                out.push_str(&format!(" {p}"));
            }
            out.push_str(&format!(": {}\n", preview(message, 40)));
        }
        Ok(out)
    }
}

fn preview(message: &str, max_chars: usize) -> String {
    if message.chars().count() > max_chars {
        let cut: String = message.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        message.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query repository
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct QueryRepository {
    pool: Pool,
}

impl QueryRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Execute a read-only statement and return JSON rows with the elapsed
    /// time in milliseconds (2-decimal precision).
    ///
    /// Timestamps become ISO-8601 strings, NUMERIC becomes f64.
    pub async fn execute_sql(&self, sql: &str) -> anyhow::Result<(Vec<Map<String, Value>>, f64)> {
        let start = Instant::now();
        let client = self.pool.get().await.context("pool acquire")?;
        let rows = client.query(sql, &[]).await.context("query execution")?;

        let results = rows.iter().map(row_to_json).collect();
        let elapsed_ms = (start.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;
        Ok((results, elapsed_ms))
    }

    /// Distinct non-null service names, alphabetical
    pub async fn distinct_services(&self) -> anyhow::Result<Vec<String>> {
        let client = self.pool.get().await.context("pool acquire")?;
        let rows = client
            .query(
                "SELECT DISTINCT service FROM logs
                 WHERE service IS NOT NULL AND deleted = FALSE
                 ORDER BY service",
                &[],
            )
            .await
            .context("service listing")?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }
}

/// Convert a row to a JSON object keyed by column name.
///
/// Unknown column types degrade to null rather than failing the whole result.
pub fn row_to_json(row: &Row) -> Map<String, Value> {
    let mut object = Map::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row
                .get::<_, Option<bool>>(i)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Type::INT2 => row
                .get::<_, Option<i16>>(i)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Type::INT4 => row
                .get::<_, Option<i32>>(i)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Type::INT8 => row
                .get::<_, Option<i64>>(i)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Type::FLOAT4 => row
                .get::<_, Option<f32>>(i)
                .map(|v| Value::from(v as f64))
                .unwrap_or(Value::Null),
            Type::FLOAT8 => row
                .get::<_, Option<f64>>(i)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Type::NUMERIC => row
                .get::<_, Option<Decimal>>(i)
                .and_then(|d| d.to_f64())
                .map(Value::from)
                .unwrap_or(Value::Null),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
                .get::<_, Option<String>>(i)
                .map(Value::from)
                .unwrap_or(Value::Null),
            Type::TIMESTAMPTZ => row
                .get::<_, Option<DateTime<Utc>>>(i)
                .map(|ts| Value::from(ts.to_rfc3339()))
                .unwrap_or(Value::Null),
            Type::TIMESTAMP => row
                .get::<_, Option<NaiveDateTime>>(i)
                .map(|ts| Value::from(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null),
            Type::DATE => row
                .get::<_, Option<NaiveDate>>(i)
                .map(|d| Value::from(d.to_string()))
                .unwrap_or(Value::Null),
            Type::JSON | Type::JSONB => row
                .get::<_, Option<Value>>(i)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
        object.insert(column.name().to_string(), value);
    }
    object
}

// ─────────────────────────────────────────────────────────────────────────────
// Log repository
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ServiceCount {
    pub name: String,
    pub log_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelCount {
    pub level: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceDistribution {
    pub service: String,
    pub count: i64,
}

/// The statistics block behind `GET /stats`
#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    pub total_logs: i64,
    pub level_distribution: Vec<LevelCount>,
    pub service_distribution: Vec<ServiceDistribution>,
    pub recent_errors_1h: i64,
}

#[derive(Clone)]
pub struct LogRepository {
    pool: Pool,
}

impl LogRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Services with their active record counts
    pub async fn services(&self) -> anyhow::Result<Vec<ServiceCount>> {
        let client = self.pool.get().await.context("pool acquire")?;
        let rows = client
            .query(
                "SELECT service AS name, COUNT(*) AS log_count
                 FROM logs
                 WHERE deleted = FALSE AND service IS NOT NULL
                 GROUP BY service
                 ORDER BY service",
                &[],
            )
            .await
            .context("service counts")?;
        Ok(rows
            .iter()
            .map(|row| ServiceCount {
                name: row.get(0),
                log_count: row.get(1),
            })
            .collect())
    }

    /// Totals, per-level counts, top-10 services and last-hour error count
    pub async fn stats(&self) -> anyhow::Result<LogStats> {
        let client = self.pool.get().await.context("pool acquire")?;

        let total_logs: i64 = client
            .query_one("SELECT COUNT(*) FROM logs WHERE deleted = FALSE", &[])
            .await
            .context("total count")?
            .get(0);

        let level_rows = client
            .query(
                "SELECT level, COUNT(*) AS count
                 FROM logs
                 WHERE deleted = FALSE
                 GROUP BY level
                 ORDER BY count DESC",
                &[],
            )
            .await
            .context("level distribution")?;

        let service_rows = client
            .query(
                "SELECT service, COUNT(*) AS count
                 FROM logs
                 WHERE deleted = FALSE AND service IS NOT NULL
                 GROUP BY service
                 ORDER BY count DESC
                 LIMIT 10",
                &[],
            )
            .await
            .context("service distribution")?;

        let recent_errors_1h: i64 = client
            .query_one(
                "SELECT COUNT(*) FROM logs
                 WHERE level = 'ERROR'
                   AND created_at > NOW() - INTERVAL '1 hour'
                   AND deleted = FALSE",
                &[],
            )
            .await
            .context("recent errors")?
            .get(0);

        Ok(LogStats {
            total_logs,
            level_distribution: level_rows
                .iter()
                .map(|row| LevelCount {
                    level: row.get(0),
                    count: row.get(1),
                })
                .collect(),
            service_distribution: service_rows
                .iter()
                .map(|row| ServiceDistribution {
                    service: row.get(0),
                    count: row.get(1),
                })
                .collect(),
            recent_errors_1h,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("short", 40), "short");
        let long = "x".repeat(50);
        let cut = preview(&long, 40);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 43);

        // Multi-byte text must not split a code point
        let korean = "결제 서비스에서 오류가 발생했습니다 ".repeat(4);
        let cut = preview(&korean, 40);
        assert!(cut.ends_with("..."));
    }
}
