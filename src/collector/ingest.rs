// Batch decoding, record coercion and bulk insert
//
// The wire format is lenient by design: the only hard requirements are a
// JSON body with a `logs` array of objects. Everything else is defaulted
// during coercion so a partially-filled record still becomes a valid row.
// Inserts go through binary COPY, one round-trip per batch.

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use flate2::read::GzDecoder;
use futures::pin_mut;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};

use crate::model::{Level, LogSource};

/// A record as it appears in the request body; every field optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecord {
    pub level: Option<String>,
    pub message: Option<String>,
    pub created_at: Option<f64>,
    pub log_type: Option<String>,
    pub service: Option<String>,
    pub environment: Option<String>,
    pub service_version: Option<String>,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub error_type: Option<String>,
    pub stack_trace: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
    pub action_type: Option<String>,
    pub function_name: Option<String>,
    pub file_path: Option<String>,
    pub duration_ms: Option<f64>,
    pub metadata: Option<Value>,
}

/// A fully coerced row, ready for COPY
#[derive(Debug, Clone)]
pub struct LogRow {
    pub created_at: DateTime<Utc>,
    pub level: String,
    pub log_type: String,
    pub service: String,
    pub environment: String,
    pub service_version: String,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub error_type: Option<String>,
    pub message: String,
    pub stack_trace: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
    pub action_type: Option<String>,
    pub function_name: Option<String>,
    pub file_path: Option<String>,
    pub duration_ms: Option<f64>,
    pub deleted: bool,
    pub metadata: Option<Value>,
}

/// Decode a request body into raw records.
///
/// Returns `Err(reason)` for every malformed-input case that maps to 400:
/// broken gzip, invalid JSON, missing `logs`, non-array `logs`, or a
/// non-object array element.
pub fn parse_batch(body: &[u8], gzipped: bool) -> Result<Vec<RawRecord>, String> {
    let decoded;
    let payload: &[u8] = if gzipped {
        let mut decoder = GzDecoder::new(body);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .map_err(|e| format!("Failed to decompress gzip: {e}"))?;
        decoded = buf;
        &decoded
    } else {
        body
    };

    let value: Value =
        serde_json::from_slice(payload).map_err(|e| format!("Invalid JSON: {e}"))?;
    let Some(logs) = value.get("logs") else {
        return Err("Missing 'logs' field".to_string());
    };
    let Some(items) = logs.as_array() else {
        return Err("'logs' must be an array".to_string());
    };

    items
        .iter()
        .map(|item| {
            serde_json::from_value::<RawRecord>(item.clone())
                .map_err(|e| format!("Invalid log record: {e}"))
        })
        .collect()
}

/// Apply the defaulting rules: timestamps fall back to now, enums to their
/// defaults, identity fields to placeholder values. `deleted` is always false
/// on ingest.
pub fn coerce(raw: RawRecord, now: DateTime<Utc>) -> LogRow {
    let created_at = raw
        .created_at
        .and_then(|secs| {
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9) as u32;
            DateTime::from_timestamp(whole, nanos)
        })
        .unwrap_or(now);

    let level = raw
        .level
        .as_deref()
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::Info);
    let log_type = raw
        .log_type
        .as_deref()
        .and_then(|s| s.parse::<LogSource>().ok())
        .unwrap_or(LogSource::Backend);

    LogRow {
        created_at,
        level: level.as_str().to_string(),
        log_type: log_type.as_str().to_string(),
        service: raw.service.unwrap_or_else(|| "unknown".to_string()),
        environment: raw.environment.unwrap_or_else(|| "development".to_string()),
        service_version: raw
            .service_version
            .unwrap_or_else(|| "v0.0.0-dev".to_string()),
        trace_id: raw.trace_id,
        user_id: raw.user_id,
        session_id: raw.session_id,
        error_type: raw.error_type,
        message: raw.message.unwrap_or_default(),
        stack_trace: raw.stack_trace,
        path: raw.path,
        method: raw.method,
        action_type: raw.action_type,
        function_name: raw.function_name,
        file_path: raw.file_path,
        duration_ms: raw.duration_ms,
        deleted: false,
        metadata: raw.metadata,
    }
}

const COPY_STATEMENT: &str = "COPY logs (\
     created_at, level, log_type, service, environment, service_version, \
     trace_id, user_id, session_id, error_type, message, stack_trace, \
     path, method, action_type, function_name, file_path, duration_ms, \
     deleted, metadata) FROM STDIN BINARY";

const COPY_TYPES: &[Type] = &[
    Type::TIMESTAMPTZ,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::FLOAT8,
    Type::BOOL,
    Type::JSONB,
];

/// Bulk-insert coerced rows in one COPY round-trip.
/// Returns the number of rows written.
pub async fn insert_batch(pool: &Pool, rows: &[LogRow]) -> anyhow::Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let client = pool.get().await?;
    let sink = client.copy_in(COPY_STATEMENT).await?;
    let writer = BinaryCopyInWriter::new(sink, COPY_TYPES);
    pin_mut!(writer);

    for row in rows {
        let values: [&(dyn ToSql + Sync); 20] = [
            &row.created_at,
            &row.level,
            &row.log_type,
            &row.service,
            &row.environment,
            &row.service_version,
            &row.trace_id,
            &row.user_id,
            &row.session_id,
            &row.error_type,
            &row.message,
            &row.stack_trace,
            &row.path,
            &row.method,
            &row.action_type,
            &row.function_name,
            &row.file_path,
            &row.duration_ms,
            &row.deleted,
            &row.metadata,
        ];
        writer.as_mut().write(&values).await?;
    }

    let written = writer.finish().await?;
    Ok(written)
}
