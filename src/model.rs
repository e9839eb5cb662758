// Core data model shared by the client, collector and analysis server
//
// Everything here is serde-mapped to the JSON wire format: a log batch is
// `{"logs": [QueuedLog, ...]}` where `created_at` travels as Unix seconds.
// Using enums for level and source keeps the closed sets closed at the type
// level instead of scattering string comparisons.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Severity level of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Level::Trace),
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" => Ok(Level::Warn),
            "ERROR" => Ok(Level::Error),
            "FATAL" => Ok(Level::Fatal),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of the emitting source (`log_type` on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSource {
    #[default]
    Backend,
    Frontend,
    Mobile,
    Iot,
    Worker,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Backend => "BACKEND",
            LogSource::Frontend => "FRONTEND",
            LogSource::Mobile => "MOBILE",
            LogSource::Iot => "IOT",
            LogSource::Worker => "WORKER",
        }
    }
}

impl FromStr for LogSource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BACKEND" => Ok(LogSource::Backend),
            "FRONTEND" => Ok(LogSource::Frontend),
            "MOBILE" => Ok(LogSource::Mobile),
            "IOT" => Ok(LogSource::Iot),
            "WORKER" => Ok(LogSource::Worker),
            _ => Err(()),
        }
    }
}

/// A log record as queued by the client and posted to the collector
///
/// Identical to the stored row minus the identifier; `created_at` is Unix
/// seconds (fractional). Optional fields are omitted from the JSON body when
/// unset so small records stay small on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedLog {
    pub level: Level,
    pub message: String,
    pub created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_type: Option<LogSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl QueuedLog {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            created_at: unix_now(),
            log_type: None,
            service: None,
            environment: None,
            service_version: None,
            trace_id: None,
            user_id: None,
            session_id: None,
            error_type: None,
            stack_trace: None,
            path: None,
            method: None,
            action_type: None,
            function_name: None,
            file_path: None,
            duration_ms: None,
            metadata: None,
        }
    }

    /// Set a field by its wire name, only if it is not already set.
    ///
    /// Known column names map onto the typed fields; anything else lands in
    /// the `metadata` bag. Context merging relies on the insert-if-absent
    /// semantics: explicit fields win over context, context over defaults.
    pub fn set_default_field(&mut self, key: &str, value: &Value) {
        fn fill(slot: &mut Option<String>, value: &Value) {
            if slot.is_none() {
                if let Some(s) = value.as_str() {
                    *slot = Some(s.to_string());
                }
            }
        }

        match key {
            "service" => fill(&mut self.service, value),
            "environment" => fill(&mut self.environment, value),
            "service_version" => fill(&mut self.service_version, value),
            "trace_id" => fill(&mut self.trace_id, value),
            "user_id" => fill(&mut self.user_id, value),
            "session_id" => fill(&mut self.session_id, value),
            "error_type" => fill(&mut self.error_type, value),
            "stack_trace" => fill(&mut self.stack_trace, value),
            "path" => fill(&mut self.path, value),
            "method" => fill(&mut self.method, value),
            "action_type" => fill(&mut self.action_type, value),
            "function_name" => fill(&mut self.function_name, value),
            "file_path" => fill(&mut self.file_path, value),
            "duration_ms" => {
                if self.duration_ms.is_none() {
                    self.duration_ms = value.as_f64();
                }
            }
            "log_type" => {
                if self.log_type.is_none() {
                    self.log_type = value.as_str().and_then(|s| s.parse().ok());
                }
            }
            other => {
                let bag = self.metadata.get_or_insert_with(Map::new);
                if !bag.contains_key(other) {
                    bag.insert(other.to_string(), value.clone());
                }
            }
        }
    }
}

/// A batch as posted to `POST /logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub logs: Vec<QueuedLog>,
}

/// Current wall-clock time as fractional Unix seconds
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ─────────────────────────────────────────────────────────────────────────────
// Time ranges
// ─────────────────────────────────────────────────────────────────────────────

/// Unit of a relative time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    #[serde(rename = "h")]
    Hours,
    #[serde(rename = "d")]
    Days,
    #[serde(rename = "w")]
    Weeks,
    #[serde(rename = "m")]
    Months,
}

impl TimeUnit {
    /// Inclusive bounds on the `value` allowed for this unit
    pub fn bounds(&self) -> (u32, u32) {
        match self {
            TimeUnit::Hours => (1, 720),
            TimeUnit::Days => (1, 365),
            TimeUnit::Weeks => (1, 52),
            TimeUnit::Months => (1, 12),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Hours => "h",
            TimeUnit::Days => "d",
            TimeUnit::Weeks => "w",
            TimeUnit::Months => "m",
        }
    }
}

/// The temporal filter of a query, anchored either to *now* or to calendar dates
///
/// Validity is enforced here, once, so every consumer downstream can trust a
/// constructed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeRange {
    Relative { value: u32, unit: TimeUnit },
    Absolute { start: NaiveDate, end: NaiveDate },
}

/// Why a time range was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeRangeError {
    #[error("value {value} out of range [{min}, {max}] for unit {unit}")]
    ValueOutOfRange { value: u32, min: u32, max: u32, unit: &'static str },
    #[error("start date must be before end date")]
    StartNotBeforeEnd,
    #[error("end date cannot be in the future")]
    EndInFuture,
    #[error("date range cannot exceed 1 year")]
    SpanTooLong,
    #[error("invalid unit: {0}")]
    InvalidUnit(String),
    #[error("missing {0} time data")]
    MissingData(&'static str),
    #[error("invalid date format: {0}")]
    InvalidDate(String),
}

impl TimeRange {
    /// Validate the invariants of §3 against `today`
    ///
    /// `today` is a parameter so boundary behavior stays testable.
    pub fn validate_at(&self, today: NaiveDate) -> Result<(), TimeRangeError> {
        match self {
            TimeRange::Relative { value, unit } => {
                let (min, max) = unit.bounds();
                if *value < min || *value > max {
                    return Err(TimeRangeError::ValueOutOfRange {
                        value: *value,
                        min,
                        max,
                        unit: unit.as_str(),
                    });
                }
                Ok(())
            }
            TimeRange::Absolute { start, end } => {
                if start >= end {
                    return Err(TimeRangeError::StartNotBeforeEnd);
                }
                if *end > today {
                    return Err(TimeRangeError::EndInFuture);
                }
                if (*end - *start).num_days() > 365 {
                    return Err(TimeRangeError::SpanTooLong);
                }
                Ok(())
            }
        }
    }

    pub fn validate(&self) -> Result<(), TimeRangeError> {
        self.validate_at(Utc::now().date_naive())
    }

    /// Short human-readable form, e.g. `3h` or `2025-01-01..2025-01-31`
    pub fn describe(&self) -> String {
        match self {
            TimeRange::Relative { value, unit } => format!("{}{}", value, unit.as_str()),
            TimeRange::Absolute { start, end } => format!("{}..{}", start, end),
        }
    }
}

/// Time range as the frontend and the LLM emit it:
/// `{"type": "relative"|"absolute"|null, "relative": {...}|null, "absolute": {...}|null}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeRangeWire {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub relative: Option<RelativeWire>,
    #[serde(default)]
    pub absolute: Option<AbsoluteWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelativeWire {
    pub value: u32,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsoluteWire {
    pub start: String,
    pub end: String,
}

impl TimeRangeWire {
    /// Convert to the validated tagged union.
    ///
    /// `Ok(None)` means no time range was supplied (`type: null`).
    pub fn into_range(self) -> Result<Option<TimeRange>, TimeRangeError> {
        self.into_range_at(Utc::now().date_naive())
    }

    pub fn into_range_at(self, today: NaiveDate) -> Result<Option<TimeRange>, TimeRangeError> {
        let range = match self.kind.as_deref() {
            None => return Ok(None),
            Some("relative") => {
                let rel = self
                    .relative
                    .ok_or(TimeRangeError::MissingData("relative"))?;
                let unit = match rel.unit.as_str() {
                    "h" => TimeUnit::Hours,
                    "d" => TimeUnit::Days,
                    "w" => TimeUnit::Weeks,
                    "m" => TimeUnit::Months,
                    other => return Err(TimeRangeError::InvalidUnit(other.to_string())),
                };
                TimeRange::Relative {
                    value: rel.value,
                    unit,
                }
            }
            Some("absolute") => {
                let abs = self
                    .absolute
                    .ok_or(TimeRangeError::MissingData("absolute"))?;
                let start = NaiveDate::parse_from_str(&abs.start, "%Y-%m-%d")
                    .map_err(|e| TimeRangeError::InvalidDate(e.to_string()))?;
                let end = NaiveDate::parse_from_str(&abs.end, "%Y-%m-%d")
                    .map_err(|e| TimeRangeError::InvalidDate(e.to_string()))?;
                TimeRange::Absolute { start, end }
            }
            Some(other) => return Err(TimeRangeError::InvalidUnit(other.to_string())),
        };
        range.validate_at(today)?;
        Ok(Some(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn level_round_trips_as_uppercase() {
        let json = serde_json::to_string(&Level::Warn).unwrap();
        assert_eq!(json, "\"WARN\"");
        let back: Level = serde_json::from_str("\"FATAL\"").unwrap();
        assert_eq!(back, Level::Fatal);
        assert_eq!("error".parse::<Level>(), Ok(Level::Error));
    }

    #[test]
    fn queued_log_omits_unset_fields() {
        let log = QueuedLog::new(Level::Info, "hello");
        let value = serde_json::to_value(&log).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3, "only level/message/created_at: {:?}", obj);
        assert_eq!(obj["level"], "INFO");
        assert_eq!(obj["message"], "hello");
    }

    #[test]
    fn set_default_field_does_not_overwrite() {
        let mut log = QueuedLog::new(Level::Info, "x");
        log.service = Some("payment-api".into());
        log.set_default_field("service", &json!("order-api"));
        assert_eq!(log.service.as_deref(), Some("payment-api"));

        log.set_default_field("user_id", &json!("u-1"));
        assert_eq!(log.user_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn unknown_fields_land_in_metadata() {
        let mut log = QueuedLog::new(Level::Info, "x");
        log.set_default_field("tenant_id", &json!("t-9"));
        log.set_default_field("tenant_id", &json!("t-overwrite"));
        let bag = log.metadata.as_ref().unwrap();
        assert_eq!(bag["tenant_id"], "t-9");
    }

    #[test]
    fn relative_bounds_are_unit_specific() {
        let ok = TimeRange::Relative {
            value: 720,
            unit: TimeUnit::Hours,
        };
        assert!(ok.validate().is_ok());

        let too_many = TimeRange::Relative {
            value: 721,
            unit: TimeUnit::Hours,
        };
        assert!(matches!(
            too_many.validate(),
            Err(TimeRangeError::ValueOutOfRange { max: 720, .. })
        ));

        let months = TimeRange::Relative {
            value: 13,
            unit: TimeUnit::Months,
        };
        assert!(months.validate().is_err());
    }

    #[test]
    fn absolute_rules_enforced() {
        let today = day("2026-08-01");

        let backwards = TimeRange::Absolute {
            start: day("2026-02-01"),
            end: day("2026-01-01"),
        };
        assert_eq!(
            backwards.validate_at(today),
            Err(TimeRangeError::StartNotBeforeEnd)
        );

        let future = TimeRange::Absolute {
            start: day("2026-07-01"),
            end: day("2026-09-01"),
        };
        assert_eq!(future.validate_at(today), Err(TimeRangeError::EndInFuture));

        let too_long = TimeRange::Absolute {
            start: day("2025-01-01"),
            end: day("2026-06-01"),
        };
        assert_eq!(too_long.validate_at(today), Err(TimeRangeError::SpanTooLong));

        let fine = TimeRange::Absolute {
            start: day("2026-01-01"),
            end: day("2026-06-01"),
        };
        assert!(fine.validate_at(today).is_ok());
    }

    #[test]
    fn wire_with_null_type_is_no_range() {
        let wire: TimeRangeWire =
            serde_json::from_value(json!({"type": null, "relative": null, "absolute": null}))
                .unwrap();
        assert_eq!(wire.into_range().unwrap(), None);
    }

    #[test]
    fn wire_relative_parses_and_validates() {
        let wire: TimeRangeWire = serde_json::from_value(
            json!({"type": "relative", "relative": {"value": 3, "unit": "h"}, "absolute": null}),
        )
        .unwrap();
        assert_eq!(
            wire.into_range().unwrap(),
            Some(TimeRange::Relative {
                value: 3,
                unit: TimeUnit::Hours
            })
        );

        let bad: TimeRangeWire = serde_json::from_value(
            json!({"type": "relative", "relative": {"value": 0, "unit": "d"}}),
        )
        .unwrap();
        assert!(bad.into_range().is_err());
    }
}
