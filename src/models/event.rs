use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Ordering rank for "severity ≥ X" filters.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Warning => 1,
            Self::Error => 2,
            Self::Critical => 3,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "info" => Self::Info,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "critical" => Self::Critical,
            other => return Err(ParseEnumError::new("severity", other)),
        })
    }
}

/// A row in the `device_events` hypertable. Immutable after append except
/// for the acknowledgement fields. (time, device_id, event_type) is the
/// dedup key: re-appending the same triple is a no-op.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEvent {
    pub time: DateTime<Utc>,
    pub device_id: Uuid,
    pub event_type: String,
    pub site_id: Uuid,
    pub event_code: Option<String>,
    pub severity: Severity,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
}

impl DeviceEvent {
    pub fn new(
        device_id: Uuid,
        site_id: Uuid,
        event_type: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            time: Utc::now(),
            device_id,
            event_type: event_type.into(),
            site_id,
            event_code: None,
            severity,
            message: None,
            details: None,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        }
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.event_code = Some(code.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Filters for event listings. Unset fields don't constrain the query.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_types: Option<Vec<String>>,
    pub severities: Option<Vec<Severity>>,
    pub acknowledged: Option<bool>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventCount {
    pub event_type: String,
    pub severity: Severity,
    pub count: i64,
}

/// One hourly bucket from the `event_counts_hourly` aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineBucket {
    pub bucket: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub event_count: i64,
    pub unacknowledged_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopErrorDevice {
    pub device_id: Uuid,
    pub error_count: i64,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub total_events: i64,
    pub unacknowledged: i64,
    pub errors_last_24h: i64,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}
