use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParseEnumError;

/// Per-point data quality. Only `good` and `uncertain` samples participate
/// in rollup averages; `bad` and `missing` are stored for the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Good,
    Uncertain,
    Bad,
    Missing,
}

impl DataQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Uncertain => "uncertain",
            Self::Bad => "bad",
            Self::Missing => "missing",
        }
    }
}

impl std::fmt::Display for DataQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataQuality {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "good" => Self::Good,
            "uncertain" => Self::Uncertain,
            "bad" => Self::Bad,
            "missing" => Self::Missing,
            other => return Err(ParseEnumError::new("data_quality", other)),
        })
    }
}

/// One time-stamped metric sample. Exactly one of `value` / `value_str`
/// is populated on a well-formed point; the pair (time, device_id,
/// metric_name) is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub time: DateTime<Utc>,
    pub device_id: Uuid,
    pub site_id: Uuid,
    pub metric_name: String,
    pub value: Option<f64>,
    pub value_str: Option<String>,
    pub quality: DataQuality,
    pub unit: Option<String>,
    pub source: Option<String>,
    pub tags: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl TelemetryPoint {
    pub fn numeric(
        time: DateTime<Utc>,
        device_id: Uuid,
        site_id: Uuid,
        metric_name: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            time,
            device_id,
            site_id,
            metric_name: metric_name.into(),
            value: Some(value),
            value_str: None,
            quality: DataQuality::Good,
            unit: None,
            source: None,
            tags: None,
            received_at: None,
        }
    }

    pub fn text(
        time: DateTime<Utc>,
        device_id: Uuid,
        site_id: Uuid,
        metric_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            time,
            device_id,
            site_id,
            metric_name: metric_name.into(),
            value: None,
            value_str: Some(value.into()),
            quality: DataQuality::Good,
            unit: None,
            source: None,
            tags: None,
            received_at: None,
        }
    }

    pub fn with_quality(mut self, quality: DataQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A set of points ingested together and tracked as one row in
/// `ingestion_batches`.
#[derive(Debug, Clone)]
pub struct TelemetryBatch {
    pub batch_id: Uuid,
    pub source_type: String,
    pub source_identifier: Option<String>,
    pub points: Vec<TelemetryPoint>,
}

impl TelemetryBatch {
    pub fn new(source_type: impl Into<String>, points: Vec<TelemetryPoint>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            source_type: source_type.into(),
            source_identifier: None,
            points,
        }
    }

    pub fn with_source_identifier(mut self, id: impl Into<String>) -> Self {
        self.source_identifier = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Succeeded,
    Failed,
    Partial,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "processing" => Self::Processing,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "partial" => Self::Partial,
            other => return Err(ParseEnumError::new("batch_status", other)),
        })
    }
}

/// End-to-end accounting for one ingestion batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub id: Uuid,
    pub source_type: String,
    pub source_identifier: Option<String>,
    pub device_count: i32,
    pub record_count: i32,
    pub records_inserted: i32,
    pub records_failed: i32,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i32>,
    pub errors: Option<serde_json::Value>,
}

/// Rollup granularity, mapped to the continuous aggregate it reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    FiveMinute,
    Hourly,
    Daily,
}

impl Bucket {
    pub fn table(&self) -> &'static str {
        match self {
            Self::FiveMinute => "telemetry_5min",
            Self::Hourly => "telemetry_hourly",
            Self::Daily => "telemetry_daily",
        }
    }
}

/// One materialized rollup bucket for a (device, metric) pair.
#[derive(Debug, Clone, Serialize)]
pub struct BucketAggregate {
    pub bucket: DateTime<Utc>,
    pub device_id: Uuid,
    pub site_id: Uuid,
    pub metric_name: String,
    pub avg_value: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub first_value: Option<f64>,
    pub last_value: Option<f64>,
    pub sample_count: i64,
    pub quality_percent: Option<f64>,
}

/// Rolling totals over recent ingestion batches.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStats {
    pub batches: i64,
    pub records_inserted: i64,
    pub records_failed: i64,
    pub avg_processing_time_ms: Option<f64>,
}
