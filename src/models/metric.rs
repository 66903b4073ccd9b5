use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ParseEnumError;
use super::device::DeviceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Float,
    String,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::String => "string",
        }
    }
}

impl std::str::FromStr for ValueKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "float" => Self::Float,
            "string" => Self::String,
            other => return Err(ParseEnumError::new("value_kind", other)),
        })
    }
}

/// How a metric's raw samples combine inside a rollup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Avg,
    Sum,
    Min,
    Max,
    First,
    Last,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

impl std::str::FromStr for Aggregation {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "avg" => Self::Avg,
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            "first" => Self::First,
            "last" => Self::Last,
            other => return Err(ParseEnumError::new("aggregation", other)),
        })
    }
}

/// A row in `metric_definitions`. Bounds, when set, are inclusive and
/// enforced by ingestion (out-of-range points are kept at reduced quality).
#[derive(Debug, Clone, Serialize)]
pub struct MetricDefinition {
    pub metric_name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub unit: String,
    pub value_kind: ValueKind,
    pub device_kinds: Vec<DeviceKind>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub aggregation: Aggregation,
    pub is_cumulative: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl MetricDefinition {
    pub fn new(metric_name: impl Into<String>, display_name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            display_name: display_name.into(),
            description: None,
            unit: unit.into(),
            value_kind: ValueKind::Float,
            device_kinds: Vec::new(),
            min_value: None,
            max_value: None,
            aggregation: Aggregation::Avg,
            is_cumulative: false,
            created_at: None,
        }
    }

    pub fn with_kinds(mut self, kinds: &[DeviceKind]) -> Self {
        self.device_kinds = kinds.to_vec();
        self
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn cumulative(mut self) -> Self {
        self.is_cumulative = true;
        self
    }

    /// Inclusive bounds check. A metric without bounds accepts everything.
    pub fn in_bounds(&self, value: f64) -> bool {
        if let Some(min) = self.min_value {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max_value {
            if value > max {
                return false;
            }
        }
        true
    }
}
