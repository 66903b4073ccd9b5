use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::device::Protocol;
use crate::models::telemetry::TelemetryPoint;

/// Error type for adapter transport operations. Command timeouts are NOT
/// errors — they surface as a `CommandOutcome` with `reason: "timeout"`.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("adapter is not connected")]
    NotConnected,
}

/// A telemetry snapshot as a device reports it, before it is broken into
/// catalog metrics. `extra` keeps the complete raw payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub ts: DateTime<Utc>,
    pub pv_power_w: Option<f64>,
    pub grid_power_w: Option<f64>,
    pub load_power_w: Option<f64>,
    pub batt_voltage_v: Option<f64>,
    pub batt_current_a: Option<f64>,
    pub batt_power_w: Option<f64>,
    pub batt_soc_pct: Option<f64>,
    pub inverter_temp_c: Option<f64>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Telemetry {
    /// Sentinel snapshot with every metric absent, returned by `poll()`
    /// before any telemetry has arrived.
    pub fn empty(ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            pv_power_w: None,
            grid_power_w: None,
            load_power_w: None,
            batt_voltage_v: None,
            batt_current_a: None,
            batt_power_w: None,
            batt_soc_pct: None,
            inverter_temp_c: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pv_power_w.is_none()
            && self.grid_power_w.is_none()
            && self.load_power_w.is_none()
            && self.batt_voltage_v.is_none()
            && self.batt_current_a.is_none()
            && self.batt_power_w.is_none()
            && self.batt_soc_pct.is_none()
            && self.inverter_temp_c.is_none()
    }

    /// Break the snapshot into catalog-named points for ingestion.
    /// Absent fields produce no point.
    pub fn into_points(self, device_id: Uuid, site_id: Uuid, source: &str) -> Vec<TelemetryPoint> {
        let fields: [(&str, Option<f64>); 8] = [
            ("pv_power", self.pv_power_w),
            ("grid_power", self.grid_power_w),
            ("load_power", self.load_power_w),
            ("battery_voltage", self.batt_voltage_v),
            ("battery_current", self.batt_current_a),
            ("battery_power", self.batt_power_w),
            ("battery_soc", self.batt_soc_pct),
            ("temperature", self.inverter_temp_c),
        ];
        fields
            .into_iter()
            .filter_map(|(name, value)| {
                value.map(|v| {
                    TelemetryPoint::numeric(self.ts, device_id, site_id, name, v)
                        .with_source(source)
                })
            })
            .collect()
    }
}

/// Wire actions understood by the generic adapter layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Read,
    Write,
    WriteMany,
    Raw,
    Ping,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::WriteMany => "write_many",
            Self::Raw => "raw",
            Self::Ping => "ping",
        }
    }
}

/// A command bound for a device through an adapter.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub action: CommandAction,
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Response deadline; the adapter default applies when unset.
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(action: CommandAction) -> Self {
        Self {
            action,
            params: serde_json::Map::new(),
            timeout: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(CommandAction::Ping)
    }

    pub fn read(id: impl Into<String>) -> Self {
        Self::new(CommandAction::Read)
            .with_param("id", serde_json::Value::String(id.into()))
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Device response to a command, or the adapter's non-exceptional verdict
/// (timeout, publish failure). Always carries the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub ok: bool,
    pub command_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CommandOutcome {
    pub fn ok(command_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            command_id: command_id.into(),
            value: None,
            reason: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn timeout(command_id: impl Into<String>) -> Self {
        Self {
            ok: false,
            command_id: command_id.into(),
            value: None,
            reason: Some("timeout".to_string()),
            extra: serde_json::Map::new(),
        }
    }

    pub fn error(command_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            command_id: command_id.into(),
            value: None,
            reason: Some(reason.into()),
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        !self.ok && self.reason.as_deref() == Some("timeout")
    }
}

/// Time-of-use window support advertised by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouCapability {
    pub max_windows: u32,
    pub bidirectional: bool,
    pub separate_charge_discharge: bool,
    pub max_charge_windows: u32,
    pub max_discharge_windows: u32,
}

impl Default for TouCapability {
    fn default() -> Self {
        Self {
            max_windows: 3,
            bidirectional: true,
            separate_charge_discharge: false,
            max_charge_windows: 3,
            max_discharge_windows: 3,
        }
    }
}

/// Telemetry older than twice the polling interval is stale and worth a
/// warning, though still served.
pub fn is_stale(age: Duration, polling_interval: Duration) -> bool {
    age > polling_interval * 2
}

/// Uniform contract over field devices, whatever the transport: push or
/// pull, stateless or session-oriented. One adapter instance serves one
/// device.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Establish the transport, blocking until ready or failed. Idempotent
    /// when already connected.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Release transport resources. Re-closing is a no-op, never an error.
    async fn close(&self);

    /// Latest telemetry snapshot. Returns the sentinel empty snapshot when
    /// nothing has arrived yet; stale data is returned with a logged
    /// warning rather than withheld.
    async fn poll(&self) -> Result<Telemetry, AdapterError>;

    /// Send a command and await the response up to the request's (or the
    /// adapter's default) timeout. Timeouts and transport failures resolve
    /// to a `CommandOutcome`, never an error.
    async fn handle_command(&self, request: CommandRequest) -> CommandOutcome;

    /// Serial number from cached telemetry if present, else via a read
    /// command; None when the device won't say.
    async fn read_serial_number(&self) -> Option<String>;

    /// True if recent telemetry arrived (≤120 s) or a ping round-trips.
    async fn check_connectivity(&self) -> bool;

    fn tou_capability(&self) -> TouCapability {
        TouCapability::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_snapshot_is_empty() {
        let t = Telemetry::empty(Utc::now());
        assert!(t.is_empty());
        assert!(t.extra.is_empty());
    }

    #[test]
    fn staleness_threshold_is_twice_interval() {
        let interval = Duration::from_secs(60);
        assert!(!is_stale(Duration::from_secs(119), interval));
        assert!(!is_stale(Duration::from_secs(120), interval));
        assert!(is_stale(Duration::from_secs(121), interval));
    }

    #[test]
    fn snapshot_breaks_into_catalog_points() {
        let mut t = Telemetry::empty(Utc::now());
        t.pv_power_w = Some(3500.0);
        t.batt_soc_pct = Some(80.0);
        let points = t.into_points(Uuid::new_v4(), Uuid::new_v4(), "mqtt");
        let names: Vec<&str> = points.iter().map(|p| p.metric_name.as_str()).collect();
        assert_eq!(names, vec!["pv_power", "battery_soc"]);
        assert!(points.iter().all(|p| p.source.as_deref() == Some("mqtt")));
    }

    #[test]
    fn timeout_outcome_shape() {
        let outcome = CommandOutcome::timeout("ab12cd34");
        assert!(!outcome.ok);
        assert!(outcome.is_timeout());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["ok"], serde_json::json!(false));
        assert_eq!(json["reason"], serde_json::json!("timeout"));
        assert_eq!(json["command_id"], serde_json::json!("ab12cd34"));
    }

    #[test]
    fn outcome_round_trips_device_payload() {
        let payload = serde_json::json!({
            "command_id": "x1",
            "ok": true,
            "value": 42,
        });
        let outcome: CommandOutcome = serde_json::from_value(payload).unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.value, Some(serde_json::json!(42)));
        assert!(!outcome.is_timeout());
    }
}
