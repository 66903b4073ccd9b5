use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParseEnumError;

/// Kind of field device. Values are the stable strings shared with the
/// control plane and persisted in `device_registry.device_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Inverter,
    Meter,
    Battery,
    WeatherStation,
    Sensor,
    Gateway,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inverter => "inverter",
            Self::Meter => "meter",
            Self::Battery => "battery",
            Self::WeatherStation => "weather_station",
            Self::Sensor => "sensor",
            Self::Gateway => "gateway",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "inverter" => Self::Inverter,
            "meter" => Self::Meter,
            "battery" => Self::Battery,
            "weather_station" => Self::WeatherStation,
            "sensor" => Self::Sensor,
            "gateway" => Self::Gateway,
            other => return Err(ParseEnumError::new("device_kind", other)),
        })
    }
}

/// Transport protocol tag. The concrete connection parameters live in the
/// opaque `connection_config` map and are interpreted by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    ModbusTcp,
    ModbusRtu,
    Mqtt,
    Http,
    Custom,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModbusTcp => "modbus_tcp",
            Self::ModbusRtu => "modbus_rtu",
            Self::Mqtt => "mqtt",
            Self::Http => "http",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "modbus_tcp" => Self::ModbusTcp,
            "modbus_rtu" => Self::ModbusRtu,
            "mqtt" => Self::Mqtt,
            "http" => Self::Http,
            "custom" => Self::Custom,
            other => return Err(ParseEnumError::new("protocol", other)),
        })
    }
}

/// Connectivity state of a device.
///
/// `Decommissioned` is the logical-delete marker: decommissioned rows are
/// kept for telemetry retention but excluded from all listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
    Maintenance,
    Unknown,
    Decommissioned,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
            Self::Unknown => "unknown",
            Self::Decommissioned => "decommissioned",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "error" => Self::Error,
            "maintenance" => Self::Maintenance,
            "unknown" => Self::Unknown,
            "decommissioned" => Self::Decommissioned,
            other => return Err(ParseEnumError::new("connection_status", other)),
        })
    }
}

/// A row in `device_registry` — the telemetry plane's authoritative record
/// of one field device, synced from the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: Uuid,
    pub site_id: Uuid,
    pub organization_id: Uuid,
    pub device_type: DeviceKind,
    pub serial_number: String,
    /// SHA-256 hex of the auth token. The plaintext is never stored.
    #[serde(skip_serializing)]
    pub auth_token_hash: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub connection_status: ConnectionStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub reconnect_count: i32,
    pub protocol: Option<Protocol>,
    pub connection_config: Option<serde_json::Value>,
    pub polling_interval_seconds: i32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Fields required to register a device directly on the telemetry plane.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub device_id: Uuid,
    pub site_id: Uuid,
    pub organization_id: Uuid,
    pub device_type: DeviceKind,
    pub serial_number: String,
    pub protocol: Option<Protocol>,
    pub connection_config: Option<serde_json::Value>,
    pub polling_interval_seconds: i32,
    pub metadata: Option<serde_json::Value>,
}

impl NewDevice {
    pub fn new(
        device_id: Uuid,
        site_id: Uuid,
        organization_id: Uuid,
        device_type: DeviceKind,
        serial_number: impl Into<String>,
    ) -> Self {
        Self {
            device_id,
            site_id,
            organization_id,
            device_type,
            serial_number: serial_number.into(),
            protocol: None,
            connection_config: None,
            polling_interval_seconds: 60,
            metadata: None,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub site_id: Option<Uuid>,
    pub device_type: Option<DeviceKind>,
    pub protocol: Option<Protocol>,
    pub connection_config: Option<serde_json::Value>,
    pub polling_interval_seconds: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

/// Device record as delivered by the control plane sync feed.
/// Only the identity fields are required; everything else defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneDevice {
    pub id: Uuid,
    pub site_id: Uuid,
    pub organization_id: Uuid,
    pub device_type: DeviceKind,
    pub serial_number: String,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub connection_config: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub polling_interval_seconds: Option<i32>,
}

/// In-memory session for a connected device. At most one per device id;
/// evicted after the inactivity timeout.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSession {
    pub device_id: Uuid,
    pub session_id: Uuid,
    pub client_addr: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: ConnectionStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindCount {
    pub device_type: DeviceKind,
    pub count: i64,
}
