use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `solarflux.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SolarfluxConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub mqtt: MqttDefaults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Overridden by `DATABASE_URL` when set.
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Apply schema DDL and policies on startup.
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            run_migrations: true,
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/solarflux".to_string()
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_expiry_days")]
    pub token_expiry_days: i64,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,
    /// Allowed clock skew for signed requests, in seconds.
    #[serde(default = "default_signature_skew_secs")]
    pub signature_skew_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_expiry_days: default_token_expiry_days(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_minutes: default_lockout_minutes(),
            signature_skew_secs: default_signature_skew_secs(),
        }
    }
}

fn default_token_expiry_days() -> i64 {
    365
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_lockout_minutes() -> i64 {
    30
}

fn default_signature_skew_secs() -> i64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are evicted by the sweep.
    #[serde(default = "default_session_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_session_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_session_timeout_secs(),
            sweep_interval_secs: default_session_sweep_secs(),
        }
    }
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_session_sweep_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// Cadence of the sweep that expires past-due commands.
    #[serde(default = "default_expire_sweep_secs")]
    pub expire_sweep_secs: u64,
    /// Terminal commands older than this are deleted by cleanup.
    #[serde(default = "default_command_keep_days")]
    pub keep_days: i64,
    /// Fallback executor deadline when a command has no expires_at.
    #[serde(default = "default_execute_timeout_secs")]
    pub execute_timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            expire_sweep_secs: default_expire_sweep_secs(),
            keep_days: default_command_keep_days(),
            execute_timeout_secs: default_execute_timeout_secs(),
        }
    }
}

fn default_expire_sweep_secs() -> u64 {
    60
}

fn default_command_keep_days() -> i64 {
    30
}

fn default_execute_timeout_secs() -> u64 {
    60
}

/// Retention and compression windows, applied as store policies at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_raw_days")]
    pub raw_days: u32,
    #[serde(default = "default_event_days")]
    pub event_days: u32,
    #[serde(default = "default_5min_days")]
    pub agg_5min_days: u32,
    #[serde(default = "default_hourly_days")]
    pub agg_hourly_days: u32,
    /// Raw chunks older than this are compressed. Daily aggregates are
    /// kept forever and have no knob here.
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_days: default_raw_days(),
            event_days: default_event_days(),
            agg_5min_days: default_5min_days(),
            agg_hourly_days: default_hourly_days(),
            compress_after_days: default_compress_after_days(),
        }
    }
}

fn default_raw_days() -> u32 {
    7
}

fn default_event_days() -> u32 {
    90
}

fn default_5min_days() -> u32 {
    30
}

fn default_hourly_days() -> u32 {
    365
}

fn default_compress_after_days() -> u32 {
    2
}

/// Broker defaults for MQTT adapters; per-device `connection_config`
/// entries override these.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttDefaults {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for MqttDefaults {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            keepalive_secs: default_keepalive_secs(),
            qos: default_qos(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "solar-hub".to_string()
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl SolarfluxConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: SolarfluxConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
