use sqlx::PgPool;

use crate::config::RetentionConfig;

/// Ordered list of DDL statements to ensure the telemetry schema exists.
/// Every statement is idempotent (`IF NOT EXISTS`) so safe to run on every
/// startup. Rollups, retention and compression are declared here as store
/// policies — nothing in the runtime loops over raw rows to aggregate them.
const MIGRATIONS: &[&str] = &[
    // ── Extensions ──
    "CREATE EXTENSION IF NOT EXISTS timescaledb CASCADE",
    r#"CREATE EXTENSION IF NOT EXISTS "uuid-ossp""#,

    // ── Device registry ──
    r"CREATE TABLE IF NOT EXISTS device_registry
(
    device_id                UUID PRIMARY KEY,
    site_id                  UUID NOT NULL,
    organization_id          UUID NOT NULL,
    device_type              VARCHAR(50) NOT NULL,
    serial_number            VARCHAR(100) NOT NULL UNIQUE,
    auth_token_hash          VARCHAR(255),
    token_expires_at         TIMESTAMPTZ,
    connection_status        VARCHAR(20) NOT NULL DEFAULT 'unknown',
    last_connected_at        TIMESTAMPTZ,
    last_disconnected_at     TIMESTAMPTZ,
    reconnect_count          INTEGER NOT NULL DEFAULT 0,
    protocol                 VARCHAR(50),
    connection_config        JSONB,
    polling_interval_seconds INTEGER NOT NULL DEFAULT 60,
    last_polled_at           TIMESTAMPTZ,
    next_poll_at             TIMESTAMPTZ,
    metadata                 JSONB,
    created_at               TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at               TIMESTAMPTZ,
    synced_at                TIMESTAMPTZ
)",
    "CREATE INDEX IF NOT EXISTS idx_device_registry_site ON device_registry (site_id)",
    "CREATE INDEX IF NOT EXISTS idx_device_registry_org ON device_registry (organization_id)",
    "CREATE INDEX IF NOT EXISTS idx_device_registry_status ON device_registry (connection_status)",
    "CREATE INDEX IF NOT EXISTS idx_device_registry_next_poll ON device_registry (next_poll_at)",

    // ── Raw telemetry (hypertable, 1-day chunks) ──
    r"CREATE TABLE IF NOT EXISTS telemetry_raw
(
    time             TIMESTAMPTZ NOT NULL,
    device_id        UUID NOT NULL,
    metric_name      VARCHAR(100) NOT NULL,
    site_id          UUID NOT NULL,
    metric_value     DOUBLE PRECISION,
    metric_value_str VARCHAR(255),
    quality          VARCHAR(20) NOT NULL DEFAULT 'good',
    unit             VARCHAR(20),
    source           VARCHAR(50),
    tags             JSONB,
    raw_value        BYTEA,
    received_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    processed        BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (time, device_id, metric_name)
)",
    r"SELECT create_hypertable('telemetry_raw', 'time',
        chunk_time_interval => INTERVAL '1 day',
        if_not_exists => TRUE)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_raw_device_time ON telemetry_raw (device_id, time DESC)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_raw_site_time ON telemetry_raw (site_id, time DESC)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_raw_device_metric ON telemetry_raw (device_id, metric_name, time DESC)",

    // ── Device events (hypertable, 1-day chunks) ──
    r"CREATE TABLE IF NOT EXISTS device_events
(
    time            TIMESTAMPTZ NOT NULL,
    device_id       UUID NOT NULL,
    event_type      VARCHAR(50) NOT NULL,
    site_id         UUID NOT NULL,
    event_code      VARCHAR(50),
    severity        VARCHAR(20) NOT NULL DEFAULT 'info',
    message         TEXT,
    details         JSONB,
    acknowledged    BOOLEAN NOT NULL DEFAULT false,
    acknowledged_at TIMESTAMPTZ,
    acknowledged_by UUID,
    PRIMARY KEY (time, device_id, event_type)
)",
    r"SELECT create_hypertable('device_events', 'time',
        chunk_time_interval => INTERVAL '1 day',
        if_not_exists => TRUE)",
    "CREATE INDEX IF NOT EXISTS idx_device_events_device ON device_events (device_id, time DESC)",
    "CREATE INDEX IF NOT EXISTS idx_device_events_site ON device_events (site_id, time DESC)",
    "CREATE INDEX IF NOT EXISTS idx_device_events_type ON device_events (event_type, time DESC)",

    // ── Command queue ──
    r"CREATE TABLE IF NOT EXISTS device_commands
(
    id              UUID PRIMARY KEY,
    device_id       UUID NOT NULL,
    site_id         UUID NOT NULL,
    command_type    VARCHAR(100) NOT NULL,
    command_params  JSONB,
    status          VARCHAR(20) NOT NULL DEFAULT 'pending',
    priority        INTEGER NOT NULL DEFAULT 5,
    created_by      UUID,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    scheduled_at    TIMESTAMPTZ,
    sent_at         TIMESTAMPTZ,
    acknowledged_at TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ,
    expires_at      TIMESTAMPTZ,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 3,
    result          JSONB,
    error_code      VARCHAR(50),
    error_message   TEXT
)",
    "CREATE INDEX IF NOT EXISTS idx_device_commands_claim ON device_commands (device_id, status, priority, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_device_commands_site ON device_commands (site_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_device_commands_status ON device_commands (status)",

    // ── Metric catalog ──
    r"CREATE TABLE IF NOT EXISTS metric_definitions
(
    metric_name        VARCHAR(100) PRIMARY KEY,
    display_name       VARCHAR(255) NOT NULL,
    description        TEXT,
    unit               VARCHAR(20) NOT NULL,
    data_type          VARCHAR(20) NOT NULL,
    device_types       TEXT[] NOT NULL,
    min_value          DOUBLE PRECISION,
    max_value          DOUBLE PRECISION,
    aggregation_method VARCHAR(20) NOT NULL DEFAULT 'avg',
    is_cumulative      BOOLEAN NOT NULL DEFAULT false,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT now()
)",

    // ── Ingestion batch accounting ──
    r"CREATE TABLE IF NOT EXISTS ingestion_batches
(
    id                 UUID PRIMARY KEY,
    source_type        VARCHAR(50) NOT NULL,
    source_identifier  VARCHAR(255),
    device_count       INTEGER NOT NULL DEFAULT 0,
    record_count       INTEGER NOT NULL DEFAULT 0,
    records_inserted   INTEGER NOT NULL DEFAULT 0,
    records_failed     INTEGER NOT NULL DEFAULT 0,
    status             VARCHAR(20) NOT NULL DEFAULT 'processing',
    started_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
    completed_at       TIMESTAMPTZ,
    processing_time_ms INTEGER,
    errors             JSONB
)",
    "CREATE INDEX IF NOT EXISTS idx_ingestion_batches_status ON ingestion_batches (status, started_at DESC)",

    // ── Continuous aggregates: 5-minute / hourly / daily rollups ──
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS telemetry_5min
WITH (timescaledb.continuous) AS
SELECT
    time_bucket('5 minutes', time) AS bucket,
    device_id,
    site_id,
    metric_name,
    AVG(metric_value) AS avg_value,
    MIN(metric_value) AS min_value,
    MAX(metric_value) AS max_value,
    FIRST(metric_value, time) AS first_value,
    LAST(metric_value, time) AS last_value,
    COUNT(*) AS sample_count,
    COUNT(CASE WHEN quality = 'good' THEN 1 END)::float / NULLIF(COUNT(*), 0) * 100 AS quality_percent
FROM telemetry_raw
GROUP BY bucket, device_id, site_id, metric_name
WITH NO DATA",
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS telemetry_hourly
WITH (timescaledb.continuous) AS
SELECT
    time_bucket('1 hour', time) AS bucket,
    device_id,
    site_id,
    metric_name,
    AVG(metric_value) AS avg_value,
    MIN(metric_value) AS min_value,
    MAX(metric_value) AS max_value,
    FIRST(metric_value, time) AS first_value,
    LAST(metric_value, time) AS last_value,
    COUNT(*) AS sample_count,
    COUNT(CASE WHEN quality = 'good' THEN 1 END)::float / NULLIF(COUNT(*), 0) * 100 AS quality_percent
FROM telemetry_raw
GROUP BY bucket, device_id, site_id, metric_name
WITH NO DATA",
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS telemetry_daily
WITH (timescaledb.continuous) AS
SELECT
    time_bucket('1 day', time) AS bucket,
    device_id,
    site_id,
    metric_name,
    AVG(metric_value) AS avg_value,
    MIN(metric_value) AS min_value,
    MAX(metric_value) AS max_value,
    FIRST(metric_value, time) AS first_value,
    LAST(metric_value, time) AS last_value,
    COUNT(*) AS sample_count,
    COUNT(CASE WHEN quality = 'good' THEN 1 END)::float / NULLIF(COUNT(*), 0) * 100 AS quality_percent
FROM telemetry_raw
GROUP BY bucket, device_id, site_id, metric_name
WITH NO DATA",

    // ── Refresh policies: 5min every 5m (1h→10m), hourly every 1h (3h→1h),
    //    daily every 1d (3d→1d) ──
    r"SELECT add_continuous_aggregate_policy('telemetry_5min',
        start_offset => INTERVAL '1 hour',
        end_offset => INTERVAL '10 minutes',
        schedule_interval => INTERVAL '5 minutes',
        if_not_exists => TRUE)",
    r"SELECT add_continuous_aggregate_policy('telemetry_hourly',
        start_offset => INTERVAL '3 hours',
        end_offset => INTERVAL '1 hour',
        schedule_interval => INTERVAL '1 hour',
        if_not_exists => TRUE)",
    r"SELECT add_continuous_aggregate_policy('telemetry_daily',
        start_offset => INTERVAL '3 days',
        end_offset => INTERVAL '1 day',
        schedule_interval => INTERVAL '1 day',
        if_not_exists => TRUE)",

    "CREATE INDEX IF NOT EXISTS idx_telemetry_5min_device ON telemetry_5min (device_id, bucket DESC)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_5min_site ON telemetry_5min (site_id, bucket DESC)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_hourly_device ON telemetry_hourly (device_id, bucket DESC)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_hourly_site ON telemetry_hourly (site_id, bucket DESC)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_daily_device ON telemetry_daily (device_id, bucket DESC)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_daily_site ON telemetry_daily (site_id, bucket DESC)",

    // ── Hourly event counts per site ──
    r"CREATE MATERIALIZED VIEW IF NOT EXISTS event_counts_hourly
WITH (timescaledb.continuous) AS
SELECT
    time_bucket('1 hour', time) AS bucket,
    site_id,
    event_type,
    severity,
    COUNT(*) AS event_count,
    COUNT(CASE WHEN acknowledged = false THEN 1 END) AS unacknowledged_count
FROM device_events
GROUP BY bucket, site_id, event_type, severity
WITH NO DATA",
    r"SELECT add_continuous_aggregate_policy('event_counts_hourly',
        start_offset => INTERVAL '3 hours',
        end_offset => INTERVAL '1 hour',
        schedule_interval => INTERVAL '1 hour',
        if_not_exists => TRUE)",

    // ── Compression for old raw chunks, segmented per series ──
    r"ALTER TABLE telemetry_raw SET (
        timescaledb.compress,
        timescaledb.compress_segmentby = 'device_id, metric_name'
    )",
];

/// Run all migrations, then apply the config-driven retention and
/// compression policies.
pub async fn run(pool: &PgPool, retention: &RetentionConfig) -> anyhow::Result<()> {
    tracing::info!("running schema migrations ({} statements)", MIGRATIONS.len());

    for (i, sql) in MIGRATIONS.iter().enumerate() {
        let preview: String = sql.chars().take(80).collect();
        tracing::debug!("migration {}/{}: {}...", i + 1, MIGRATIONS.len(), preview);
        sqlx::query(sql).execute(pool).await.map_err(|e| {
            tracing::error!("migration {}/{} failed: {e}", i + 1, MIGRATIONS.len());
            e
        })?;
    }

    tracing::info!("schema migrations complete");

    apply_retention_policies(pool, retention).await;

    Ok(())
}

/// (Re)apply retention and compression windows from config.
///
/// `add_retention_policy(if_not_exists)` won't update an existing interval,
/// so each policy is removed and re-added with the configured window.
/// Non-fatal — a policy statement that fails is logged and skipped so a
/// fresh instance still comes up.
async fn apply_retention_policies(pool: &PgPool, retention: &RetentionConfig) {
    // (table, retain_days); daily aggregates are kept forever.
    let specs: &[(&str, u32)] = &[
        ("telemetry_raw", retention.raw_days),
        ("device_events", retention.event_days),
        ("telemetry_5min", retention.agg_5min_days),
        ("telemetry_hourly", retention.agg_hourly_days),
    ];

    for (table, days) in specs {
        let remove = format!("SELECT remove_retention_policy('{table}', if_exists => TRUE)");
        if let Err(e) = sqlx::query(&remove).execute(pool).await {
            tracing::warn!("could not clear retention policy on {table}: {e}");
            continue;
        }
        let add = format!(
            "SELECT add_retention_policy('{table}', INTERVAL '{days} days', if_not_exists => TRUE)"
        );
        if let Err(e) = sqlx::query(&add).execute(pool).await {
            tracing::warn!("could not set retention policy on {table}: {e}");
        }
    }

    let remove = "SELECT remove_compression_policy('telemetry_raw', if_exists => TRUE)";
    if let Err(e) = sqlx::query(remove).execute(pool).await {
        tracing::warn!("could not clear compression policy: {e}");
        return;
    }
    let add = format!(
        "SELECT add_compression_policy('telemetry_raw', INTERVAL '{} days', if_not_exists => TRUE)",
        retention.compress_after_days
    );
    if let Err(e) = sqlx::query(&add).execute(pool).await {
        tracing::warn!("could not set compression policy: {e}");
    }

    tracing::info!(
        "retention policies applied (raw={}d, events={}d, 5min={}d, hourly={}d, compress>{}d)",
        retention.raw_days,
        retention.event_days,
        retention.agg_5min_days,
        retention.agg_hourly_days,
        retention.compress_after_days,
    );
}
