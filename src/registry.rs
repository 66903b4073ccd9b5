use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::device::{
    ConnectionStatus, ControlPlaneDevice, Device, DeviceKind, DeviceUpdate, KindCount, NewDevice,
    Protocol, StatusCount,
};

/// Authoritative record of devices on the telemetry plane: identity, auth
/// tokens, connection lifecycle and polling cadence. Rows are synced from
/// the control plane and never hard-deleted; logical delete marks them
/// decommissioned.
pub struct DeviceRegistry {
    pool: PgPool,
    token_expiry_days: i64,
}

/// Compare two byte strings without short-circuiting on the first
/// difference. Length mismatch still returns early; token hashes are
/// fixed-length hex so that leaks nothing.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Generate a URL-safe device token with 256 bits of entropy.
fn generate_token_plaintext() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl DeviceRegistry {
    pub fn new(pool: PgPool, token_expiry_days: i64) -> Self {
        Self {
            pool,
            token_expiry_days,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ── CRUD and sync ──

    pub async fn create(&self, new: &NewDevice) -> anyhow::Result<Device> {
        let row = sqlx::query(
            r"
            INSERT INTO device_registry
                (device_id, site_id, organization_id, device_type, serial_number,
                 protocol, connection_config, polling_interval_seconds, metadata,
                 connection_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'unknown')
            RETURNING *
            ",
        )
        .bind(new.device_id)
        .bind(new.site_id)
        .bind(new.organization_id)
        .bind(new.device_type.as_str())
        .bind(&new.serial_number)
        .bind(new.protocol.map(|p| p.as_str()))
        .bind(&new.connection_config)
        .bind(new.polling_interval_seconds.max(1))
        .bind(&new.metadata)
        .fetch_one(&self.pool)
        .await?;
        device_from_row(&row)
    }

    /// Upsert a device record pushed from the control plane. Fields the
    /// control plane leaves out keep their local values.
    pub async fn sync_from_control_plane(&self, dev: &ControlPlaneDevice) -> anyhow::Result<Device> {
        let row = sqlx::query(
            r"
            INSERT INTO device_registry
                (device_id, site_id, organization_id, device_type, serial_number,
                 protocol, connection_config, metadata, polling_interval_seconds,
                 connection_status, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, 60), 'unknown', now())
            ON CONFLICT (device_id) DO UPDATE SET
                site_id = EXCLUDED.site_id,
                organization_id = EXCLUDED.organization_id,
                device_type = EXCLUDED.device_type,
                serial_number = EXCLUDED.serial_number,
                protocol = COALESCE(EXCLUDED.protocol, device_registry.protocol),
                connection_config = COALESCE(EXCLUDED.connection_config, device_registry.connection_config),
                metadata = COALESCE(EXCLUDED.metadata, device_registry.metadata),
                polling_interval_seconds = COALESCE($9, device_registry.polling_interval_seconds),
                updated_at = now(),
                synced_at = now()
            RETURNING *
            ",
        )
        .bind(dev.id)
        .bind(dev.site_id)
        .bind(dev.organization_id)
        .bind(dev.device_type.as_str())
        .bind(&dev.serial_number)
        .bind(dev.protocol.map(|p| p.as_str()))
        .bind(&dev.connection_config)
        .bind(&dev.metadata)
        .bind(dev.polling_interval_seconds.map(|s| s.max(1)))
        .fetch_one(&self.pool)
        .await?;
        device_from_row(&row)
    }

    pub async fn get_by_id(&self, device_id: Uuid) -> anyhow::Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM device_registry WHERE device_id = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| device_from_row(&r)).transpose()
    }

    pub async fn get_by_serial(&self, serial_number: &str) -> anyhow::Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM device_registry WHERE serial_number = $1")
            .bind(serial_number)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| device_from_row(&r)).transpose()
    }

    pub async fn list_by_site(&self, site_id: Uuid) -> anyhow::Result<Vec<Device>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM device_registry
            WHERE site_id = $1 AND connection_status <> 'decommissioned'
            ORDER BY serial_number
            ",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    pub async fn list_by_org(&self, organization_id: Uuid) -> anyhow::Result<Vec<Device>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM device_registry
            WHERE organization_id = $1 AND connection_status <> 'decommissioned'
            ORDER BY serial_number
            ",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    pub async fn update(&self, device_id: Uuid, update: &DeviceUpdate) -> anyhow::Result<Option<Device>> {
        let row = sqlx::query(
            r"
            UPDATE device_registry SET
                site_id = COALESCE($2, site_id),
                device_type = COALESCE($3, device_type),
                protocol = COALESCE($4, protocol),
                connection_config = COALESCE($5, connection_config),
                polling_interval_seconds = COALESCE($6, polling_interval_seconds),
                metadata = COALESCE($7, metadata),
                updated_at = now()
            WHERE device_id = $1
            RETURNING *
            ",
        )
        .bind(device_id)
        .bind(update.site_id)
        .bind(update.device_type.map(|k| k.as_str()))
        .bind(update.protocol.map(|p| p.as_str()))
        .bind(&update.connection_config)
        .bind(update.polling_interval_seconds.map(|s| s.max(1)))
        .bind(&update.metadata)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| device_from_row(&r)).transpose()
    }

    /// Logical delete. Telemetry retention still holds references to the
    /// row, so it is only marked decommissioned.
    pub async fn decommission(&self, device_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_registry
            SET connection_status = 'decommissioned', updated_at = now()
            WHERE device_id = $1 AND connection_status <> 'decommissioned'
            ",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_synced(&self, device_ids: &[Uuid]) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE device_registry SET synced_at = now() WHERE device_id = ANY($1)",
        )
        .bind(device_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Devices whose local row changed since the last control-plane mirror.
    pub async fn list_unsynced(&self) -> anyhow::Result<Vec<Device>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM device_registry
            WHERE synced_at IS NULL OR (updated_at IS NOT NULL AND updated_at > synced_at)
            ORDER BY updated_at NULLS FIRST
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    // ── Connection lifecycle ──

    /// Idempotent, timestamped status transition. Entering `connected`
    /// bumps the reconnect counter; repeating it does not.
    pub async fn update_connection_status(
        &self,
        device_id: Uuid,
        status: ConnectionStatus,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_registry SET
                connection_status = $2,
                last_connected_at = CASE WHEN $2 = 'connected'
                    THEN now() ELSE last_connected_at END,
                last_disconnected_at = CASE WHEN $2 IN ('disconnected', 'error')
                    THEN now() ELSE last_disconnected_at END,
                reconnect_count = reconnect_count + CASE
                    WHEN $2 = 'connected' AND connection_status <> 'connected' THEN 1
                    ELSE 0 END,
                updated_at = now()
            WHERE device_id = $1
            ",
        )
        .bind(device_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_connected(&self) -> anyhow::Result<Vec<Device>> {
        let rows = sqlx::query(
            "SELECT * FROM device_registry WHERE connection_status = 'connected' ORDER BY serial_number",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    pub async fn connection_stats(&self) -> anyhow::Result<Vec<StatusCount>> {
        let rows = sqlx::query(
            r"
            SELECT connection_status, COUNT(*) AS count FROM device_registry
            WHERE connection_status <> 'decommissioned'
            GROUP BY connection_status
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("connection_status");
                Ok(StatusCount {
                    status: status.parse::<ConnectionStatus>()?,
                    count: row.get("count"),
                })
            })
            .collect()
    }

    pub async fn kind_counts(&self) -> anyhow::Result<Vec<KindCount>> {
        let rows = sqlx::query(
            r"
            SELECT device_type, COUNT(*) AS count FROM device_registry
            WHERE connection_status <> 'decommissioned'
            GROUP BY device_type
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let kind: String = row.get("device_type");
                Ok(KindCount {
                    device_type: kind.parse::<DeviceKind>()?,
                    count: row.get("count"),
                })
            })
            .collect()
    }

    // ── Polling schedule ──

    /// Devices due for a poll, soonest first. Never-polled devices sort
    /// ahead of everything.
    pub async fn list_due_for_polling(&self, limit: i64) -> anyhow::Result<Vec<Device>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM device_registry
            WHERE connection_status <> 'decommissioned'
              AND (next_poll_at IS NULL OR next_poll_at <= now())
            ORDER BY next_poll_at ASC NULLS FIRST
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    /// Record a completed poll: last = now, next = now + interval.
    pub async fn mark_polled(&self, device_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_registry SET
                last_polled_at = now(),
                next_poll_at = now() + make_interval(secs => polling_interval_seconds),
                updated_at = now()
            WHERE device_id = $1
            ",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Auth tokens ──

    /// Mint a fresh token for the device and return the plaintext — the
    /// only time it is ever visible. Only the SHA-256 is stored.
    pub async fn generate_token(
        &self,
        device_id: Uuid,
        expires_in_days: Option<i64>,
    ) -> anyhow::Result<String> {
        let token = generate_token_plaintext();
        let hash = hash_token(&token);
        let expires_at = Utc::now() + chrono::Duration::days(expires_in_days.unwrap_or(self.token_expiry_days));

        let result = sqlx::query(
            r"
            UPDATE device_registry
            SET auth_token_hash = $2, token_expires_at = $3, updated_at = now()
            WHERE device_id = $1
            ",
        )
        .bind(device_id)
        .bind(&hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("device {device_id} not found");
        }
        Ok(token)
    }

    pub async fn validate_token(&self, device_id: Uuid, token: &str) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT auth_token_hash, token_expires_at FROM device_registry WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let stored: Option<String> = row.get("auth_token_hash");
        let expires_at: Option<DateTime<Utc>> = row.get("token_expires_at");
        Ok(token_matches(stored.as_deref(), expires_at, token))
    }

    pub async fn revoke_token(&self, device_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_registry
            SET auth_token_hash = NULL, token_expires_at = NULL, updated_at = now()
            WHERE device_id = $1
            ",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns the device iff (serial, token) matches an undecommissioned
    /// row with an unexpired token.
    pub async fn authenticate_by_serial(
        &self,
        serial_number: &str,
        token: &str,
    ) -> anyhow::Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT * FROM device_registry WHERE serial_number = $1 AND connection_status <> 'decommissioned'",
        )
        .bind(serial_number)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stored: Option<String> = row.get("auth_token_hash");
        let expires_at: Option<DateTime<Utc>> = row.get("token_expires_at");
        if token_matches(stored.as_deref(), expires_at, token) {
            Ok(Some(device_from_row(&row)?))
        } else {
            Ok(None)
        }
    }

    // ── Summary ──

    /// Operator-facing snapshot: the device row plus queue depth and the
    /// time of its most recent telemetry.
    pub async fn summary(&self, device_id: Uuid) -> anyhow::Result<Option<DeviceSummary>> {
        let Some(device) = self.get_by_id(device_id).await? else {
            return Ok(None);
        };
        let row = sqlx::query(
            r"
            SELECT
                (SELECT MAX(time) FROM telemetry_raw WHERE device_id = $1) AS last_telemetry_at,
                (SELECT COUNT(*) FROM device_commands
                 WHERE device_id = $1 AND status = 'pending') AS pending_commands
            ",
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(DeviceSummary {
            last_telemetry_at: row.get("last_telemetry_at"),
            pending_commands: row.get("pending_commands"),
            device,
        }))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceSummary {
    pub device: Device,
    pub last_telemetry_at: Option<DateTime<Utc>>,
    pub pending_commands: i64,
}

fn token_matches(
    stored_hash: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
    token: &str,
) -> bool {
    let Some(stored) = stored_hash else {
        return false;
    };
    if let Some(expiry) = expires_at {
        if expiry <= Utc::now() {
            return false;
        }
    }
    constant_time_eq(stored.as_bytes(), hash_token(token).as_bytes())
}

fn device_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<Device> {
    let device_type: String = row.get("device_type");
    let connection_status: String = row.get("connection_status");
    let protocol: Option<String> = row.get("protocol");
    Ok(Device {
        device_id: row.get("device_id"),
        site_id: row.get("site_id"),
        organization_id: row.get("organization_id"),
        device_type: device_type.parse::<DeviceKind>()?,
        serial_number: row.get("serial_number"),
        auth_token_hash: row.get("auth_token_hash"),
        token_expires_at: row.get("token_expires_at"),
        connection_status: connection_status.parse::<ConnectionStatus>()?,
        last_connected_at: row.get("last_connected_at"),
        last_disconnected_at: row.get("last_disconnected_at"),
        reconnect_count: row.get("reconnect_count"),
        protocol: protocol.map(|p| p.parse::<Protocol>()).transpose()?,
        connection_config: row.get("connection_config"),
        polling_interval_seconds: row.get("polling_interval_seconds"),
        last_polled_at: row.get("last_polled_at"),
        next_poll_at: row.get("next_poll_at"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        synced_at: row.get("synced_at"),
    })
}
