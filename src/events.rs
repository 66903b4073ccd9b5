use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::event::{
    DeviceEvent, EventCount, EventFilter, EventStats, Severity, TimelineBucket, TopErrorDevice,
};

/// Append-only journal of per-device events. Events are immutable except
/// for acknowledgement, which is set-if-null so concurrent acks are
/// idempotent. (time, device_id, event_type) deduplicates appends.
pub struct EventJournal {
    pool: PgPool,
}

impl EventJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ── Append ──

    /// Append one event. Returns false when the (time, device, type) triple
    /// already exists.
    pub async fn append(&self, event: &DeviceEvent) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO device_events
                (time, device_id, event_type, site_id, event_code, severity, message, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (time, device_id, event_type) DO NOTHING
            ",
        )
        .bind(event.time)
        .bind(event.device_id)
        .bind(&event.event_type)
        .bind(event.site_id)
        .bind(&event.event_code)
        .bind(event.severity.as_str())
        .bind(&event.message)
        .bind(&event.details)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append a batch in arrival order; duplicates are dropped silently.
    /// Returns the number of events actually written.
    pub async fn append_batch(&self, events: &[DeviceEvent]) -> anyhow::Result<u64> {
        let mut written = 0;
        for event in events {
            if self.append(event).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    // ── Listings ──

    pub async fn list_for_device(
        &self,
        device_id: Uuid,
        filter: &EventFilter,
    ) -> anyhow::Result<Vec<DeviceEvent>> {
        self.list("device_id", device_id, filter).await
    }

    pub async fn list_for_site(
        &self,
        site_id: Uuid,
        filter: &EventFilter,
    ) -> anyhow::Result<Vec<DeviceEvent>> {
        self.list("site_id", site_id, filter).await
    }

    async fn list(
        &self,
        scope_column: &str,
        scope_id: Uuid,
        filter: &EventFilter,
    ) -> anyhow::Result<Vec<DeviceEvent>> {
        // scope_column is one of two literals above, never caller input.
        let sql = format!(
            "SELECT * FROM device_events WHERE {scope_column} = $1 \
             AND ($2::timestamptz IS NULL OR time >= $2) \
             AND ($3::timestamptz IS NULL OR time <= $3) \
             AND ($4::text[] IS NULL OR event_type = ANY($4)) \
             AND ($5::text[] IS NULL OR severity = ANY($5)) \
             AND ($6::boolean IS NULL OR acknowledged = $6) \
             ORDER BY time DESC LIMIT $7"
        );

        let severities: Option<Vec<String>> = filter
            .severities
            .as_ref()
            .map(|s| s.iter().map(|sev| sev.as_str().to_string()).collect());

        let rows = sqlx::query(&sql)
            .bind(scope_id)
            .bind(filter.start)
            .bind(filter.end)
            .bind(&filter.event_types)
            .bind(&severities)
            .bind(filter.acknowledged)
            .bind(filter.limit.unwrap_or(100))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Events of severity error or critical within the trailing window,
    /// optionally narrowed to one device or site.
    pub async fn recent_errors(
        &self,
        window: Duration,
        device_id: Option<Uuid>,
        site_id: Option<Uuid>,
        limit: i64,
    ) -> anyhow::Result<Vec<DeviceEvent>> {
        let since = Utc::now() - window;
        let rows = sqlx::query(
            r"
            SELECT * FROM device_events
            WHERE time >= $1
              AND severity IN ('error', 'critical')
              AND ($2::uuid IS NULL OR device_id = $2)
              AND ($3::uuid IS NULL OR site_id = $3)
            ORDER BY time DESC
            LIMIT $4
            ",
        )
        .bind(since)
        .bind(device_id)
        .bind(site_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    // ── Acknowledgement ──

    /// Acknowledge one event. Idempotent: an already-acknowledged event is
    /// left as-is and the call reports false.
    pub async fn acknowledge(
        &self,
        time: DateTime<Utc>,
        device_id: Uuid,
        event_type: &str,
        acknowledged_by: Uuid,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_events
            SET acknowledged = true, acknowledged_at = now(), acknowledged_by = $4
            WHERE time = $1 AND device_id = $2 AND event_type = $3
              AND acknowledged_at IS NULL
            ",
        )
        .bind(time)
        .bind(device_id)
        .bind(event_type)
        .bind(acknowledged_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Acknowledge all of a device's outstanding events, optionally only
    /// certain types. Returns how many rows were transitioned.
    pub async fn acknowledge_device(
        &self,
        device_id: Uuid,
        event_types: Option<&[String]>,
        acknowledged_by: Uuid,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE device_events
            SET acknowledged = true, acknowledged_at = now(), acknowledged_by = $3
            WHERE device_id = $1
              AND ($2::text[] IS NULL OR event_type = ANY($2))
              AND acknowledged_at IS NULL
            ",
        )
        .bind(device_id)
        .bind(event_types)
        .bind(acknowledged_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn acknowledge_site(&self, site_id: Uuid, acknowledged_by: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE device_events
            SET acknowledged = true, acknowledged_at = now(), acknowledged_by = $2
            WHERE site_id = $1 AND acknowledged_at IS NULL
            ",
        )
        .bind(site_id)
        .bind(acknowledged_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Aggregates ──

    pub async fn counts(
        &self,
        site_id: Option<Uuid>,
        window: Duration,
    ) -> anyhow::Result<Vec<EventCount>> {
        let since = Utc::now() - window;
        let rows = sqlx::query(
            r"
            SELECT event_type, severity, COUNT(*) AS count
            FROM device_events
            WHERE time >= $1 AND ($2::uuid IS NULL OR site_id = $2)
            GROUP BY event_type, severity
            ORDER BY count DESC
            ",
        )
        .bind(since)
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let severity: String = row.get("severity");
                Ok(EventCount {
                    event_type: row.get("event_type"),
                    severity: severity.parse::<Severity>()?,
                    count: row.get("count"),
                })
            })
            .collect()
    }

    /// Hourly site timeline served from the `event_counts_hourly`
    /// continuous aggregate (eventually consistent with raw events).
    pub async fn hourly_timeline(
        &self,
        site_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TimelineBucket>> {
        let rows = sqlx::query(
            r"
            SELECT bucket, event_type, severity, event_count, unacknowledged_count
            FROM event_counts_hourly
            WHERE site_id = $1 AND bucket >= $2 AND bucket < $3
            ORDER BY bucket
            ",
        )
        .bind(site_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let severity: String = row.get("severity");
                Ok(TimelineBucket {
                    bucket: row.get("bucket"),
                    event_type: row.get("event_type"),
                    severity: severity.parse::<Severity>()?,
                    event_count: row.get("event_count"),
                    unacknowledged_count: row.get("unacknowledged_count"),
                })
            })
            .collect()
    }

    pub async fn top_error_devices(
        &self,
        site_id: Uuid,
        window: Duration,
        limit: i64,
    ) -> anyhow::Result<Vec<TopErrorDevice>> {
        let since = Utc::now() - window;
        let rows = sqlx::query(
            r"
            SELECT device_id, COUNT(*) AS error_count, MAX(time) AS last_error_at
            FROM device_events
            WHERE site_id = $1 AND time >= $2 AND severity IN ('error', 'critical')
            GROUP BY device_id
            ORDER BY error_count DESC
            LIMIT $3
            ",
        )
        .bind(site_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| TopErrorDevice {
                device_id: row.get("device_id"),
                error_count: row.get("error_count"),
                last_error_at: row.get("last_error_at"),
            })
            .collect())
    }

    pub async fn stats(&self, site_id: Option<Uuid>) -> anyhow::Result<EventStats> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE NOT acknowledged) AS unacknowledged,
                COUNT(*) FILTER (WHERE severity IN ('error', 'critical')
                    AND time >= now() - INTERVAL '24 hours') AS errors_24h,
                MIN(time) AS first_event_at,
                MAX(time) AS last_event_at
            FROM device_events
            WHERE $1::uuid IS NULL OR site_id = $1
            ",
        )
        .bind(site_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(EventStats {
            total_events: row.get("total"),
            unacknowledged: row.get("unacknowledged"),
            errors_last_24h: row.get("errors_24h"),
            first_event_at: row.get("first_event_at"),
            last_event_at: row.get("last_event_at"),
        })
    }

    // ── Cleanup ──

    /// Delete events older than the cutoff. With `keep_unacknowledged`,
    /// events that still need operator attention survive the purge.
    pub async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        keep_unacknowledged: bool,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM device_events
            WHERE time < $1 AND (NOT $2 OR acknowledged)
            ",
        )
        .bind(cutoff)
        .bind(keep_unacknowledged)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<DeviceEvent> {
    let severity: String = row.get("severity");
    Ok(DeviceEvent {
        time: row.get("time"),
        device_id: row.get("device_id"),
        event_type: row.get("event_type"),
        site_id: row.get("site_id"),
        event_code: row.get("event_code"),
        severity: severity.parse::<Severity>()?,
        message: row.get("message"),
        details: row.get("details"),
        acknowledged: row.get("acknowledged"),
        acknowledged_at: row.get("acknowledged_at"),
        acknowledged_by: row.get("acknowledged_by"),
    })
}
