use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::catalog::MetricCatalog;
use crate::models::metric::MetricDefinition;
use crate::models::telemetry::{
    BatchRecord, BatchStatus, Bucket, BucketAggregate, IngestionStats, TelemetryBatch,
    TelemetryPoint,
};

/// Points stamped further than this into the future are rejected.
const MAX_FUTURE_SKEW_SECS: i64 = 60;
/// Tag keys longer than this are stripped.
const MAX_TAG_KEY_LEN: usize = 64;
/// At most this many tags survive per point.
const MAX_TAGS: usize = 16;
/// String values are truncated to the column width.
const MAX_VALUE_STR_LEN: usize = 255;

/// Validated, batched, idempotent writes of telemetry points, plus the
/// read side (latest/range/bucket queries) and retention deletes. Rollup
/// refresh is the store's job; this module only queries the aggregates.
pub struct TelemetryIngest {
    pool: PgPool,
    catalog: Arc<MetricCatalog>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOutcome {
    /// First-write effects only; idempotent replays don't count.
    pub records_inserted: u64,
    pub records_failed: u64,
}

/// Why a point was dropped instead of stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    FutureTimestamp,
}

/// Run one point through the validation pipeline, mutating it in place.
///
/// Degraded outcomes (out of bounds, unknown metric, malformed value
/// combination, non-finite floats) are kept with reduced quality; only a
/// future-dated timestamp rejects the point outright.
fn validate_point(
    point: &mut TelemetryPoint,
    definition: Option<&MetricDefinition>,
    now: DateTime<Utc>,
) -> Result<(), Rejection> {
    use crate::models::telemetry::DataQuality::*;

    if point.time > now + Duration::seconds(MAX_FUTURE_SKEW_SECS) {
        return Err(Rejection::FutureTimestamp);
    }

    // NaN and ±Inf carry no information; store the sample as missing.
    if let Some(v) = point.value {
        if !v.is_finite() {
            point.value = None;
            point.quality = Missing;
        }
    }

    match (&point.value, &point.value_str) {
        (Some(_), Some(_)) => point.quality = Bad,
        (None, None) => {
            if point.quality != Missing {
                point.quality = Bad;
            }
        }
        _ => {}
    }

    if point.quality == Good {
        match definition {
            Some(def) => {
                if let Some(v) = point.value {
                    if !def.in_bounds(v) {
                        point.quality = Uncertain;
                    }
                }
            }
            // Uncatalogued metric: accept, flagged.
            None => point.quality = Uncertain,
        }
    }

    if let Some(tags) = &mut point.tags {
        tags.retain(|key, _| key.len() <= MAX_TAG_KEY_LEN);
        while tags.len() > MAX_TAGS {
            match tags.keys().next_back().cloned() {
                Some(key) => {
                    tags.remove(&key);
                }
                None => break,
            }
        }
    }

    if let Some(s) = &mut point.value_str {
        if s.len() > MAX_VALUE_STR_LEN {
            let mut cut = MAX_VALUE_STR_LEN;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            s.truncate(cut);
        }
    }

    Ok(())
}

fn batch_status(outcome: &IngestOutcome) -> BatchStatus {
    match (outcome.records_inserted, outcome.records_failed) {
        (_, 0) => BatchStatus::Succeeded,
        (0, _) => BatchStatus::Failed,
        _ => BatchStatus::Partial,
    }
}

impl TelemetryIngest {
    pub fn new(pool: PgPool, catalog: Arc<MetricCatalog>) -> Self {
        Self { pool, catalog }
    }

    // ── Writes ──

    /// Validate and upsert a set of points without batch tracking.
    /// At-least-once delivery from the caller combines with the idempotent
    /// upsert to give exactly-once effects per logical point.
    pub async fn ingest_points(&self, points: &[TelemetryPoint]) -> anyhow::Result<IngestOutcome> {
        if points.is_empty() {
            return Ok(IngestOutcome::default());
        }
        let definitions = self.load_definitions(points).await?;
        let mut outcome = IngestOutcome::default();
        let now = Utc::now();

        for point in points {
            let mut point = point.clone();
            let definition = definitions.get(&point.metric_name);
            if validate_point(&mut point, definition, now).is_err() {
                outcome.records_failed += 1;
                continue;
            }
            match self.upsert_point(&point).await {
                Ok(first_write) => {
                    if first_write {
                        outcome.records_inserted += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "telemetry upsert failed for {}/{}: {e}",
                        point.device_id,
                        point.metric_name
                    );
                    outcome.records_failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Ingest a tracked batch. The `ingestion_batches` row is created
    /// before any point is written and finalized on every exit path, so a
    /// crash mid-batch still leaves an accounted-for record.
    pub async fn ingest_batch(&self, batch: &TelemetryBatch) -> anyhow::Result<BatchRecord> {
        let started = Instant::now();
        let device_count = batch
            .points
            .iter()
            .map(|p| p.device_id)
            .collect::<HashSet<_>>()
            .len() as i32;

        sqlx::query(
            r"
            INSERT INTO ingestion_batches
                (id, source_type, source_identifier, device_count, record_count, status)
            VALUES ($1, $2, $3, $4, $5, 'processing')
            ",
        )
        .bind(batch.batch_id)
        .bind(&batch.source_type)
        .bind(&batch.source_identifier)
        .bind(device_count)
        .bind(batch.points.len() as i32)
        .execute(&self.pool)
        .await?;

        // Point-level failures are counted, never propagated, so the batch
        // row always reaches a final status.
        let mut outcome = IngestOutcome::default();
        let mut errors: Vec<String> = Vec::new();
        match self.load_definitions(&batch.points).await {
            Ok(definitions) => {
                let now = Utc::now();
                for point in &batch.points {
                    let mut point = point.clone();
                    let definition = definitions.get(&point.metric_name);
                    if let Err(rejection) = validate_point(&mut point, definition, now) {
                        outcome.records_failed += 1;
                        if errors.len() < 10 {
                            errors.push(format!(
                                "{}/{}: rejected ({rejection:?})",
                                point.device_id, point.metric_name
                            ));
                        }
                        continue;
                    }
                    match self.upsert_point(&point).await {
                        Ok(true) => outcome.records_inserted += 1,
                        Ok(false) => {}
                        Err(e) => {
                            outcome.records_failed += 1;
                            if errors.len() < 10 {
                                errors.push(format!(
                                    "{}/{}: {e}",
                                    point.device_id, point.metric_name
                                ));
                            }
                        }
                    }
                }
            }
            Err(e) => {
                outcome.records_failed = batch.points.len() as u64;
                errors.push(format!("catalog load failed: {e}"));
            }
        }

        let status = batch_status(&outcome);
        let elapsed_ms = started.elapsed().as_millis() as i32;
        let errors_json = if errors.is_empty() {
            None
        } else {
            Some(serde_json::json!(errors))
        };

        let row = sqlx::query(
            r"
            UPDATE ingestion_batches SET
                records_inserted = $2,
                records_failed = $3,
                status = $4,
                completed_at = now(),
                processing_time_ms = $5,
                errors = $6
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(batch.batch_id)
        .bind(outcome.records_inserted as i32)
        .bind(outcome.records_failed as i32)
        .bind(status.as_str())
        .bind(elapsed_ms)
        .bind(errors_json)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            "batch {} finished: {} inserted, {} failed ({}ms)",
            batch.batch_id,
            outcome.records_inserted,
            outcome.records_failed,
            elapsed_ms
        );
        batch_record_from_row(&row)
    }

    /// Idempotent upsert keyed on (time, device_id, metric_name).
    /// Last writer wins on the value; quality never degrades good→bad.
    /// Returns true only for a first write (`xmax = 0`).
    async fn upsert_point(&self, point: &TelemetryPoint) -> anyhow::Result<bool> {
        let tags = point
            .tags
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()));
        let row = sqlx::query(
            r"
            INSERT INTO telemetry_raw
                (time, device_id, metric_name, site_id, metric_value, metric_value_str,
                 quality, unit, source, tags, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, COALESCE($11, now()))
            ON CONFLICT (time, device_id, metric_name) DO UPDATE SET
                metric_value = EXCLUDED.metric_value,
                metric_value_str = EXCLUDED.metric_value_str,
                quality = CASE
                    WHEN telemetry_raw.quality = 'good' AND EXCLUDED.quality = 'bad'
                    THEN telemetry_raw.quality
                    ELSE EXCLUDED.quality END,
                unit = EXCLUDED.unit,
                source = EXCLUDED.source,
                tags = EXCLUDED.tags,
                received_at = EXCLUDED.received_at
            RETURNING (xmax = 0) AS first_write
            ",
        )
        .bind(point.time)
        .bind(point.device_id)
        .bind(&point.metric_name)
        .bind(point.site_id)
        .bind(point.value)
        .bind(&point.value_str)
        .bind(point.quality.as_str())
        .bind(&point.unit)
        .bind(&point.source)
        .bind(tags)
        .bind(point.received_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("first_write"))
    }

    async fn load_definitions(
        &self,
        points: &[TelemetryPoint],
    ) -> anyhow::Result<HashMap<String, MetricDefinition>> {
        let names: Vec<String> = points
            .iter()
            .map(|p| p.metric_name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        self.catalog.load_for(&names).await
    }

    // ── Reads ──

    /// Latest stored sample per metric for a device.
    pub async fn get_latest(
        &self,
        device_id: Uuid,
        metric_names: Option<&[String]>,
    ) -> anyhow::Result<Vec<TelemetryPoint>> {
        let rows = sqlx::query(
            r"
            SELECT DISTINCT ON (metric_name) *
            FROM telemetry_raw
            WHERE device_id = $1 AND ($2::text[] IS NULL OR metric_name = ANY($2))
            ORDER BY metric_name, time DESC
            ",
        )
        .bind(device_id)
        .bind(metric_names)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(point_from_row).collect()
    }

    pub async fn get_device_range(
        &self,
        device_id: Uuid,
        metric_names: Option<&[String]>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<TelemetryPoint>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM telemetry_raw
            WHERE device_id = $1
              AND time >= $2 AND time < $3
              AND ($4::text[] IS NULL OR metric_name = ANY($4))
            ORDER BY time DESC
            LIMIT $5
            ",
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .bind(metric_names)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(point_from_row).collect()
    }

    pub async fn get_site_range(
        &self,
        site_id: Uuid,
        metric_names: Option<&[String]>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<TelemetryPoint>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM telemetry_raw
            WHERE site_id = $1
              AND time >= $2 AND time < $3
              AND ($4::text[] IS NULL OR metric_name = ANY($4))
            ORDER BY time DESC
            LIMIT $5
            ",
        )
        .bind(site_id)
        .bind(start)
        .bind(end)
        .bind(metric_names)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(point_from_row).collect()
    }

    /// Read materialized rollup buckets for one (device, metric) series.
    /// Buckets are eventually consistent with raw points per the refresh
    /// policy.
    pub async fn get_bucket_aggregates(
        &self,
        device_id: Uuid,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Bucket,
    ) -> anyhow::Result<Vec<BucketAggregate>> {
        // Table name comes from the Bucket enum, never caller input.
        let sql = format!(
            "SELECT * FROM {} \
             WHERE device_id = $1 AND metric_name = $2 AND bucket >= $3 AND bucket < $4 \
             ORDER BY bucket",
            bucket.table()
        );
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(metric_name)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(BucketAggregate {
                    bucket: row.get("bucket"),
                    device_id: row.get("device_id"),
                    site_id: row.get("site_id"),
                    metric_name: row.get("metric_name"),
                    avg_value: row.get("avg_value"),
                    min_value: row.get("min_value"),
                    max_value: row.get("max_value"),
                    first_value: row.get("first_value"),
                    last_value: row.get("last_value"),
                    sample_count: row.get("sample_count"),
                    quality_percent: row.get("quality_percent"),
                })
            })
            .collect()
    }

    // ── Maintenance ──

    /// Manual purge of raw points older than the cutoff, optionally for one
    /// device. The standing retention policy handles the steady state; this
    /// is the operator's immediate lever.
    pub async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        device_id: Option<Uuid>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM telemetry_raw WHERE time < $1 AND ($2::uuid IS NULL OR device_id = $2)",
        )
        .bind(cutoff)
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_processed(
        &self,
        device_id: Uuid,
        before: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE telemetry_raw SET processed = true WHERE device_id = $1 AND time < $2 AND NOT processed",
        )
        .bind(device_id)
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn ingestion_stats(&self, window: Duration) -> anyhow::Result<IngestionStats> {
        let since = Utc::now() - window;
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS batches,
                COALESCE(SUM(records_inserted), 0)::bigint AS records_inserted,
                COALESCE(SUM(records_failed), 0)::bigint AS records_failed,
                AVG(processing_time_ms)::float8 AS avg_processing_time_ms
            FROM ingestion_batches
            WHERE started_at >= $1
            ",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(IngestionStats {
            batches: row.get("batches"),
            records_inserted: row.get("records_inserted"),
            records_failed: row.get("records_failed"),
            avg_processing_time_ms: row.get("avg_processing_time_ms"),
        })
    }
}

fn point_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<TelemetryPoint> {
    let quality: String = row.get("quality");
    let tags: Option<serde_json::Value> = row.get("tags");
    Ok(TelemetryPoint {
        time: row.get("time"),
        device_id: row.get("device_id"),
        site_id: row.get("site_id"),
        metric_name: row.get("metric_name"),
        value: row.get("metric_value"),
        value_str: row.get("metric_value_str"),
        quality: quality.parse()?,
        unit: row.get("unit"),
        source: row.get("source"),
        tags: tags.and_then(|v| match v {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        }),
        received_at: row.get("received_at"),
    })
}

fn batch_record_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<BatchRecord> {
    let status: String = row.get("status");
    Ok(BatchRecord {
        id: row.get("id"),
        source_type: row.get("source_type"),
        source_identifier: row.get("source_identifier"),
        device_count: row.get("device_count"),
        record_count: row.get("record_count"),
        records_inserted: row.get("records_inserted"),
        records_failed: row.get("records_failed"),
        status: status.parse()?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        processing_time_ms: row.get("processing_time_ms"),
        errors: row.get("errors"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::telemetry::DataQuality;
    use serde_json::json;

    fn point(value: Option<f64>, value_str: Option<&str>) -> TelemetryPoint {
        TelemetryPoint {
            time: Utc::now(),
            device_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            metric_name: "battery_soc".to_string(),
            value,
            value_str: value_str.map(str::to_string),
            quality: DataQuality::Good,
            unit: None,
            source: None,
            tags: None,
            received_at: None,
        }
    }

    fn soc_definition() -> MetricDefinition {
        MetricDefinition::new("battery_soc", "Battery SOC", "%").with_bounds(0.0, 100.0)
    }

    #[test]
    fn future_points_are_rejected() {
        let mut p = point(Some(50.0), None);
        p.time = Utc::now() + Duration::seconds(120);
        let def = soc_definition();
        assert_eq!(
            validate_point(&mut p, Some(&def), Utc::now()),
            Err(Rejection::FutureTimestamp)
        );
    }

    #[test]
    fn small_skew_is_tolerated() {
        let mut p = point(Some(50.0), None);
        p.time = Utc::now() + Duration::seconds(30);
        let def = soc_definition();
        assert!(validate_point(&mut p, Some(&def), Utc::now()).is_ok());
        assert_eq!(p.quality, DataQuality::Good);
    }

    #[test]
    fn both_values_set_degrades_to_bad() {
        let mut p = point(Some(1.0), Some("one"));
        let def = soc_definition();
        validate_point(&mut p, Some(&def), Utc::now()).unwrap();
        assert_eq!(p.quality, DataQuality::Bad);
    }

    #[test]
    fn neither_value_set_degrades_to_bad() {
        let mut p = point(None, None);
        let def = soc_definition();
        validate_point(&mut p, Some(&def), Utc::now()).unwrap();
        assert_eq!(p.quality, DataQuality::Bad);
    }

    #[test]
    fn nan_and_inf_become_missing() {
        for v in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut p = point(Some(v), None);
            let def = soc_definition();
            validate_point(&mut p, Some(&def), Utc::now()).unwrap();
            assert_eq!(p.quality, DataQuality::Missing);
            assert!(p.value.is_none());
        }
    }

    #[test]
    fn out_of_bounds_is_kept_as_uncertain() {
        let mut p = point(Some(150.0), None);
        let def = soc_definition();
        validate_point(&mut p, Some(&def), Utc::now()).unwrap();
        assert_eq!(p.quality, DataQuality::Uncertain);
        assert_eq!(p.value, Some(150.0));
    }

    #[test]
    fn boundary_values_stay_good() {
        for v in [0.0, 100.0] {
            let mut p = point(Some(v), None);
            let def = soc_definition();
            validate_point(&mut p, Some(&def), Utc::now()).unwrap();
            assert_eq!(p.quality, DataQuality::Good);
        }
    }

    #[test]
    fn uncatalogued_metric_is_uncertain() {
        let mut p = point(Some(42.0), None);
        validate_point(&mut p, None, Utc::now()).unwrap();
        assert_eq!(p.quality, DataQuality::Uncertain);
    }

    #[test]
    fn oversized_tag_keys_are_stripped() {
        let mut p = point(Some(1.0), None);
        let mut tags = serde_json::Map::new();
        tags.insert("ok".to_string(), json!("v"));
        tags.insert("k".repeat(MAX_TAG_KEY_LEN + 1), json!("v"));
        p.tags = Some(tags);
        let def = soc_definition();
        validate_point(&mut p, Some(&def), Utc::now()).unwrap();
        let tags = p.tags.unwrap();
        assert_eq!(tags.len(), 1);
        assert!(tags.contains_key("ok"));
    }

    #[test]
    fn long_strings_are_truncated() {
        let mut p = point(None, Some(&"x".repeat(400)));
        p.metric_name = "status_text".to_string();
        validate_point(&mut p, None, Utc::now()).unwrap();
        assert_eq!(p.value_str.unwrap().len(), MAX_VALUE_STR_LEN);
    }

    #[test]
    fn batch_status_derivation() {
        let s = |inserted, failed| {
            batch_status(&IngestOutcome {
                records_inserted: inserted,
                records_failed: failed,
            })
        };
        assert_eq!(s(10, 0), BatchStatus::Succeeded);
        assert_eq!(s(0, 0), BatchStatus::Succeeded);
        assert_eq!(s(5, 5), BatchStatus::Partial);
        assert_eq!(s(0, 5), BatchStatus::Failed);
    }
}
