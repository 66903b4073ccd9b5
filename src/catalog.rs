use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::models::device::DeviceKind;
use crate::models::metric::{Aggregation, MetricDefinition, ValueKind};

/// Registry of known metrics: unit, value type, aggregation method,
/// cumulative flag and optional bounds. A point whose metric is not in the
/// catalog is still ingested, at reduced quality.
pub struct MetricCatalog {
    pool: PgPool,
}

/// The baseline metric set seeded at startup.
pub fn baseline_definitions() -> Vec<MetricDefinition> {
    use Aggregation::Last;
    use DeviceKind::*;

    vec![
        MetricDefinition::new("power_ac", "AC Power", "W").with_kinds(&[Inverter]),
        MetricDefinition::new("power_dc", "DC Power", "W").with_kinds(&[Inverter]),
        MetricDefinition::new("voltage_ac", "AC Voltage", "V").with_kinds(&[Inverter, Meter]),
        MetricDefinition::new("voltage_dc", "DC Voltage", "V").with_kinds(&[Inverter]),
        MetricDefinition::new("current_ac", "AC Current", "A").with_kinds(&[Inverter, Meter]),
        MetricDefinition::new("current_dc", "DC Current", "A").with_kinds(&[Inverter]),
        MetricDefinition::new("frequency", "Grid Frequency", "Hz").with_kinds(&[Inverter, Meter]),
        MetricDefinition::new("power_factor", "Power Factor", "")
            .with_kinds(&[Inverter, Meter])
            .with_bounds(-1.0, 1.0),
        MetricDefinition::new("energy_total", "Total Energy", "kWh")
            .with_kinds(&[Inverter, Meter])
            .with_aggregation(Last)
            .cumulative(),
        MetricDefinition::new("energy_today", "Today Energy", "kWh")
            .with_kinds(&[Inverter])
            .with_aggregation(Last),
        MetricDefinition::new("battery_soc", "Battery SOC", "%")
            .with_kinds(&[Inverter, Battery])
            .with_bounds(0.0, 100.0),
        MetricDefinition::new("battery_power", "Battery Power", "W").with_kinds(&[Inverter, Battery]),
        MetricDefinition::new("battery_voltage", "Battery Voltage", "V").with_kinds(&[Inverter, Battery]),
        MetricDefinition::new("battery_current", "Battery Current", "A").with_kinds(&[Inverter, Battery]),
        MetricDefinition::new("battery_temperature", "Battery Temperature", "°C")
            .with_kinds(&[Inverter, Battery]),
        MetricDefinition::new("grid_power", "Grid Power", "W").with_kinds(&[Inverter, Meter]),
        MetricDefinition::new("load_power", "Load Power", "W").with_kinds(&[Inverter, Meter]),
        MetricDefinition::new("pv_power", "PV Power", "W").with_kinds(&[Inverter]),
        MetricDefinition::new("temperature", "Temperature", "°C").with_kinds(&[Inverter, WeatherStation]),
        MetricDefinition::new("irradiance", "Irradiance", "W/m²").with_kinds(&[WeatherStation, Sensor]),
    ]
}

impl MetricCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the baseline set, leaving any operator-modified rows alone.
    pub async fn seed_defaults(&self) -> anyhow::Result<usize> {
        let mut seeded = 0;
        for def in baseline_definitions() {
            let result = sqlx::query(
                r"
                INSERT INTO metric_definitions
                    (metric_name, display_name, description, unit, data_type,
                     device_types, min_value, max_value, aggregation_method, is_cumulative)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (metric_name) DO NOTHING
                ",
            )
            .bind(&def.metric_name)
            .bind(&def.display_name)
            .bind(&def.description)
            .bind(&def.unit)
            .bind(def.value_kind.as_str())
            .bind(kind_strings(&def.device_kinds))
            .bind(def.min_value)
            .bind(def.max_value)
            .bind(def.aggregation.as_str())
            .bind(def.is_cumulative)
            .execute(&self.pool)
            .await?;
            seeded += result.rows_affected() as usize;
        }
        if seeded > 0 {
            tracing::info!("metric catalog: seeded {seeded} baseline definitions");
        }
        Ok(seeded)
    }

    pub async fn get(&self, metric_name: &str) -> anyhow::Result<Option<MetricDefinition>> {
        let row = sqlx::query(
            "SELECT * FROM metric_definitions WHERE metric_name = $1",
        )
        .bind(metric_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| definition_from_row(&r)).transpose()
    }

    pub async fn list_for_kind(&self, kind: DeviceKind) -> anyhow::Result<Vec<MetricDefinition>> {
        let rows = sqlx::query(
            "SELECT * FROM metric_definitions WHERE $1 = ANY(device_types) ORDER BY metric_name",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(definition_from_row).collect()
    }

    pub async fn upsert(&self, def: &MetricDefinition) -> anyhow::Result<()> {
        sqlx::query(
            r"
            INSERT INTO metric_definitions
                (metric_name, display_name, description, unit, data_type,
                 device_types, min_value, max_value, aggregation_method, is_cumulative)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (metric_name) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                description = EXCLUDED.description,
                unit = EXCLUDED.unit,
                data_type = EXCLUDED.data_type,
                device_types = EXCLUDED.device_types,
                min_value = EXCLUDED.min_value,
                max_value = EXCLUDED.max_value,
                aggregation_method = EXCLUDED.aggregation_method,
                is_cumulative = EXCLUDED.is_cumulative
            ",
        )
        .bind(&def.metric_name)
        .bind(&def.display_name)
        .bind(&def.description)
        .bind(&def.unit)
        .bind(def.value_kind.as_str())
        .bind(kind_strings(&def.device_kinds))
        .bind(def.min_value)
        .bind(def.max_value)
        .bind(def.aggregation.as_str())
        .bind(def.is_cumulative)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk-fetch definitions for a batch's distinct metric names, keyed by
    /// name. Missing metrics simply aren't in the map.
    pub async fn load_for(
        &self,
        metric_names: &[String],
    ) -> anyhow::Result<HashMap<String, MetricDefinition>> {
        if metric_names.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM metric_definitions WHERE metric_name = ANY($1)",
        )
        .bind(metric_names)
        .fetch_all(&self.pool)
        .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            let def = definition_from_row(row)?;
            map.insert(def.metric_name.clone(), def);
        }
        Ok(map)
    }
}

fn kind_strings(kinds: &[DeviceKind]) -> Vec<String> {
    kinds.iter().map(|k| k.as_str().to_string()).collect()
}

fn definition_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<MetricDefinition> {
    let value_kind: String = row.get("data_type");
    let aggregation: String = row.get("aggregation_method");
    let kinds: Vec<String> = row.get("device_types");
    Ok(MetricDefinition {
        metric_name: row.get("metric_name"),
        display_name: row.get("display_name"),
        description: row.get("description"),
        unit: row.get("unit"),
        value_kind: value_kind.parse::<ValueKind>()?,
        device_kinds: kinds
            .iter()
            .map(|k| k.parse::<DeviceKind>())
            .collect::<Result<_, _>>()?,
        min_value: row.get("min_value"),
        max_value: row.get("max_value"),
        aggregation: aggregation.parse::<Aggregation>()?,
        is_cumulative: row.get("is_cumulative"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_names_are_unique() {
        let defs = baseline_definitions();
        let mut names: Vec<&str> = defs.iter().map(|d| d.metric_name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), defs.len());
    }

    #[test]
    fn baseline_covers_core_inverter_metrics() {
        let defs = baseline_definitions();
        for expected in ["power_ac", "pv_power", "battery_soc", "energy_total", "irradiance"] {
            assert!(defs.iter().any(|d| d.metric_name == expected), "missing {expected}");
        }
    }

    #[test]
    fn soc_bounds_are_inclusive() {
        let defs = baseline_definitions();
        let soc = defs.iter().find(|d| d.metric_name == "battery_soc").unwrap();
        assert!(soc.in_bounds(0.0));
        assert!(soc.in_bounds(100.0));
        assert!(!soc.in_bounds(100.1));
        assert!(!soc.in_bounds(-0.1));
    }

    #[test]
    fn cumulative_energy_aggregates_by_last() {
        let defs = baseline_definitions();
        let total = defs.iter().find(|d| d.metric_name == "energy_total").unwrap();
        assert!(total.is_cumulative);
        assert_eq!(total.aggregation, Aggregation::Last);
    }
}
