use uuid::Uuid;

use solarflux::TelemetryPlane;
use solarflux::config::SolarfluxConfig;
use solarflux::models::device::{ControlPlaneDevice, Device, DeviceKind};

/// Connect to the store named by TEST_DATABASE_URL, applying schema and
/// policies. Tests that need a store skip quietly when it isn't set.
pub async fn test_plane() -> Option<TelemetryPlane> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping store-backed test");
        return None;
    };
    let mut config = SolarfluxConfig::default();
    config.database.url = url;
    config.database.max_connections = 20;
    Some(
        TelemetryPlane::connect(&config)
            .await
            .expect("connect to test store"),
    )
}

/// Seed a fresh inverter through the control-plane sync path. Random ids
/// keep tests independent of each other and of leftover rows.
pub async fn seed_device(plane: &TelemetryPlane) -> Device {
    let dev = ControlPlaneDevice {
        id: Uuid::new_v4(),
        site_id: Uuid::new_v4(),
        organization_id: Uuid::new_v4(),
        device_type: DeviceKind::Inverter,
        serial_number: format!("SN-{}", &Uuid::new_v4().simple().to_string()[..10]),
        protocol: None,
        connection_config: None,
        metadata: None,
        polling_interval_seconds: None,
    };
    plane
        .registry
        .sync_from_control_plane(&dev)
        .await
        .expect("sync device")
}
