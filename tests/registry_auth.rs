mod common;

use solarflux::models::device::{ConnectionStatus, ControlPlaneDevice, DeviceKind};
use uuid::Uuid;

#[tokio::test]
async fn synced_device_appears_with_defaults() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let fetched = plane
        .registry
        .get_by_id(device.device_id)
        .await
        .unwrap()
        .expect("device exists after sync");
    assert_eq!(fetched.connection_status, ConnectionStatus::Unknown);
    assert_eq!(fetched.polling_interval_seconds, 60);
    assert!(fetched.synced_at.is_some());
}

#[tokio::test]
async fn sync_is_an_upsert_keyed_on_device_id() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let resynced = ControlPlaneDevice {
        id: device.device_id,
        site_id: device.site_id,
        organization_id: device.organization_id,
        device_type: DeviceKind::Inverter,
        serial_number: device.serial_number.clone(),
        protocol: None,
        connection_config: None,
        metadata: None,
        polling_interval_seconds: Some(30),
    };
    let updated = plane
        .registry
        .sync_from_control_plane(&resynced)
        .await
        .unwrap();
    assert_eq!(updated.device_id, device.device_id);
    assert_eq!(updated.polling_interval_seconds, 30);

    // Still exactly one row for this serial.
    let by_serial = plane
        .registry
        .get_by_serial(&device.serial_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_serial.device_id, device.device_id);
}

#[tokio::test]
async fn token_round_trip_authenticates_by_serial() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let token = plane
        .auth
        .generate_token(device.device_id, None)
        .await
        .unwrap();

    let result = plane
        .auth
        .authenticate_by_serial(&device.serial_number, &token)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.device.unwrap().device_id, device.device_id);
}

#[tokio::test]
async fn stored_token_is_never_the_plaintext() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let token = plane
        .auth
        .generate_token(device.device_id, None)
        .await
        .unwrap();
    let stored = plane
        .registry
        .get_by_id(device.device_id)
        .await
        .unwrap()
        .unwrap();
    let hash = stored.auth_token_hash.expect("hash stored");
    assert_ne!(hash, token);
    assert!(plane
        .registry
        .validate_token(device.device_id, &token)
        .await
        .unwrap());
    assert!(!plane
        .registry
        .validate_token(device.device_id, &hash)
        .await
        .unwrap());
}

#[tokio::test]
async fn lockout_refuses_even_correct_credentials() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;
    let token = plane
        .auth
        .generate_token(device.device_id, None)
        .await
        .unwrap();

    for i in 0..6 {
        let result = plane
            .auth
            .authenticate_by_serial(&device.serial_number, "bad")
            .await
            .unwrap();
        assert!(!result.success);
        if i >= 5 {
            assert_eq!(result.error_code.as_deref(), Some("LOCKED_OUT"));
        }
    }

    // 7th attempt, with the real token, is still refused.
    let result = plane
        .auth
        .authenticate_by_serial(&device.serial_number, &token)
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("LOCKED_OUT"));
    assert!(result.unlocks_at.is_some());
}

#[tokio::test]
async fn revoked_token_stops_validating() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;
    let token = plane
        .auth
        .generate_token(device.device_id, None)
        .await
        .unwrap();
    assert!(plane.auth.is_token_valid(device.device_id, &token).await.unwrap());

    plane.auth.revoke_token(device.device_id).await.unwrap();
    assert!(!plane.auth.is_token_valid(device.device_id, &token).await.unwrap());

    let status = plane.auth.get_token_status(device.device_id).await.unwrap();
    assert!(status.device_found);
    assert!(!status.has_token);
}

#[tokio::test]
async fn connection_transitions_are_timestamped_and_idempotent() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    plane
        .registry
        .update_connection_status(device.device_id, ConnectionStatus::Connected)
        .await
        .unwrap();
    let d1 = plane.registry.get_by_id(device.device_id).await.unwrap().unwrap();
    assert_eq!(d1.connection_status, ConnectionStatus::Connected);
    assert!(d1.last_connected_at.is_some());
    assert_eq!(d1.reconnect_count, 1);

    // Repeating the transition doesn't double-count the reconnect.
    plane
        .registry
        .update_connection_status(device.device_id, ConnectionStatus::Connected)
        .await
        .unwrap();
    let d2 = plane.registry.get_by_id(device.device_id).await.unwrap().unwrap();
    assert_eq!(d2.reconnect_count, 1);

    plane
        .registry
        .update_connection_status(device.device_id, ConnectionStatus::Disconnected)
        .await
        .unwrap();
    let d3 = plane.registry.get_by_id(device.device_id).await.unwrap().unwrap();
    assert!(d3.last_disconnected_at.is_some());
}

#[tokio::test]
async fn polling_due_list_and_reschedule() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    // Freshly synced devices have no next_poll_at and are due immediately.
    let due = plane.registry.list_due_for_polling(1000).await.unwrap();
    assert!(due.iter().any(|d| d.device_id == device.device_id));

    plane.registry.mark_polled(device.device_id).await.unwrap();
    let polled = plane.registry.get_by_id(device.device_id).await.unwrap().unwrap();
    let last = polled.last_polled_at.expect("last poll set");
    let next = polled.next_poll_at.expect("next poll set");
    assert!(next > last);
    assert_eq!((next - last).num_seconds(), 60);

    let due = plane.registry.list_due_for_polling(1000).await.unwrap();
    assert!(!due.iter().any(|d| d.device_id == device.device_id));
}

#[tokio::test]
async fn partial_update_leaves_other_fields_alone() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let updated = plane
        .registry
        .update(
            device.device_id,
            &solarflux::models::device::DeviceUpdate {
                polling_interval_seconds: Some(120),
                connection_config: Some(serde_json::json!({"host": "broker.local"})),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .expect("device exists");
    assert_eq!(updated.polling_interval_seconds, 120);
    assert_eq!(updated.serial_number, device.serial_number);
    assert_eq!(updated.site_id, device.site_id);
    assert!(updated.updated_at.is_some());

    // Unknown device: no row, no error.
    let missing = plane
        .registry
        .update(Uuid::new_v4(), &Default::default())
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn catalog_lookup_and_upsert() {
    let Some(plane) = common::test_plane().await else {
        return;
    };

    let soc = plane
        .catalog
        .get("battery_soc")
        .await
        .unwrap()
        .expect("seeded metric");
    assert_eq!(soc.unit, "%");
    assert_eq!(soc.min_value, Some(0.0));
    assert_eq!(soc.max_value, Some(100.0));

    let for_batteries = plane
        .catalog
        .list_for_kind(DeviceKind::Battery)
        .await
        .unwrap();
    assert!(for_batteries.iter().any(|d| d.metric_name == "battery_soc"));
    assert!(!for_batteries.iter().any(|d| d.metric_name == "irradiance"));

    let mut custom = solarflux::models::metric::MetricDefinition::new(
        "string_inverter_fault_text",
        "Fault Text",
        "",
    );
    custom.value_kind = solarflux::models::metric::ValueKind::String;
    plane.catalog.upsert(&custom).await.unwrap();
    let stored = plane
        .catalog
        .get("string_inverter_fault_text")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.value_kind, solarflux::models::metric::ValueKind::String);
}

#[tokio::test]
async fn decommission_is_logical_and_hides_from_listings() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    assert!(plane.registry.decommission(device.device_id).await.unwrap());
    // Second decommission is a no-op.
    assert!(!plane.registry.decommission(device.device_id).await.unwrap());

    // Row still exists for telemetry references...
    let row = plane.registry.get_by_id(device.device_id).await.unwrap();
    assert!(row.is_some());
    // ...but is gone from site listings.
    let listed = plane.registry.list_by_site(device.site_id).await.unwrap();
    assert!(!listed.iter().any(|d| d.device_id == device.device_id));
}

#[tokio::test]
async fn sessions_follow_connect_and_disconnect() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let session = plane
        .sessions
        .handle_connect(device.device_id, Some("10.0.0.7:5123".to_string()))
        .await
        .unwrap()
        .expect("session for known device");
    assert_eq!(session.device_id, device.device_id);
    assert!(plane.sessions.active_session(device.device_id).is_some());
    assert!(plane.sessions.touch(device.device_id));

    plane.sessions.handle_disconnect(device.device_id).await.unwrap();
    assert!(plane.sessions.active_session(device.device_id).is_none());
    assert!(!plane.sessions.touch(device.device_id));

    // Unknown devices get no session.
    let none = plane
        .sessions
        .handle_connect(Uuid::new_v4(), None)
        .await
        .unwrap();
    assert!(none.is_none());
}
