mod common;

use chrono::{Duration, Utc};
use solarflux::models::event::{DeviceEvent, EventFilter, Severity};
use uuid::Uuid;

#[tokio::test]
async fn append_deduplicates_on_time_device_type() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let event = DeviceEvent::new(device.device_id, device.site_id, "alarm", Severity::Warning)
        .with_code("OVP")
        .with_message("over-voltage protection");
    assert!(plane.events.append(&event).await.unwrap());
    // Same (time, device, type) again: silently dropped.
    assert!(!plane.events.append(&event).await.unwrap());

    let listed = plane
        .events
        .list_for_device(device.device_id, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].event_code.as_deref(), Some("OVP"));
}

#[tokio::test]
async fn filters_narrow_by_severity_type_and_ack() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;
    let base = Utc::now() - Duration::minutes(30);

    let events = vec![
        DeviceEvent::new(device.device_id, device.site_id, "connect", Severity::Info).at(base),
        DeviceEvent::new(device.device_id, device.site_id, "fault", Severity::Error)
            .at(base + Duration::minutes(1)),
        DeviceEvent::new(device.device_id, device.site_id, "alarm", Severity::Critical)
            .at(base + Duration::minutes(2)),
    ];
    assert_eq!(plane.events.append_batch(&events).await.unwrap(), 3);

    let errors_only = plane
        .events
        .list_for_device(
            device.device_id,
            &EventFilter {
                severities: Some(vec![Severity::Error, Severity::Critical]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(errors_only.len(), 2);

    let faults = plane
        .events
        .list_for_site(
            device.site_id,
            &EventFilter {
                event_types: Some(vec!["fault".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(faults.len(), 1);

    let recent = plane
        .events
        .recent_errors(Duration::hours(1), Some(device.device_id), None, 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
}

#[tokio::test]
async fn acknowledge_is_set_if_null() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;
    let operator = Uuid::new_v4();
    let other_operator = Uuid::new_v4();

    let event = DeviceEvent::new(device.device_id, device.site_id, "fault", Severity::Error);
    plane.events.append(&event).await.unwrap();

    assert!(plane
        .events
        .acknowledge(event.time, device.device_id, "fault", operator)
        .await
        .unwrap());
    // Concurrent/repeat ack: no-op, attribution unchanged.
    assert!(!plane
        .events
        .acknowledge(event.time, device.device_id, "fault", other_operator)
        .await
        .unwrap());

    let listed = plane
        .events
        .list_for_device(device.device_id, &EventFilter::default())
        .await
        .unwrap();
    assert!(listed[0].acknowledged);
    assert_eq!(listed[0].acknowledged_by, Some(operator));
}

#[tokio::test]
async fn bulk_acknowledge_by_device_and_site() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;
    let operator = Uuid::new_v4();
    let base = Utc::now() - Duration::minutes(10);

    let events = vec![
        DeviceEvent::new(device.device_id, device.site_id, "fault", Severity::Error).at(base),
        DeviceEvent::new(device.device_id, device.site_id, "alarm", Severity::Warning)
            .at(base + Duration::minutes(1)),
        DeviceEvent::new(device.device_id, device.site_id, "status-change", Severity::Info)
            .at(base + Duration::minutes(2)),
    ];
    plane.events.append_batch(&events).await.unwrap();

    let acked = plane
        .events
        .acknowledge_device(device.device_id, Some(&["fault".to_string()]), operator)
        .await
        .unwrap();
    assert_eq!(acked, 1);

    let acked_rest = plane
        .events
        .acknowledge_site(device.site_id, operator)
        .await
        .unwrap();
    assert_eq!(acked_rest, 2);

    let stats = plane.events.stats(Some(device.site_id)).await.unwrap();
    assert_eq!(stats.total_events, 3);
    assert_eq!(stats.unacknowledged, 0);
}

#[tokio::test]
async fn stats_count_recent_errors_and_span() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;
    let now = Utc::now();

    let events = vec![
        DeviceEvent::new(device.device_id, device.site_id, "fault", Severity::Error)
            .at(now - Duration::hours(1)),
        DeviceEvent::new(device.device_id, device.site_id, "fault", Severity::Error)
            .at(now - Duration::days(3)),
        DeviceEvent::new(device.device_id, device.site_id, "connect", Severity::Info)
            .at(now - Duration::minutes(5)),
    ];
    plane.events.append_batch(&events).await.unwrap();

    let stats = plane.events.stats(Some(device.site_id)).await.unwrap();
    assert_eq!(stats.total_events, 3);
    assert_eq!(stats.errors_last_24h, 1);
    assert_eq!(stats.first_event_at, Some(events[1].time));
    assert_eq!(stats.last_event_at, Some(events[2].time));

    let counts = plane
        .events
        .counts(Some(device.site_id), Duration::days(7))
        .await
        .unwrap();
    let faults = counts.iter().find(|c| c.event_type == "fault").unwrap();
    assert_eq!(faults.count, 2);

    let top = plane
        .events
        .top_error_devices(device.site_id, Duration::days(7), 5)
        .await
        .unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].device_id, device.device_id);
    assert_eq!(top[0].error_count, 2);
}

#[tokio::test]
async fn purge_can_spare_unacknowledged_events() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;
    let operator = Uuid::new_v4();
    let old = Utc::now() - Duration::days(100);

    let acked = DeviceEvent::new(device.device_id, device.site_id, "fault", Severity::Error).at(old);
    let open =
        DeviceEvent::new(device.device_id, device.site_id, "alarm", Severity::Critical).at(old);
    plane.events.append_batch(&[acked.clone(), open]).await.unwrap();
    plane
        .events
        .acknowledge(acked.time, device.device_id, "fault", operator)
        .await
        .unwrap();

    // keep_unacknowledged: the open critical event survives.
    let deleted = plane
        .events
        .delete_older_than(Utc::now() - Duration::days(90), true)
        .await
        .unwrap();
    assert!(deleted >= 1);

    let remaining = plane
        .events
        .list_for_device(device.device_id, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].event_type, "alarm");

    // Without the flag everything old goes.
    plane
        .events
        .delete_older_than(Utc::now() - Duration::days(90), false)
        .await
        .unwrap();
    let remaining = plane
        .events
        .list_for_device(device.device_id, &EventFilter::default())
        .await
        .unwrap();
    assert!(remaining.is_empty());
}
