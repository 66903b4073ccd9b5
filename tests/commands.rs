mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use solarflux::commands::executor;
use solarflux::models::command::{CommandResult, CommandSpec, CommandStatus};

#[tokio::test]
async fn created_command_starts_pending_with_defaults() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let cmd = plane
        .commands
        .create(
            &CommandSpec::new(device.device_id, device.site_id, "set_power_mode")
                .with_params(serde_json::json!({"mode": "self_consumption"})),
        )
        .await
        .unwrap();
    assert_eq!(cmd.status, CommandStatus::Pending);
    assert_eq!(cmd.priority, 5);
    assert_eq!(cmd.max_retries, 3);
    assert_eq!(cmd.retry_count, 0);

    let immediate = plane
        .commands
        .create_immediate(&CommandSpec::new(device.device_id, device.site_id, "ping"))
        .await
        .unwrap();
    assert_eq!(immediate.priority, 1);
    assert!(immediate.expires_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_have_exactly_one_winner() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    plane
        .commands
        .create(&CommandSpec::new(device.device_id, device.site_id, "solo"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..64 {
        let commands = plane.commands.clone();
        let device_id = device.device_id;
        handles.push(tokio::spawn(async move {
            commands.claim(device_id).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_workers_split_the_queue_by_priority() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let urgent = plane
        .commands
        .create(
            &CommandSpec::new(device.device_id, device.site_id, "step").with_priority(1),
        )
        .await
        .unwrap();
    let routine = plane
        .commands
        .create(
            &CommandSpec::new(device.device_id, device.site_id, "step").with_priority(5),
        )
        .await
        .unwrap();

    let a = {
        let commands = plane.commands.clone();
        let id = device.device_id;
        tokio::spawn(async move { commands.claim(id).await.unwrap() })
    };
    let b = {
        let commands = plane.commands.clone();
        let id = device.device_id;
        tokio::spawn(async move { commands.claim(id).await.unwrap() })
    };

    let claimed: Vec<_> = [a.await.unwrap(), b.await.unwrap()]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(claimed.len(), 2);
    let mut ids: Vec<_> = claimed.iter().map(|c| c.id).collect();
    ids.sort();
    let mut expected = vec![urgent.id, routine.id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn executor_completes_the_command() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    plane.commands.register_executor(
        "set_power_mode",
        executor(|cmd| async move {
            Ok(CommandResult::ok(
                cmd.id,
                cmd.device_id,
                Some(serde_json::json!({"applied": true})),
            ))
        }),
    );

    let created = plane
        .commands
        .create(
            &CommandSpec::new(device.device_id, device.site_id, "set_power_mode")
                .with_params(serde_json::json!({"mode": "self_consumption"})),
        )
        .await
        .unwrap();

    let result = plane
        .commands
        .claim_and_execute(device.device_id)
        .await
        .unwrap()
        .expect("a command was claimable");
    assert!(result.success);

    let finished = plane.commands.get(created.id).await.unwrap().unwrap();
    assert_eq!(finished.status, CommandStatus::Completed);
    assert_eq!(finished.result, Some(serde_json::json!({"applied": true})));
    assert!(finished.completed_at.is_some());
}

#[tokio::test]
async fn missing_executor_fails_with_stable_code() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let created = plane
        .commands
        .create(&CommandSpec::new(
            device.device_id,
            device.site_id,
            "unregistered_command",
        ))
        .await
        .unwrap();

    let result = plane
        .commands
        .claim_and_execute(device.device_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("NO_EXECUTOR"));

    let failed = plane.commands.get(created.id).await.unwrap().unwrap();
    assert_eq!(failed.status, CommandStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("NO_EXECUTOR"));
}

#[tokio::test]
async fn executor_panic_free_error_is_recorded_as_exception() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    plane.commands.register_executor(
        "flaky",
        executor(|_cmd| async move { anyhow::bail!("device rejected the write") }),
    );

    let created = plane
        .commands
        .create(&CommandSpec::new(device.device_id, device.site_id, "flaky"))
        .await
        .unwrap();
    let result = plane
        .commands
        .claim_and_execute(device.device_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("EXCEPTION"));

    let failed = plane.commands.get(created.id).await.unwrap().unwrap();
    assert_eq!(failed.status, CommandStatus::Failed);
    assert!(failed.error_message.unwrap().contains("rejected"));
}

#[tokio::test]
async fn retry_restarts_a_failed_command_until_budget_runs_out() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    plane.commands.register_executor(
        "always_fails",
        executor(move |cmd| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(CommandResult::err(cmd.id, cmd.device_id, "DEVICE_ERROR", "nope"))
            }
        }),
    );

    let created = plane
        .commands
        .create(&CommandSpec::new(device.device_id, device.site_id, "always_fails"))
        .await
        .unwrap();

    // First run fails; three retries are allowed, then the budget is gone.
    for expected_retry in 1..=3 {
        plane.commands.claim_and_execute(device.device_id).await.unwrap().unwrap();
        let retried = plane.commands.retry(created.id).await.unwrap().unwrap();
        assert_eq!(retried.status, CommandStatus::Pending);
        assert_eq!(retried.retry_count, expected_retry);
        assert!(retried.completed_at.is_none());
        assert!(retried.error_code.is_none());
    }
    plane.commands.claim_and_execute(device.device_id).await.unwrap().unwrap();
    assert!(plane.commands.retry(created.id).await.unwrap().is_none());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let terminal = plane.commands.get(created.id).await.unwrap().unwrap();
    assert_eq!(terminal.status, CommandStatus::Failed);
}

#[tokio::test]
async fn cancel_works_only_before_a_terminal_state() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let cmd = plane
        .commands
        .create(&CommandSpec::new(device.device_id, device.site_id, "noop"))
        .await
        .unwrap();
    assert!(plane.commands.cancel(cmd.id).await.unwrap());
    // Terminal now; a second cancel transitions nothing.
    assert!(!plane.commands.cancel(cmd.id).await.unwrap());

    let cancelled = plane.commands.get(cmd.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, CommandStatus::Cancelled);

    // And a cancelled command can't be claimed.
    assert!(plane.commands.claim(device.device_id).await.unwrap().is_none());
}

#[tokio::test]
async fn expiry_sweep_catches_past_due_commands() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let cmd = plane
        .commands
        .create(&CommandSpec::new(device.device_id, device.site_id, "slow").expires_in(0))
        .await
        .unwrap();

    // expires_in(0) puts expires_at at "now"; the sweep sees it past due.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let expired = plane.commands.expire_commands().await.unwrap();
    assert!(expired >= 1);

    let row = plane.commands.get(cmd.id).await.unwrap().unwrap();
    assert_eq!(row.status, CommandStatus::Expired);
    assert_eq!(row.error_code.as_deref(), Some("EXPIRED"));

    // Expired commands are not claimable.
    assert!(plane.commands.claim(device.device_id).await.unwrap().is_none());
}

#[tokio::test]
async fn device_reported_result_completes_the_command() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    let cmd = plane
        .commands
        .create(&CommandSpec::new(device.device_id, device.site_id, "async_write"))
        .await
        .unwrap();
    plane.commands.claim(device.device_id).await.unwrap().unwrap();

    let transitioned = plane
        .commands
        .report_result(cmd.id, true, Some(serde_json::json!({"value": 100})), None)
        .await
        .unwrap();
    assert!(transitioned);

    let done = plane.commands.get(cmd.id).await.unwrap().unwrap();
    assert_eq!(done.status, CommandStatus::Completed);
    assert_eq!(done.result, Some(serde_json::json!({"value": 100})));
}

#[tokio::test]
async fn scheduled_commands_wait_their_turn() {
    let Some(plane) = common::test_plane().await else {
        return;
    };
    let device = common::seed_device(&plane).await;

    plane
        .commands
        .create(
            &CommandSpec::new(device.device_id, device.site_id, "later")
                .scheduled(chrono::Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    assert!(plane.commands.claim(device.device_id).await.unwrap().is_none());
    let queue = plane.commands.get_device_queue(device.device_id).await.unwrap();
    assert_eq!(queue.len(), 1);
}
