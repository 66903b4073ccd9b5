use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::events::EventJournal;
use crate::models::command::{
    CommandResult, CommandSpec, CommandStats, CommandStatus, DeviceCommand,
};
use crate::models::event::{DeviceEvent, Severity};

pub type ExecutorFuture = Pin<Box<dyn Future<Output = anyhow::Result<CommandResult>> + Send>>;
/// An async executor for one command-type slug.
pub type Executor = Arc<dyn Fn(DeviceCommand) -> ExecutorFuture + Send + Sync>;

/// Wrap an async fn/closure as a registrable executor.
pub fn executor<F, Fut>(f: F) -> Executor
where
    F: Fn(DeviceCommand) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<CommandResult>> + Send + 'static,
{
    Arc::new(move |cmd| {
        let fut: ExecutorFuture = Box::pin(f(cmd));
        fut
    })
}

/// Persistent, priority-ordered command queue with a claim/execute/ack/
/// retry/expire lifecycle. The claim is a single atomic statement, so each
/// pending command has at most one consumer; per device, claim→execute is
/// thereby serialized.
pub struct CommandDispatcher {
    pool: PgPool,
    executors: RwLock<HashMap<String, Executor>>,
    events: Option<Arc<EventJournal>>,
    default_execute_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(pool: PgPool, events: Option<Arc<EventJournal>>) -> Self {
        Self {
            pool,
            executors: RwLock::new(HashMap::new()),
            events,
            default_execute_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.default_execute_timeout = timeout;
        self
    }

    // ── Executor registry ──

    pub fn register_executor(&self, command_type: impl Into<String>, executor: Executor) {
        let command_type = command_type.into();
        tracing::debug!("registered executor for '{command_type}'");
        self.executors
            .write()
            .unwrap()
            .insert(command_type, executor);
    }

    pub fn has_executor(&self, command_type: &str) -> bool {
        self.executors.read().unwrap().contains_key(command_type)
    }

    // ── Creation ──

    pub async fn create(&self, spec: &CommandSpec) -> anyhow::Result<DeviceCommand> {
        let expires_at = spec
            .expires_in_minutes
            .map(|m| Utc::now() + chrono::Duration::minutes(m));
        let row = sqlx::query(
            r"
            INSERT INTO device_commands
                (id, device_id, site_id, command_type, command_params, status,
                 priority, created_by, scheduled_at, expires_at, max_retries)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9, $10)
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(spec.device_id)
        .bind(spec.site_id)
        .bind(&spec.command_type)
        .bind(&spec.command_params)
        .bind(spec.priority)
        .bind(spec.created_by)
        .bind(spec.scheduled_at)
        .bind(expires_at)
        .bind(spec.max_retries)
        .fetch_one(&self.pool)
        .await?;
        command_from_row(&row)
    }

    /// Create at the most urgent priority, expiring quickly — for operator
    /// actions that are pointless if stale.
    pub async fn create_immediate(&self, spec: &CommandSpec) -> anyhow::Result<DeviceCommand> {
        let mut spec = spec.clone();
        spec.priority = 1;
        if spec.expires_in_minutes.is_none() {
            spec.expires_in_minutes = Some(5);
        }
        self.create(&spec).await
    }

    // ── Lookup ──

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<DeviceCommand>> {
        let row = sqlx::query("SELECT * FROM device_commands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| command_from_row(&r)).transpose()
    }

    /// Open (non-terminal) commands for a device in claim order.
    pub async fn get_device_queue(&self, device_id: Uuid) -> anyhow::Result<Vec<DeviceCommand>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM device_commands
            WHERE device_id = $1
              AND status IN ('pending', 'claimed', 'sent', 'acknowledged')
            ORDER BY priority ASC, created_at ASC
            ",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    pub async fn get_site_commands(
        &self,
        site_id: Uuid,
        limit: i64,
    ) -> anyhow::Result<Vec<DeviceCommand>> {
        let rows = sqlx::query(
            "SELECT * FROM device_commands WHERE site_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(site_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    pub async fn get_pending(&self, limit: i64) -> anyhow::Result<Vec<DeviceCommand>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM device_commands
            WHERE status = 'pending'
            ORDER BY priority ASC, created_at ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    /// Terminal commands for a device within the trailing window.
    pub async fn get_history(
        &self,
        device_id: Uuid,
        days: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<DeviceCommand>> {
        let since = Utc::now() - chrono::Duration::days(days);
        let rows = sqlx::query(
            r"
            SELECT * FROM device_commands
            WHERE device_id = $1
              AND status IN ('completed', 'failed', 'cancelled', 'expired')
              AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT $3
            ",
        )
        .bind(device_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    // ── Claim / lifecycle ──

    /// Atomically claim the most urgent eligible pending command for a
    /// device. `FOR UPDATE SKIP LOCKED` guarantees exactly one claimer even
    /// under concurrent workers; losers get None.
    pub async fn claim(&self, device_id: Uuid) -> anyhow::Result<Option<DeviceCommand>> {
        let row = sqlx::query(
            r"
            UPDATE device_commands SET status = 'claimed'
            WHERE id = (
                SELECT id FROM device_commands
                WHERE device_id = $1
                  AND status = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= now())
                  AND (expires_at IS NULL OR expires_at > now())
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            ",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| command_from_row(&r)).transpose()
    }

    pub async fn mark_sent(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE device_commands SET status = 'sent', sent_at = now() WHERE id = $1 AND status = 'claimed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_acknowledged(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_commands SET status = 'acknowledged', acknowledged_at = now()
            WHERE id = $1 AND status IN ('claimed', 'sent')
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_completed(
        &self,
        id: Uuid,
        result_data: Option<serde_json::Value>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_commands
            SET status = 'completed', completed_at = now(), result = $2,
                error_code = NULL, error_message = NULL
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled', 'expired')
            ",
        )
        .bind(id)
        .bind(result_data)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_commands
            SET status = 'failed', completed_at = now(), error_code = $2, error_message = $3
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled', 'expired')
            ",
        )
        .bind(id)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel a command that hasn't finished. Only pending/claimed/sent/
    /// acknowledged commands can be cancelled; the bool says whether a row
    /// actually transitioned.
    pub async fn cancel(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE device_commands
            SET status = 'cancelled', completed_at = now(), error_code = 'CANCELLED'
            WHERE id = $1 AND status IN ('pending', 'claimed', 'sent', 'acknowledged')
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel_device_commands(&self, device_id: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE device_commands
            SET status = 'cancelled', completed_at = now(), error_code = 'CANCELLED'
            WHERE device_id = $1 AND status IN ('pending', 'claimed', 'sent', 'acknowledged')
            ",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reset one failed command to pending for another attempt. Timestamps
    /// from the failed run are cleared; retry_count advances.
    pub async fn retry(&self, id: Uuid) -> anyhow::Result<Option<DeviceCommand>> {
        let row = sqlx::query(
            r"
            UPDATE device_commands
            SET status = 'pending', retry_count = retry_count + 1,
                sent_at = NULL, acknowledged_at = NULL, completed_at = NULL,
                result = NULL, error_code = NULL, error_message = NULL
            WHERE id = $1 AND status = 'failed' AND retry_count < max_retries
            RETURNING *
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| command_from_row(&r)).transpose()
    }

    /// Batch-retry every failed command that still has attempts left.
    pub async fn retry_failed(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE device_commands
            SET status = 'pending', retry_count = retry_count + 1,
                sent_at = NULL, acknowledged_at = NULL, completed_at = NULL,
                result = NULL, error_code = NULL, error_message = NULL
            WHERE status = 'failed' AND retry_count < max_retries
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Transition past-due non-terminal commands to expired. Run from the
    /// background sweep.
    pub async fn expire_commands(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE device_commands
            SET status = 'expired', completed_at = now(), error_code = 'EXPIRED'
            WHERE status IN ('pending', 'claimed', 'sent', 'acknowledged')
              AND expires_at IS NOT NULL AND expires_at <= now()
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete terminal commands older than the cutoff.
    pub async fn cleanup_old(&self, days: i64) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let result = sqlx::query(
            r"
            DELETE FROM device_commands
            WHERE status IN ('completed', 'failed', 'cancelled', 'expired')
              AND created_at < $1
            ",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Execution ──

    /// Claim the next eligible command for a device and run it. None means
    /// nothing was claimable.
    pub async fn claim_and_execute(&self, device_id: Uuid) -> anyhow::Result<Option<CommandResult>> {
        match self.claim(device_id).await? {
            Some(cmd) => Ok(Some(self.execute(cmd).await?)),
            None => Ok(None),
        }
    }

    /// Run a claimed command through its registered executor and persist
    /// the outcome. The executor call is wrapped in a deadline honoring
    /// `expires_at`; a missing executor is a permanent failure.
    pub async fn execute(&self, cmd: DeviceCommand) -> anyhow::Result<CommandResult> {
        let executor = self
            .executors
            .read()
            .unwrap()
            .get(&cmd.command_type)
            .cloned();

        let Some(executor) = executor else {
            let message = format!("no executor registered for '{}'", cmd.command_type);
            self.mark_failed(cmd.id, "NO_EXECUTOR", &message).await?;
            self.journal_outcome(&cmd, false, "NO_EXECUTOR").await;
            return Ok(CommandResult::err(cmd.id, cmd.device_id, "NO_EXECUTOR", message));
        };

        let deadline = match cmd.expires_at {
            Some(expires_at) => {
                let remaining = expires_at - Utc::now();
                match remaining.to_std() {
                    Ok(d) => d.min(self.default_execute_timeout),
                    Err(_) => {
                        // Already past expiry; don't waste an executor run.
                        sqlx::query(
                            r"
                            UPDATE device_commands
                            SET status = 'expired', completed_at = now(), error_code = 'EXPIRED'
                            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled', 'expired')
                            ",
                        )
                        .bind(cmd.id)
                        .execute(&self.pool)
                        .await?;
                        return Ok(CommandResult::err(
                            cmd.id,
                            cmd.device_id,
                            "EXPIRED",
                            "command expired before execution",
                        ));
                    }
                }
            }
            None => self.default_execute_timeout,
        };

        let result = match tokio::time::timeout(deadline, executor(cmd.clone())).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => CommandResult::err(cmd.id, cmd.device_id, "EXCEPTION", e.to_string()),
            Err(_) => CommandResult::err(
                cmd.id,
                cmd.device_id,
                "TIMEOUT",
                format!("executor exceeded {}s", deadline.as_secs()),
            ),
        };

        if result.success {
            self.mark_completed(cmd.id, result.data.clone()).await?;
            self.journal_outcome(&cmd, true, "").await;
        } else {
            let code = result.error_code.as_deref().unwrap_or("EXCEPTION");
            let message = result.error_message.as_deref().unwrap_or("command failed");
            self.mark_failed(cmd.id, code, message).await?;
            self.journal_outcome(&cmd, false, code).await;
        }
        Ok(result)
    }

    /// Device-initiated completion path, used when the device answers
    /// asynchronously instead of via the executor return.
    pub async fn report_result(
        &self,
        command_id: Uuid,
        success: bool,
        data: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> anyhow::Result<bool> {
        let Some(cmd) = self.get(command_id).await? else {
            return Ok(false);
        };
        let transitioned = if success {
            self.mark_completed(command_id, data).await?
        } else {
            self.mark_failed(
                command_id,
                "EXCEPTION",
                error_message.as_deref().unwrap_or("device reported failure"),
            )
            .await?
        };
        if transitioned {
            self.journal_outcome(&cmd, success, if success { "" } else { "EXCEPTION" })
                .await;
        }
        Ok(transitioned)
    }

    // ── Reporting ──

    pub async fn stats(&self) -> anyhow::Result<CommandStats> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM device_commands
            ",
        )
        .fetch_one(&self.pool)
        .await?;
        let completed: i64 = row.get("completed");
        let failed: i64 = row.get("failed");
        let finished = completed + failed;
        Ok(CommandStats {
            total: row.get("total"),
            pending: row.get("pending"),
            completed,
            failed,
            success_rate: if finished > 0 {
                completed as f64 / finished as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    pub async fn pending_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM device_commands WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    async fn journal_outcome(&self, cmd: &DeviceCommand, success: bool, code: &str) {
        let Some(events) = &self.events else {
            return;
        };
        let (event_type, severity, message) = if success {
            (
                "command_completed",
                Severity::Info,
                format!("command '{}' completed", cmd.command_type),
            )
        } else {
            (
                "command_failed",
                Severity::Warning,
                format!("command '{}' failed ({code})", cmd.command_type),
            )
        };
        let event = DeviceEvent::new(cmd.device_id, cmd.site_id, event_type, severity)
            .with_message(message)
            .with_details(serde_json::json!({
                "command_id": cmd.id,
                "command_type": cmd.command_type,
            }));
        if let Err(e) = events.append(&event).await {
            tracing::warn!("failed to journal command outcome for {}: {e}", cmd.id);
        }
    }
}

/// Spawn the periodic expiry sweep (fire-and-forget).
pub fn spawn_command_sweeper(dispatcher: Arc<CommandDispatcher>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match dispatcher.expire_commands().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("command sweep expired {n} commands"),
                Err(e) => tracing::error!("command sweep error: {e}"),
            }
        }
    });
}

/// Spawn the hourly purge of terminal commands older than `keep_days`.
/// `device_commands` is a plain table with no store-side retention policy,
/// so this sweep is what bounds its growth.
pub fn spawn_command_cleanup(dispatcher: Arc<CommandDispatcher>, keep_days: i64) {
    tokio::spawn(async move {
        // Let startup settle before the first pass.
        tokio::time::sleep(Duration::from_secs(60)).await;
        tracing::info!("command cleanup: started (keep_days={keep_days})");

        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            match dispatcher.cleanup_old(keep_days).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("command cleanup deleted {n} old commands"),
                Err(e) => tracing::error!("command cleanup error: {e}"),
            }
        }
    });
}

fn command_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<DeviceCommand> {
    let status: String = row.get("status");
    Ok(DeviceCommand {
        id: row.get("id"),
        device_id: row.get("device_id"),
        site_id: row.get("site_id"),
        command_type: row.get("command_type"),
        command_params: row.get("command_params"),
        status: status.parse::<CommandStatus>()?,
        priority: row.get("priority"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        scheduled_at: row.get("scheduled_at"),
        sent_at: row.get("sent_at"),
        acknowledged_at: row.get("acknowledged_at"),
        completed_at: row.get("completed_at"),
        expires_at: row.get("expires_at"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        result: row.get("result"),
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::Cancelled.is_terminal());
        assert!(CommandStatus::Expired.is_terminal());
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::Claimed.is_terminal());
        assert!(!CommandStatus::Sent.is_terminal());
        assert!(!CommandStatus::Acknowledged.is_terminal());
    }

    #[test]
    fn immediate_spec_defaults() {
        let spec = CommandSpec::new(Uuid::new_v4(), Uuid::new_v4(), "set_power_mode");
        assert_eq!(spec.priority, 5);
        assert_eq!(spec.max_retries, 3);
        assert!(spec.scheduled_at.is_none());
    }
}
