use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::events::EventJournal;
use crate::models::device::{ConnectionStatus, Device, DeviceSession};
use crate::models::event::{DeviceEvent, Severity};
use crate::registry::DeviceRegistry;

/// In-memory map of live device sessions plus the connect/disconnect/error
/// hooks that keep the registry and event journal in step. One session per
/// device id; a reconnect replaces the old session. State is per-process
/// and torn down with the service.
pub struct SessionManager {
    registry: Arc<DeviceRegistry>,
    events: Arc<EventJournal>,
    sessions: Mutex<HashMap<Uuid, DeviceSession>>,
}

impl SessionManager {
    pub fn new(registry: Arc<DeviceRegistry>, events: Arc<EventJournal>) -> Self {
        Self {
            registry,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a device connection: marks it connected, opens a session
    /// and journals a connect event. Unknown devices get no session.
    pub async fn handle_connect(
        &self,
        device_id: Uuid,
        client_addr: Option<String>,
    ) -> anyhow::Result<Option<DeviceSession>> {
        let Some(device) = self.registry.get_by_id(device_id).await? else {
            tracing::warn!("connect from unknown device {device_id}");
            return Ok(None);
        };

        self.registry
            .update_connection_status(device_id, ConnectionStatus::Connected)
            .await?;

        let now = Utc::now();
        let session = DeviceSession {
            device_id,
            session_id: Uuid::new_v4(),
            client_addr,
            opened_at: now,
            last_activity_at: now,
        };
        self.sessions
            .lock()
            .unwrap()
            .insert(device_id, session.clone());

        self.journal(&device, "connect", Severity::Info, "device connected")
            .await;
        tracing::info!("device {} connected (session {})", device.serial_number, session.session_id);
        Ok(Some(session))
    }

    pub async fn handle_disconnect(&self, device_id: Uuid) -> anyhow::Result<()> {
        self.registry
            .update_connection_status(device_id, ConnectionStatus::Disconnected)
            .await?;
        self.sessions.lock().unwrap().remove(&device_id);

        if let Some(device) = self.registry.get_by_id(device_id).await? {
            self.journal(&device, "disconnect", Severity::Info, "device disconnected")
                .await;
        }
        Ok(())
    }

    pub async fn handle_error(&self, device_id: Uuid, message: &str) -> anyhow::Result<()> {
        self.registry
            .update_connection_status(device_id, ConnectionStatus::Error)
            .await?;
        self.sessions.lock().unwrap().remove(&device_id);

        if let Some(device) = self.registry.get_by_id(device_id).await? {
            self.journal(&device, "error", Severity::Error, message).await;
        }
        Ok(())
    }

    /// Bump a session's activity clock. Returns false for a device with no
    /// live session.
    pub fn touch(&self, device_id: Uuid) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&device_id) {
            Some(session) => {
                session.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn active_session(&self, device_id: Uuid) -> Option<DeviceSession> {
        self.sessions.lock().unwrap().get(&device_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Evict sessions idle beyond the timeout and mark their devices
    /// disconnected. Returns the evicted device ids.
    pub async fn sweep_stale(&self, inactivity_timeout: Duration) -> anyhow::Result<Vec<Uuid>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(inactivity_timeout).unwrap_or(chrono::Duration::seconds(300));
        let stale: Vec<Uuid> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| s.last_activity_at < cutoff)
                .map(|s| s.device_id)
                .collect()
        };
        for device_id in &stale {
            tracing::info!("evicting stale session for device {device_id}");
            self.handle_disconnect(*device_id).await?;
        }
        Ok(stale)
    }

    async fn journal(&self, device: &Device, event_type: &str, severity: Severity, message: &str) {
        let event = DeviceEvent::new(device.device_id, device.site_id, event_type, severity)
            .with_message(message);
        if let Err(e) = self.events.append(&event).await {
            tracing::warn!("failed to journal {event_type} event for {}: {e}", device.device_id);
        }
    }
}

/// Spawn the periodic stale-session sweep (fire-and-forget).
pub fn spawn_session_sweeper(
    sessions: Arc<SessionManager>,
    inactivity_timeout: Duration,
    sweep_interval: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            match sessions.sweep_stale(inactivity_timeout).await {
                Ok(evicted) if !evicted.is_empty() => {
                    tracing::info!("session sweep evicted {} stale sessions", evicted.len());
                }
                Ok(_) => {}
                Err(e) => tracing::error!("session sweep error: {e}"),
            }
        }
    });
}
