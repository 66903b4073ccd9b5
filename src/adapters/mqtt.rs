//! MQTT adapter for devices that push telemetry to a broker and accept
//! commands over a request/response topic pair.
//!
//! Topic layout (fixed wire contract):
//! ```text
//! <prefix>/<device_id>/telemetry          device → hub
//! <prefix>/<device_id>/status             device → hub (retained LWT)
//! <prefix>/<device_id>/command            hub → device
//! <prefix>/<device_id>/command/response   device → hub
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::adapter::{
    AdapterError, CommandOutcome, CommandRequest, DeviceAdapter, Telemetry, is_stale,
};
use crate::config::MqttDefaults;
use crate::models::device::{Device, Protocol};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SERIAL_READ_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Telemetry within this window counts as proof of connectivity.
const CONNECTIVITY_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct MqttAdapterConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
    pub device_id: String,
    pub keepalive: Duration,
    pub qos: QoS,
    pub polling_interval: Duration,
    pub command_timeout: Duration,
    /// Flip the battery power sign for devices whose convention disagrees
    /// with ours. Off by default; set per device model once confirmed.
    pub invert_battery_power: bool,
}

impl MqttAdapterConfig {
    /// Merge broker defaults with a device's `connection_config` overrides.
    pub fn for_device(defaults: &MqttDefaults, device: &Device) -> Self {
        let cc = device.connection_config.as_ref();
        let get_str = |key: &str| cc.and_then(|c| c.get(key)).and_then(|v| v.as_str());
        let get_u64 = |key: &str| cc.and_then(|c| c.get(key)).and_then(|v| v.as_u64());
        let get_bool = |key: &str| cc.and_then(|c| c.get(key)).and_then(|v| v.as_bool());

        let device_id = get_str("device_id")
            .map(str::to_string)
            .unwrap_or_else(|| device.device_id.to_string());
        Self {
            broker_host: get_str("host")
                .or_else(|| get_str("broker_host"))
                .map(str::to_string)
                .unwrap_or_else(|| defaults.broker_host.clone()),
            broker_port: get_u64("port").map(|p| p as u16).unwrap_or(defaults.broker_port),
            username: get_str("username").map(str::to_string).or_else(|| defaults.username.clone()),
            password: get_str("password").map(str::to_string).or_else(|| defaults.password.clone()),
            client_id: get_str("client_id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("solarflux-{device_id}")),
            topic_prefix: get_str("topic_prefix")
                .map(str::to_string)
                .unwrap_or_else(|| defaults.topic_prefix.clone()),
            device_id,
            keepalive: Duration::from_secs(get_u64("keepalive").unwrap_or(defaults.keepalive_secs)),
            qos: qos_from_u8(get_u64("qos").map(|q| q as u8).unwrap_or(defaults.qos)),
            polling_interval: Duration::from_secs(
                device.polling_interval_seconds.max(1) as u64,
            ),
            command_timeout: Duration::from_secs(
                get_u64("command_timeout").unwrap_or(defaults.command_timeout_secs),
            ),
            invert_battery_power: get_bool("invert_battery_power").unwrap_or(false),
        }
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[derive(Debug, Clone)]
struct Topics {
    telemetry: String,
    status: String,
    command: String,
    command_response: String,
}

impl Topics {
    fn new(prefix: &str, device_id: &str) -> Self {
        let base = format!("{prefix}/{device_id}");
        Self {
            telemetry: format!("{base}/telemetry"),
            status: format!("{base}/status"),
            command: format!("{base}/command"),
            command_response: format!("{base}/command/response"),
        }
    }
}

struct CachedTelemetry {
    telemetry: Telemetry,
    raw: serde_json::Map<String, serde_json::Value>,
    received: Instant,
}

/// State shared between the adapter handle and the network-loop task.
/// The broker callback task resolves pending commands through per-entry
/// oneshot channels; the pending table is mutex-guarded.
struct Inner {
    config: MqttAdapterConfig,
    topics: Topics,
    connected: AtomicBool,
    client: Mutex<Option<AsyncClient>>,
    cached: Mutex<Option<CachedTelemetry>>,
    pending: Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
}

impl Inner {
    /// Dispatch one inbound publish by topic.
    fn handle_message(&self, topic: &str, payload: &[u8]) {
        if topic == self.topics.telemetry {
            self.handle_telemetry(payload);
        } else if topic == self.topics.command_response {
            self.handle_command_response(payload);
        } else if topic == self.topics.status {
            self.handle_status(payload);
        } else {
            tracing::debug!("mqtt: message on unhandled topic {topic}");
        }
    }

    fn handle_telemetry(&self, payload: &[u8]) {
        let data: serde_json::Map<String, serde_json::Value> =
            match serde_json::from_slice(payload) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => {
                    tracing::warn!("mqtt: telemetry payload is not a JSON object");
                    return;
                }
                Err(e) => {
                    tracing::warn!("mqtt: invalid telemetry JSON: {e}");
                    return;
                }
            };
        let telemetry = map_telemetry(&data, self.config.invert_battery_power);
        tracing::debug!(
            "mqtt: telemetry updated (pv={:?}W, grid={:?}W, soc={:?}%)",
            telemetry.pv_power_w,
            telemetry.grid_power_w,
            telemetry.batt_soc_pct
        );
        *self.cached.lock().unwrap() = Some(CachedTelemetry {
            telemetry,
            raw: data,
            received: Instant::now(),
        });
    }

    fn handle_command_response(&self, payload: &[u8]) {
        let data: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("mqtt: invalid command response JSON: {e}");
                return;
            }
        };
        let command_id = data
            .get("command_id")
            .or_else(|| data.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let Some(command_id) = command_id else {
            tracing::warn!("mqtt: command response missing command_id");
            return;
        };
        let sender = self.pending.lock().unwrap().remove(&command_id);
        match sender {
            // The waiter may have timed out already; that's fine.
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => tracing::debug!("mqtt: response for unknown command {command_id}"),
        }
    }

    fn handle_status(&self, payload: &[u8]) {
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(v) => {
                let status = v.get("status").and_then(|s| s.as_str()).unwrap_or("unknown");
                tracing::info!("mqtt: device {} status: {status}", self.config.device_id);
            }
            Err(_) => tracing::debug!("mqtt: non-JSON status message"),
        }
    }

    fn register_pending(&self, command_id: &str) -> oneshot::Receiver<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(command_id.to_string(), tx);
        rx
    }

    fn drop_pending(&self, command_id: &str) {
        self.pending.lock().unwrap().remove(command_id);
    }

    /// Wait for the device's response, resolving a timeout to the
    /// non-exceptional timeout outcome. Always clears the pending entry.
    async fn await_response(
        &self,
        command_id: &str,
        rx: oneshot::Receiver<serde_json::Value>,
        timeout: Duration,
    ) -> CommandOutcome {
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => outcome_from_response(command_id, response),
            Ok(Err(_)) => CommandOutcome::error(command_id, "response channel closed"),
            Err(_) => {
                tracing::warn!(
                    "mqtt: command {command_id} timed out after {}s",
                    timeout.as_secs_f64()
                );
                CommandOutcome::timeout(command_id)
            }
        };
        self.drop_pending(command_id);
        outcome
    }

    fn status_payload(&self, status: &str) -> String {
        serde_json::json!({ "status": status, "ts": Utc::now().to_rfc3339() }).to_string()
    }
}

/// Parse a device response map into an outcome, pinning the correlation id
/// we issued regardless of what the device echoed.
fn outcome_from_response(command_id: &str, response: serde_json::Value) -> CommandOutcome {
    match serde_json::from_value::<CommandOutcome>(response) {
        Ok(mut outcome) => {
            outcome.command_id = command_id.to_string();
            outcome
        }
        Err(_) => CommandOutcome::error(command_id, "malformed response"),
    }
}

/// Map raw device telemetry into the internal snapshot, tolerating the
/// field-name dialects seen in the wild. The full payload rides along in
/// `extra`.
fn map_telemetry(
    data: &serde_json::Map<String, serde_json::Value>,
    invert_battery_power: bool,
) -> Telemetry {
    let get = |keys: &[&str]| -> Option<f64> {
        keys.iter()
            .find_map(|k| data.get(*k))
            .and_then(|v| v.as_f64())
    };

    let batt_power = get(&["batt_power_w", "battery_power", "batt_power"])
        .map(|p| if invert_battery_power { -p } else { p });

    Telemetry {
        ts: parse_ts(data),
        pv_power_w: get(&["pv_power_w", "pv_power", "solar_power", "dc_power"]),
        grid_power_w: get(&["grid_power_w", "grid_power", "ac_power"]),
        load_power_w: get(&["load_power_w", "load_power", "consumption"]),
        batt_voltage_v: get(&["batt_voltage_v", "battery_voltage", "batt_voltage"]),
        batt_current_a: get(&["batt_current_a", "battery_current", "batt_current"]),
        batt_power_w: batt_power,
        batt_soc_pct: get(&["batt_soc_pct", "battery_soc", "soc", "state_of_charge"]),
        inverter_temp_c: get(&["inverter_temp_c", "temperature", "temp"]),
        extra: data.clone(),
    }
}

/// `ts` is canonical; `timestamp` is accepted on input only. Either an
/// RFC 3339 string or epoch seconds.
fn parse_ts(data: &serde_json::Map<String, serde_json::Value>) -> DateTime<Utc> {
    let raw = data.get("ts").or_else(|| data.get("timestamp"));
    match raw {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

/// MQTT-backed [`DeviceAdapter`]: caches pushed telemetry and correlates
/// command responses by short id.
pub struct MqttAdapter {
    inner: Arc<Inner>,
}

impl MqttAdapter {
    pub fn new(config: MqttAdapterConfig) -> Self {
        let topics = Topics::new(&config.topic_prefix, &config.device_id);
        Self {
            inner: Arc::new(Inner {
                config,
                topics,
                connected: AtomicBool::new(false),
                client: Mutex::new(None),
                cached: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn client(&self) -> Option<AsyncClient> {
        self.inner.client.lock().unwrap().clone()
    }

    async fn subscribe_and_announce(inner: &Inner, client: &AsyncClient) -> Result<(), AdapterError> {
        for topic in [
            inner.topics.telemetry.as_str(),
            inner.topics.command_response.as_str(),
            inner.topics.status.as_str(),
        ] {
            client
                .subscribe(topic, inner.config.qos)
                .await
                .map_err(|e| AdapterError::Transport(e.to_string()))?;
        }
        client
            .publish(
                inner.topics.status.as_str(),
                inner.config.qos,
                true,
                inner.status_payload("online"),
            )
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Drive the broker connection: dispatch inbound publishes, re-announce on
/// reconnect, back off on transport errors. Exits once the adapter closes.
async fn run_event_loop(inner: Arc<Inner>, mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inner.handle_message(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Covers broker-initiated reconnects; subscriptions don't
                // survive a clean session.
                inner.connected.store(true, Ordering::SeqCst);
                let client = inner.client.lock().unwrap().clone();
                if let Some(client) = client {
                    if let Err(e) = MqttAdapter::subscribe_and_announce(&inner, &client).await {
                        tracing::warn!("mqtt: resubscribe after reconnect failed: {e}");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if !inner.connected.load(Ordering::SeqCst) {
                    tracing::debug!("mqtt: event loop stopped");
                    break;
                }
                tracing::warn!("mqtt: connection error: {e}, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

#[async_trait]
impl DeviceAdapter for MqttAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            tracing::debug!("mqtt: already connected");
            return Ok(());
        }
        let inner = &self.inner;
        let config = &inner.config;

        let mut opts = MqttOptions::new(
            config.client_id.as_str(),
            config.broker_host.as_str(),
            config.broker_port,
        );
        opts.set_keep_alive(config.keepalive);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user.as_str(), pass.as_str());
        }
        opts.set_last_will(LastWill::new(
            inner.topics.status.as_str(),
            inner.status_payload("offline"),
            config.qos,
            true,
        ));

        tracing::info!(
            "mqtt: connecting to {}:{} as {}",
            config.broker_host,
            config.broker_port,
            config.client_id
        );
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        // Block until the broker acknowledges, or give up.
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(AdapterError::Connection(format!(
                    "connection timeout to {}:{}",
                    config.broker_host, config.broker_port
                )));
            }
            match tokio::time::timeout(remaining, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != rumqttc::ConnectReturnCode::Success {
                        return Err(AdapterError::Connection(format!(
                            "connection refused: {:?}",
                            ack.code
                        )));
                    }
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(AdapterError::Connection(e.to_string()));
                }
                Err(_) => {
                    return Err(AdapterError::Connection(format!(
                        "connection timeout to {}:{}",
                        config.broker_host, config.broker_port
                    )));
                }
            }
        }

        *inner.client.lock().unwrap() = Some(client.clone());
        Self::subscribe_and_announce(inner, &client).await?;
        inner.connected.store(true, Ordering::SeqCst);
        tokio::spawn(run_event_loop(inner.clone(), eventloop));

        tracing::info!("mqtt: connected to {}:{}", config.broker_host, config.broker_port);
        Ok(())
    }

    async fn close(&self) {
        let client = self.inner.client.lock().unwrap().take();
        // Flag first so the event loop exits instead of retrying.
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        if let Some(client) = client {
            if was_connected {
                let _ = client
                    .publish(
                        self.inner.topics.status.as_str(),
                        self.inner.config.qos,
                        true,
                        self.inner.status_payload("offline"),
                    )
                    .await;
            }
            let _ = client.disconnect().await;
            tracing::info!("mqtt: disconnected");
        }
    }

    async fn poll(&self) -> Result<Telemetry, AdapterError> {
        if !self.is_connected() {
            self.connect().await?;
        }

        let cached = self.inner.cached.lock().unwrap();
        match cached.as_ref() {
            Some(entry) => {
                let age = entry.received.elapsed();
                if is_stale(age, self.inner.config.polling_interval) {
                    tracing::warn!(
                        "mqtt: telemetry for {} is stale ({}s old)",
                        self.inner.config.device_id,
                        age.as_secs()
                    );
                }
                Ok(entry.telemetry.clone())
            }
            None => {
                tracing::debug!("mqtt: no telemetry received yet");
                Ok(Telemetry::empty(Utc::now()))
            }
        }
    }

    async fn handle_command(&self, request: CommandRequest) -> CommandOutcome {
        let command_id = Uuid::new_v4().simple().to_string()[..8].to_string();

        if !self.is_connected() {
            if let Err(e) = self.connect().await {
                return CommandOutcome::error(&command_id, e.to_string());
            }
        }
        let Some(client) = self.client() else {
            return CommandOutcome::error(&command_id, "not connected");
        };

        let mut payload = serde_json::Map::new();
        payload.insert("command_id".to_string(), serde_json::json!(command_id));
        payload.insert("action".to_string(), serde_json::json!(request.action.as_str()));
        payload.insert("ts".to_string(), serde_json::json!(Utc::now().to_rfc3339()));
        for (key, value) in &request.params {
            payload.insert(key.clone(), value.clone());
        }

        tracing::info!("mqtt: sending {} command {command_id}", request.action.as_str());
        let rx = self.inner.register_pending(&command_id);

        if let Err(e) = client
            .publish(
                self.inner.topics.command.as_str(),
                self.inner.config.qos,
                false,
                serde_json::Value::Object(payload).to_string(),
            )
            .await
        {
            self.inner.drop_pending(&command_id);
            tracing::error!("mqtt: command publish failed: {e}");
            return CommandOutcome::error(&command_id, e.to_string());
        }

        let timeout = request.timeout.unwrap_or(self.inner.config.command_timeout);
        self.inner.await_response(&command_id, rx, timeout).await
    }

    async fn read_serial_number(&self) -> Option<String> {
        // Cached telemetry first; many devices include it in every report.
        {
            let cached = self.inner.cached.lock().unwrap();
            if let Some(entry) = cached.as_ref() {
                for key in ["serial_number", "sn", "device_serial", "serial"] {
                    if let Some(v) = entry.raw.get(key) {
                        return Some(match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        });
                    }
                }
            }
        }

        let outcome = self
            .handle_command(
                CommandRequest::read("serial_number").with_timeout(SERIAL_READ_TIMEOUT),
            )
            .await;
        if outcome.ok {
            outcome.value.map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
        } else {
            None
        }
    }

    async fn check_connectivity(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let recent = {
            let cached = self.inner.cached.lock().unwrap();
            cached
                .as_ref()
                .map(|entry| entry.received.elapsed() <= CONNECTIVITY_WINDOW)
                .unwrap_or(false)
        };
        if recent {
            return true;
        }
        self.handle_command(CommandRequest::ping().with_timeout(PING_TIMEOUT))
            .await
            .ok
    }
}
