use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::models::device::Device;
use crate::registry::{DeviceRegistry, constant_time_eq};

type HmacSha256 = Hmac<Sha256>;

pub const ERR_INVALID_TOKEN: &str = "INVALID_TOKEN";
pub const ERR_INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
pub const ERR_LOCKED_OUT: &str = "LOCKED_OUT";
pub const ERR_DEVICE_NOT_FOUND: &str = "DEVICE_NOT_FOUND";

/// Outcome of an authentication attempt. Failures carry a stable error
/// code plus, where it helps the caller, the remaining attempt budget or
/// the lockout end.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    pub error_code: Option<String>,
    pub remaining_attempts: Option<u32>,
    pub unlocks_at: Option<DateTime<Utc>>,
}

impl AuthResult {
    fn ok(device: Device) -> Self {
        Self {
            success: true,
            device: Some(device),
            error_code: None,
            remaining_attempts: None,
            unlocks_at: None,
        }
    }

    fn denied(code: &str, remaining_attempts: Option<u32>) -> Self {
        Self {
            success: false,
            device: None,
            error_code: Some(code.to_string()),
            remaining_attempts,
            unlocks_at: None,
        }
    }

    fn locked(unlocks_at: Option<DateTime<Utc>>) -> Self {
        Self {
            success: false,
            device: None,
            error_code: Some(ERR_LOCKED_OUT.to_string()),
            remaining_attempts: Some(0),
            unlocks_at,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LockoutStatus {
    pub is_locked: bool,
    pub failed_attempts: u32,
    pub remaining_attempts: u32,
    pub unlocks_at: Option<DateTime<Utc>>,
}

/// Operator diagnostics for a device's credential state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenStatus {
    pub device_found: bool,
    pub has_token: bool,
    pub is_expired: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_locked: bool,
}

/// Token auth with per-identity rate limiting, challenge/response, and
/// HMAC request signing. Token storage itself lives in the registry; this
/// layer adds the sliding-window lockout and the crypto handshakes.
///
/// The failed-attempt table is per-process, pruned on access and by the
/// periodic sweep, and torn down with the service.
pub struct DeviceAuthService {
    registry: Arc<DeviceRegistry>,
    max_failed_attempts: u32,
    lockout_window: Duration,
    signature_skew: Duration,
    failed_attempts: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl DeviceAuthService {
    pub fn new(registry: Arc<DeviceRegistry>, config: &AuthConfig) -> Self {
        Self {
            registry,
            max_failed_attempts: config.max_failed_attempts,
            lockout_window: Duration::minutes(config.lockout_minutes),
            signature_skew: Duration::seconds(config.signature_skew_secs),
            failed_attempts: Mutex::new(HashMap::new()),
        }
    }

    // ── Token lifecycle (delegated to the registry) ──

    pub async fn generate_token(
        &self,
        device_id: Uuid,
        expires_in_days: Option<i64>,
    ) -> anyhow::Result<String> {
        self.registry.generate_token(device_id, expires_in_days).await
    }

    /// Replacing a token also forgives past failures against the device.
    pub async fn regenerate_token(&self, device_id: Uuid) -> anyhow::Result<String> {
        let token = self.registry.generate_token(device_id, None).await?;
        self.clear_failed_attempts(&device_id.to_string());
        Ok(token)
    }

    pub async fn revoke_token(&self, device_id: Uuid) -> anyhow::Result<bool> {
        self.registry.revoke_token(device_id).await
    }

    pub async fn is_token_valid(&self, device_id: Uuid, token: &str) -> anyhow::Result<bool> {
        self.registry.validate_token(device_id, token).await
    }

    // ── Authentication ──

    /// Authenticate by device id + token. While locked out, even correct
    /// credentials are refused.
    pub async fn authenticate_by_token(
        &self,
        device_id: Uuid,
        token: &str,
    ) -> anyhow::Result<AuthResult> {
        let key = device_id.to_string();
        if self.is_locked_out(&key) {
            return Ok(AuthResult::locked(self.unlocks_at(&key)));
        }

        if !self.registry.validate_token(device_id, token).await? {
            let remaining = self.record_failed_attempt(&key);
            return Ok(AuthResult::denied(ERR_INVALID_TOKEN, Some(remaining)));
        }

        self.clear_failed_attempts(&key);
        match self.registry.get_by_id(device_id).await? {
            Some(device) => Ok(AuthResult::ok(device)),
            None => Ok(AuthResult::denied(ERR_DEVICE_NOT_FOUND, None)),
        }
    }

    /// Authenticate by serial number + token, the handshake field devices
    /// use before they know their registry id.
    pub async fn authenticate_by_serial(
        &self,
        serial_number: &str,
        token: &str,
    ) -> anyhow::Result<AuthResult> {
        if self.is_locked_out(serial_number) {
            return Ok(AuthResult::locked(self.unlocks_at(serial_number)));
        }

        match self.registry.authenticate_by_serial(serial_number, token).await? {
            Some(device) => {
                self.clear_failed_attempts(serial_number);
                Ok(AuthResult::ok(device))
            }
            None => {
                let remaining = self.record_failed_attempt(serial_number);
                Ok(AuthResult::denied(ERR_INVALID_CREDENTIALS, Some(remaining)))
            }
        }
    }

    // ── Challenge / response ──

    /// 256-bit random challenge, hex encoded.
    pub fn generate_challenge(&self) -> String {
        let bytes: [u8; 32] = rand::rng().random();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Verify HMAC-SHA-256(shared_secret, challenge) == response. The
    /// shared secret is provisioned in the device's connection config;
    /// a device without one cannot use this handshake.
    pub async fn authenticate_with_challenge(
        &self,
        device_id: Uuid,
        challenge: &str,
        response: &str,
    ) -> anyhow::Result<AuthResult> {
        let key = device_id.to_string();
        if self.is_locked_out(&key) {
            return Ok(AuthResult::locked(self.unlocks_at(&key)));
        }

        let Some(device) = self.registry.get_by_id(device_id).await? else {
            return Ok(AuthResult::denied(ERR_DEVICE_NOT_FOUND, None));
        };

        let secret = device
            .connection_config
            .as_ref()
            .and_then(|c| c.get("shared_secret"))
            .and_then(|s| s.as_str());
        let Some(secret) = secret else {
            let remaining = self.record_failed_attempt(&key);
            return Ok(AuthResult::denied(ERR_INVALID_CREDENTIALS, Some(remaining)));
        };

        let expected = hmac_hex(secret, challenge);
        if constant_time_eq(expected.as_bytes(), response.as_bytes()) {
            self.clear_failed_attempts(&key);
            Ok(AuthResult::ok(device))
        } else {
            let remaining = self.record_failed_attempt(&key);
            Ok(AuthResult::denied(ERR_INVALID_CREDENTIALS, Some(remaining)))
        }
    }

    // ── API key signing ──

    /// Mint an API key pair for device API calls. The secret is shown only
    /// here; the caller persists it on the device.
    pub fn generate_api_key(&self, device_id: Uuid) -> (String, String) {
        use base64::Engine as _;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let key_id = format!("dev_{}", &device_id.simple().to_string()[..12]);
        let bytes: [u8; 32] = rand::rng().random();
        (key_id, URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Client-side signature: HMAC-SHA-256(secret, "<timestamp>:<body>").
    pub fn sign_request(key_secret: &str, timestamp: &str, body: &str) -> String {
        hmac_hex(key_secret, &format!("{timestamp}:{body}"))
    }

    /// Verify a signed request. The timestamp must be within the
    /// configured skew window of now, which also bounds replay.
    pub fn validate_api_key_signature(
        &self,
        key_secret: &str,
        timestamp: &str,
        signature: &str,
        request_body: &str,
    ) -> bool {
        let Ok(ts) = timestamp.parse::<i64>() else {
            return false;
        };
        if (Utc::now().timestamp() - ts).abs() > self.signature_skew.num_seconds() {
            return false;
        }
        let expected = Self::sign_request(key_secret, timestamp, request_body);
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }

    // ── Diagnostics ──

    pub async fn get_token_status(&self, device_id: Uuid) -> anyhow::Result<TokenStatus> {
        let is_locked = self.is_locked_out(&device_id.to_string());
        let Some(device) = self.registry.get_by_id(device_id).await? else {
            return Ok(TokenStatus {
                device_found: false,
                has_token: false,
                is_expired: false,
                expires_at: None,
                is_locked,
            });
        };
        let has_token = device.auth_token_hash.is_some();
        let is_expired = device
            .token_expires_at
            .map(|t| t <= Utc::now())
            .unwrap_or(false);
        Ok(TokenStatus {
            device_found: true,
            has_token,
            is_expired,
            expires_at: device.token_expires_at,
            is_locked,
        })
    }

    pub fn get_lockout_status(&self, key: &str) -> LockoutStatus {
        let count = self.recent_attempt_count(key);
        let is_locked = count >= self.max_failed_attempts;
        LockoutStatus {
            is_locked,
            failed_attempts: count,
            remaining_attempts: self.max_failed_attempts.saturating_sub(count),
            unlocks_at: if is_locked { self.unlocks_at(key) } else { None },
        }
    }

    // ── Failed-attempt window ──

    fn is_locked_out(&self, key: &str) -> bool {
        self.recent_attempt_count(key) >= self.max_failed_attempts
    }

    /// Count attempts inside the sliding window, pruning aged ones.
    fn recent_attempt_count(&self, key: &str) -> u32 {
        let cutoff = Utc::now() - self.lockout_window;
        let mut attempts = self.failed_attempts.lock().unwrap();
        match attempts.get_mut(key) {
            Some(times) => {
                times.retain(|t| *t >= cutoff);
                if times.is_empty() {
                    attempts.remove(key);
                    0
                } else {
                    times.len() as u32
                }
            }
            None => 0,
        }
    }

    /// Record a failure and return the remaining attempt budget.
    fn record_failed_attempt(&self, key: &str) -> u32 {
        let mut attempts = self.failed_attempts.lock().unwrap();
        let times = attempts.entry(key.to_string()).or_default();
        times.push(Utc::now());
        let count = times.len() as u32;
        drop(attempts);
        if count >= self.max_failed_attempts {
            tracing::warn!("auth: '{key}' locked out after {count} failed attempts");
        }
        self.max_failed_attempts.saturating_sub(count)
    }

    fn clear_failed_attempts(&self, key: &str) {
        self.failed_attempts.lock().unwrap().remove(key);
    }

    fn unlocks_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let attempts = self.failed_attempts.lock().unwrap();
        attempts
            .get(key)
            .and_then(|times| times.first())
            .map(|first| *first + self.lockout_window)
    }

    /// Drop identities whose entire window has aged out. Returns how many
    /// were cleaned.
    pub fn cleanup_expired_lockouts(&self) -> usize {
        let cutoff = Utc::now() - self.lockout_window;
        let mut attempts = self.failed_attempts.lock().unwrap();
        let before = attempts.len();
        attempts.retain(|_, times| times.iter().any(|t| *t >= cutoff));
        before - attempts.len()
    }
}

fn hmac_hex(secret: &str, message: &str) -> String {
    // HMAC accepts any key length; new_from_slice only fails on impls with
    // fixed key sizes.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(message.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Spawn the periodic lockout-table prune (fire-and-forget).
pub fn spawn_lockout_sweeper(auth: Arc<DeviceAuthService>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let cleaned = auth.cleanup_expired_lockouts();
            if cleaned > 0 {
                tracing::debug!("auth sweep cleared {cleaned} expired lockout entries");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use sqlx::postgres::PgPoolOptions;

    fn service() -> DeviceAuthService {
        // The pool is never touched by the in-memory paths under test.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let registry = Arc::new(DeviceRegistry::new(pool, 365));
        DeviceAuthService::new(registry, &AuthConfig::default())
    }

    #[tokio::test]
    async fn lockout_engages_after_max_attempts() {
        let svc = service();
        for _ in 0..4 {
            svc.record_failed_attempt("SN-A");
        }
        assert!(!svc.is_locked_out("SN-A"));
        svc.record_failed_attempt("SN-A");
        assert!(svc.is_locked_out("SN-A"));

        let status = svc.get_lockout_status("SN-A");
        assert!(status.is_locked);
        assert_eq!(status.failed_attempts, 5);
        assert_eq!(status.remaining_attempts, 0);
        assert!(status.unlocks_at.is_some());
    }

    #[tokio::test]
    async fn window_elapse_clears_lockout() {
        let svc = service();
        {
            let mut attempts = svc.failed_attempts.lock().unwrap();
            attempts.insert(
                "SN-B".to_string(),
                vec![Utc::now() - Duration::hours(1); 5],
            );
        }
        assert!(!svc.is_locked_out("SN-B"));
        assert_eq!(svc.get_lockout_status("SN-B").failed_attempts, 0);
    }

    #[tokio::test]
    async fn clear_resets_the_window() {
        let svc = service();
        for _ in 0..5 {
            svc.record_failed_attempt("SN-C");
        }
        svc.clear_failed_attempts("SN-C");
        assert!(!svc.is_locked_out("SN-C"));
    }

    #[tokio::test]
    async fn cleanup_drops_only_aged_entries() {
        let svc = service();
        {
            let mut attempts = svc.failed_attempts.lock().unwrap();
            attempts.insert("old".to_string(), vec![Utc::now() - Duration::hours(2)]);
            attempts.insert("fresh".to_string(), vec![Utc::now()]);
        }
        assert_eq!(svc.cleanup_expired_lockouts(), 1);
        let attempts = svc.failed_attempts.lock().unwrap();
        assert!(!attempts.contains_key("old"));
        assert!(attempts.contains_key("fresh"));
    }

    #[tokio::test]
    async fn challenges_are_64_hex_and_unique() {
        let svc = service();
        let challenges: Vec<String> = (0..10).map(|_| svc.generate_challenge()).collect();
        for c in &challenges {
            assert_eq!(c.len(), 64);
            assert!(c.chars().all(|ch| ch.is_ascii_hexdigit()));
        }
        let mut unique = challenges.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), challenges.len());
    }

    #[tokio::test]
    async fn api_key_shape() {
        let svc = service();
        let (key_id, secret) = svc.generate_api_key(Uuid::new_v4());
        assert!(key_id.starts_with("dev_"));
        assert_eq!(key_id.len(), 16);
        assert!(secret.len() > 20);
    }

    #[tokio::test]
    async fn request_signature_round_trip() {
        let svc = service();
        let ts = Utc::now().timestamp().to_string();
        let body = r#"{"data":"test"}"#;
        let sig = DeviceAuthService::sign_request("secret", &ts, body);
        assert!(svc.validate_api_key_signature("secret", &ts, &sig, body));
        assert!(!svc.validate_api_key_signature("secret", &ts, &sig, "tampered"));
        assert!(!svc.validate_api_key_signature("wrong", &ts, &sig, body));
    }

    #[tokio::test]
    async fn stale_timestamps_are_rejected() {
        // Default skew window is 300 s; an hour-old timestamp is out.
        let svc = service();
        let ts = (Utc::now().timestamp() - 3600).to_string();
        let body = "{}";
        let sig = DeviceAuthService::sign_request("secret", &ts, body);
        assert!(!svc.validate_api_key_signature("secret", &ts, &sig, body));
        assert!(!svc.validate_api_key_signature("secret", "not-a-number", &sig, body));
    }

    #[tokio::test]
    async fn skew_window_comes_from_config() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let registry = Arc::new(DeviceRegistry::new(pool, 365));
        let config = AuthConfig {
            signature_skew_secs: 7200,
            ..Default::default()
        };
        let svc = DeviceAuthService::new(registry, &config);

        let ts = (Utc::now().timestamp() - 3600).to_string();
        let body = "{}";
        let sig = DeviceAuthService::sign_request("secret", &ts, body);
        assert!(svc.validate_api_key_signature("secret", &ts, &sig, body));
    }
}
