//! Registration with the remote network-identity service
//!
//! [`RegistrationClient`] talks to the registration API through one shared,
//! pooled HTTP client and retries transport failures according to a single
//! [`RetryPolicy`]. [`RegistrationService`] wraps it and persists the
//! resulting [`RegistrationCredential`] in the settings store.
//!
//! Retry rules:
//! - connection errors, attempt timeouts and 5xx answers are retried with
//!   exponential backoff plus jitter, up to `max_retries` extra attempts
//! - any other non-success status and any unusable body fail immediately
//! - exhausting the budget yields [`ControlError::AllAttemptsFailed`]

use crate::config::{RegistrationConfig, RetryConfig};
use crate::error::{ControlError, Result};
use crate::store::{SettingsStore, CREDENTIAL_KEY, REMOTE_CONFIG_KEY};
use anyhow::Context;
use base64::Engine;
use hyper::body::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying the client version expected by the registration API
const CLIENT_VERSION_HEADER: &str = "CF-Client-Version";

/// Secret bundle identifying this node to the registration service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistrationCredential {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub license_key: String,
    #[serde(default)]
    pub private_key: String,
}

impl RegistrationCredential {
    /// A credential without a device or private key cannot build an outbound
    pub fn is_empty(&self) -> bool {
        self.device_id.is_empty() || self.private_key.is_empty()
    }

    /// Read the stored credential; `None` when nothing is stored
    pub fn load(settings: &dyn SettingsStore) -> Result<Option<Self>> {
        let Some(raw) = settings.get(CREDENTIAL_KEY)? else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let credential = serde_json::from_str(&raw).context("Stored registration credential is not valid JSON")?;
        Ok(Some(credential))
    }

    pub fn save(&self, settings: &dyn SettingsStore) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("Failed to serialize credential")?;
        settings.set(CREDENTIAL_KEY, &raw)?;
        Ok(())
    }
}

/// Backoff and timeout policy shared by every registration call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub max_backoff: Duration,
    /// Jitter as a fraction of `base_delay`, in `0.0..=1.0`
    pub jitter_fraction: f64,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_retries: config.max_retries,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter_fraction: config.jitter_fraction.clamp(0.0, 1.0),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based) with random jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let jitter_ms = self.base_delay.as_millis() as f64 * self.jitter_fraction;
        let jitter = if jitter_ms >= 1.0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms as u64))
        } else {
            Duration::ZERO
        };
        self.backoff_with_jitter(retry, jitter)
    }

    /// `base * 2^retry + jitter`, capped at `max_backoff`.
    ///
    /// With jitter bounded by the base delay the sequence never decreases.
    pub fn backoff_with_jitter(&self, retry: u32, jitter: Duration) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.base_delay
            .saturating_mul(factor)
            .saturating_add(jitter)
            .min(self.max_backoff)
    }

    /// Total number of attempts, the first one included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// HTTP client for the registration API
pub struct RegistrationClient {
    http: reqwest::Client,
    base_url: String,
    client_version: String,
    policy: RetryPolicy,
}

impl RegistrationClient {
    pub fn new(config: &RegistrationConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .tcp_keepalive(Duration::from_secs(30))
            .gzip(true)
            .build()
            .context("Failed to create registration HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_version: config.client_version.clone(),
            policy: RetryPolicy::from(&config.retry),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Register a new device for `public_key`.
    ///
    /// Returns the credential (holding `secret_key` as its private key) and
    /// the remote configuration the service answered with.
    pub async fn register(
        &self,
        secret_key: &str,
        public_key: &str,
        device_name: &str,
        device_model: &str,
    ) -> Result<(RegistrationCredential, Value)> {
        validate_key("secret key", secret_key)?;
        validate_key("public key", public_key)?;

        let tos = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();
        let payload = json!({
            "key": public_key,
            "tos": tos,
            "type": "PC",
            "model": device_model,
            "name": device_name,
        });
        let url = format!("{}/reg", self.base_url);

        let body = self
            .send_with_retry("register", || self.http.post(&url).json(&payload))
            .await?;
        let response = parse_json(&body)?;

        let credential = RegistrationCredential {
            access_token: required_str(&response, &["token"])?,
            device_id: required_str(&response, &["id"])?,
            license_key: required_str(&response, &["account", "license"])?,
            private_key: secret_key.to_string(),
        };

        info!(device_id = %credential.device_id, "Device registered");
        Ok((credential, response))
    }

    /// Fetch the remote configuration of a registered device
    pub async fn fetch_config(&self, credential: &RegistrationCredential) -> Result<Value> {
        let url = format!("{}/reg/{}", self.base_url, credential.device_id);

        let body = self
            .send_with_retry("fetch config", || {
                self.http.get(&url).bearer_auth(&credential.access_token)
            })
            .await?;

        parse_json(&body)
    }

    /// Attach `license` to the device and return the updated credential
    pub async fn update_license(
        &self,
        credential: &RegistrationCredential,
        license: &str,
    ) -> Result<RegistrationCredential> {
        let url = format!("{}/reg/{}/account", self.base_url, credential.device_id);
        let payload = json!({ "license": license });

        self.send_with_retry("update license", || {
            self.http
                .put(&url)
                .bearer_auth(&credential.access_token)
                .json(&payload)
        })
        .await?;

        Ok(RegistrationCredential {
            license_key: license.to_string(),
            ..credential.clone()
        })
    }

    /// Send the request built by `build`, retrying per the policy
    async fn send_with_retry<F>(&self, operation: &str, build: F) -> Result<Bytes>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let attempts = self.policy.max_attempts();
        let mut retry = 0;

        loop {
            let request = build().header(CLIENT_VERSION_HEADER, &self.client_version);
            let result = match tokio::time::timeout(self.policy.attempt_timeout, attempt(request)).await {
                Ok(result) => result,
                Err(_) => Err(ControlError::Transport(format!(
                    "attempt timed out after {}ms",
                    self.policy.attempt_timeout.as_millis()
                ))),
            };

            let err = match result {
                Ok(body) => return Ok(body),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if retry >= self.policy.max_retries {
                warn!(operation, attempts, error = %err, "Registration call failed, giving up");
                return Err(ControlError::AllAttemptsFailed {
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.backoff(retry);
            debug!(
                operation,
                attempt = retry + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Registration attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

async fn attempt(request: reqwest::RequestBuilder) -> Result<Bytes> {
    let response = request
        .send()
        .await
        .map_err(|e| ControlError::Transport(e.to_string()))?;
    let status = response.status();

    if status.is_server_error() {
        return Err(ControlError::Transport(format!("server returned {}", status)));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ControlError::Status {
            status: status.as_u16(),
            body,
        });
    }

    response
        .bytes()
        .await
        .map_err(|e| ControlError::Transport(e.to_string()))
}

fn parse_json(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| ControlError::MalformedResponse(e.to_string()))
}

/// Walk `path` in `value` and require a string at its end
fn required_str(value: &Value, path: &[&str]) -> Result<String> {
    let mut current = value;
    for key in path {
        current = current
            .get(key)
            .ok_or_else(|| ControlError::MalformedResponse(format!("missing '{}'", path.join("."))))?;
    }
    current
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| ControlError::MalformedResponse(format!("'{}' is not a string", path.join("."))))
}

/// Keys are 32 raw bytes, base64 encoded
fn validate_key(what: &str, key: &str) -> Result<()> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key.trim())
        .map_err(|e| ControlError::InvalidKey(format!("{} is not base64: {}", what, e)))?;
    if decoded.len() != 32 {
        return Err(ControlError::InvalidKey(format!(
            "{} must be 32 bytes, got {}",
            what,
            decoded.len()
        )));
    }
    Ok(())
}

/// Registration operations that keep the settings store up to date
pub struct RegistrationService {
    client: RegistrationClient,
    settings: Arc<dyn SettingsStore>,
    device_name: String,
    device_model: String,
}

impl RegistrationService {
    pub fn new(
        client: RegistrationClient,
        settings: Arc<dyn SettingsStore>,
        config: &RegistrationConfig,
    ) -> Self {
        Self {
            client,
            settings,
            device_name: config.device_name(),
            device_model: config.device_model.clone(),
        }
    }

    /// Register this node and persist the new credential
    pub async fn register(
        &self,
        secret_key: &str,
        public_key: &str,
    ) -> Result<(RegistrationCredential, Value)> {
        let (credential, remote) = self
            .client
            .register(secret_key, public_key, &self.device_name, &self.device_model)
            .await?;

        credential.save(self.settings.as_ref())?;
        self.cache_remote_config(&remote)?;
        Ok((credential, remote))
    }

    /// Fetch the remote configuration of the stored credential
    pub async fn refresh_config(&self) -> Result<Value> {
        let credential = self.stored_credential()?;
        let remote = self.client.fetch_config(&credential).await?;
        self.cache_remote_config(&remote)?;
        Ok(remote)
    }

    /// Move the stored credential to another license
    pub async fn set_license(&self, license: &str) -> Result<RegistrationCredential> {
        let credential = self.stored_credential()?;
        let updated = self.client.update_license(&credential, license).await?;
        updated.save(self.settings.as_ref())?;
        info!(device_id = %updated.device_id, "Registration license updated");
        Ok(updated)
    }

    fn stored_credential(&self) -> Result<RegistrationCredential> {
        RegistrationCredential::load(self.settings.as_ref())?
            .filter(|c| !c.device_id.is_empty())
            .ok_or(ControlError::MissingCredential)
    }

    fn cache_remote_config(&self, remote: &Value) -> Result<()> {
        self.settings
            .set(REMOTE_CONFIG_KEY, &remote.to_string())
            .context("Failed to cache remote registration config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_retries: 5,
            max_backoff: Duration::from_millis(max_ms),
            jitter_fraction: 1.0,
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let policy = policy(100, 1000);

        assert_eq!(policy.backoff_with_jitter(0, Duration::ZERO), Duration::from_millis(100));
        assert_eq!(policy.backoff_with_jitter(1, Duration::ZERO), Duration::from_millis(200));
        assert_eq!(policy.backoff_with_jitter(3, Duration::ZERO), Duration::from_millis(800));
        assert_eq!(policy.backoff_with_jitter(4, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(policy.backoff_with_jitter(40, Duration::ZERO), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_is_monotonic_with_jitter() {
        let policy = policy(100, 3000);

        for _ in 0..50 {
            let delays: Vec<Duration> = (0..10).map(|r| policy.backoff(r)).collect();
            for pair in delays.windows(2) {
                assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
            }
            assert!(delays.iter().all(|d| *d <= policy.max_backoff));
        }
    }

    #[test]
    fn test_jitter_is_bounded_by_base_delay() {
        let policy = policy(100, 60_000);

        for _ in 0..100 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn test_required_str() {
        let value = json!({"id": "dev", "account": {"license": 7}});

        assert_eq!(required_str(&value, &["id"]).unwrap(), "dev");
        assert!(matches!(
            required_str(&value, &["token"]),
            Err(ControlError::MalformedResponse(_))
        ));
        assert!(matches!(
            required_str(&value, &["account", "license"]),
            Err(ControlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_validate_key() {
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);

        assert!(validate_key("key", &key).is_ok());
        assert!(validate_key("key", "not base64!").is_err());
        assert!(validate_key("key", "AAAA").is_err());
    }

    #[test]
    fn test_credential_is_empty() {
        let mut credential = RegistrationCredential {
            access_token: "t".into(),
            device_id: "d".into(),
            license_key: "l".into(),
            private_key: String::new(),
        };
        assert!(credential.is_empty());

        credential.private_key = "k".into();
        assert!(!credential.is_empty());
    }
}
