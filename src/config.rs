use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Control API server
    #[serde(default)]
    pub server: ServerConfig,

    /// SQLite database holding settings, rules and traffic counters
    #[serde(default)]
    pub database: DatabaseConfig,

    /// How the relay process is launched and watched
    #[serde(default)]
    pub process: ProcessConfig,

    /// Transport tuning merged into every synthesized config
    #[serde(default)]
    pub tuning: TuningConfig,

    /// Remote registration endpoint and the outbound built from its credential
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Client filtering policy
    #[serde(default)]
    pub filter: FilterConfig,

    /// Background traffic polling
    #[serde(default)]
    pub traffic: TrafficConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the control API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the control API (default: 2053)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Relay executable
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Where the synthesized config is written before every start
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Arguments for running the relay; `{config}` is replaced by `config_path`
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,

    /// Arguments that make the relay print its version and exit
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,

    /// Liveness poll interval of the background monitor in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Number of trailing output lines kept for diagnosis
    #[serde(default = "default_output_lines")]
    pub output_lines: usize,

    /// Tag of the inbound whose port serves the stats endpoint
    #[serde(default = "default_control_tag")]
    pub control_tag: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            config_path: default_config_path(),
            run_args: default_run_args(),
            version_args: default_version_args(),
            monitor_interval_ms: default_monitor_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            output_lines: default_output_lines(),
            control_tag: default_control_tag(),
        }
    }
}

impl ProcessConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Run arguments with the config path substituted
    pub fn resolved_run_args(&self) -> Vec<String> {
        let config = self.config_path.to_string_lossy();
        self.run_args
            .iter()
            .map(|arg| arg.replace("{config}", &config))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TuningConfig {
    /// Per-connection buffer size in KiB
    #[serde(default = "default_buffer_size")]
    pub buffer_size_kb: u32,

    #[serde(default = "default_handshake")]
    pub handshake_secs: u32,

    /// Idle timeout before a connection is closed
    #[serde(default = "default_conn_idle")]
    pub conn_idle_secs: u32,

    #[serde(default = "default_uplink_only")]
    pub uplink_only_secs: u32,

    #[serde(default = "default_downlink_only")]
    pub downlink_only_secs: u32,

    #[serde(default = "default_true")]
    pub tcp_fast_open: bool,

    /// TCP keep-alive probe interval in seconds (0 leaves the OS default)
    #[serde(default = "default_keep_alive")]
    pub tcp_keep_alive_interval_secs: u32,

    #[serde(default = "default_true")]
    pub tcp_no_delay: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            buffer_size_kb: default_buffer_size(),
            handshake_secs: default_handshake(),
            conn_idle_secs: default_conn_idle(),
            uplink_only_secs: default_uplink_only(),
            downlink_only_secs: default_downlink_only(),
            tcp_fast_open: true,
            tcp_keep_alive_interval_secs: default_keep_alive(),
            tcp_no_delay: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrationConfig {
    /// Base URL of the registration API
    #[serde(default = "default_registration_url")]
    pub base_url: String,

    /// Value of the client-version header sent with every call
    #[serde(default = "default_client_version")]
    pub client_version: String,

    #[serde(default = "default_device_model")]
    pub device_model: String,

    /// Device name announced on registration (default: $HOSTNAME)
    pub device_name: Option<String>,

    /// Tag of the outbound built from the credential
    #[serde(default = "default_outbound_tag")]
    pub outbound_tag: String,

    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Worker threads of the registration outbound
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Peer used when no remote configuration has been cached yet
    #[serde(default = "default_peer_public_key")]
    pub peer_public_key: String,

    #[serde(default = "default_peer_endpoint")]
    pub peer_endpoint: String,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Maximum idle connections kept to the registration host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            base_url: default_registration_url(),
            client_version: default_client_version(),
            device_model: default_device_model(),
            device_name: None,
            outbound_tag: default_outbound_tag(),
            mtu: default_mtu(),
            workers: default_workers(),
            peer_public_key: default_peer_public_key(),
            peer_endpoint: default_peer_endpoint(),
            retry: RetryConfig::default(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl RegistrationConfig {
    pub fn device_name(&self) -> String {
        self.device_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "relayctl".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Ceiling for a single backoff sleep
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Jitter as a fraction of the base delay (0.0 to 1.0)
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Timeout of a single attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_retries: default_max_retries(),
            max_backoff_ms: default_max_backoff(),
            jitter_fraction: default_jitter_fraction(),
            attempt_timeout_ms: default_attempt_timeout(),
        }
    }
}

/// What to do with a client that has no usage record yet
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MissingRecordPolicy {
    /// Keep the client, assume it is active
    #[default]
    Keep,
    /// Drop the client until a record exists
    Drop,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub missing_record: MissingRecordPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrafficConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    2053
}

fn default_database_path() -> PathBuf {
    PathBuf::from("relayctl.db")
}

fn default_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/xray")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("relay-config.json")
}

fn default_run_args() -> Vec<String> {
    vec!["run".to_string(), "-c".to_string(), "{config}".to_string()]
}

fn default_version_args() -> Vec<String> {
    vec!["version".to_string()]
}

fn default_monitor_interval() -> u64 {
    5000
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_output_lines() -> usize {
    100
}

fn default_control_tag() -> String {
    "api".to_string()
}

fn default_buffer_size() -> u32 {
    512
}

fn default_handshake() -> u32 {
    8
}

fn default_conn_idle() -> u32 {
    300
}

fn default_uplink_only() -> u32 {
    1
}

fn default_downlink_only() -> u32 {
    1
}

fn default_keep_alive() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_registration_url() -> String {
    "https://api.cloudflareclient.com/v0a2158".to_string()
}

fn default_client_version() -> String {
    "a-7.21-0721".to_string()
}

fn default_device_model() -> String {
    "relayctl".to_string()
}

fn default_outbound_tag() -> String {
    "registration".to_string()
}

fn default_mtu() -> u32 {
    1420
}

fn default_workers() -> u32 {
    2
}

fn default_peer_public_key() -> String {
    "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=".to_string()
}

fn default_peer_endpoint() -> String {
    "engage.cloudflareclient.com:2408".to_string()
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_jitter_fraction() -> f64 {
    0.5
}

fn default_attempt_timeout() -> u64 {
    10_000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.process.monitor_interval_ms == 0 {
            anyhow::bail!("process.monitor_interval_ms must be greater than zero");
        }
        if self.process.run_args.iter().all(|a| !a.contains("{config}")) {
            anyhow::bail!("process.run_args must reference the config file via '{{config}}'");
        }
        if !(0.0..=1.0).contains(&self.registration.retry.jitter_fraction) {
            anyhow::bail!("registration.retry.jitter_fraction must be between 0.0 and 1.0");
        }
        if self.registration.retry.attempt_timeout_ms == 0 {
            anyhow::bail!("registration.retry.attempt_timeout_ms must be greater than zero");
        }
        if self.registration.retry.max_backoff_ms < self.registration.retry.base_delay_ms {
            anyhow::bail!("registration.retry.max_backoff_ms must not be below base_delay_ms");
        }
        if self.traffic.poll_interval_secs == 0 {
            anyhow::bail!("traffic.poll_interval_secs must be greater than zero");
        }
        Ok(())
    }
}
