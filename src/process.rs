//! A single spawned relay process
//!
//! [`RelayProcess::start`] writes the configuration, probes the relay
//! version, spawns the child and hands it to a waiter task. The waiter either
//! observes the child exiting on its own (recorded as a [`ProcessFailure`]) or
//! receives a stop request and shuts the child down: SIGTERM first, SIGKILL
//! once the grace period is over.

use crate::config::ProcessConfig;
use crate::error::{ControlError, ProcessFailure, Result};
use crate::schema::RelayConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reported when the version probe fails
pub const UNKNOWN_VERSION: &str = "Unknown";

/// Upper bound for the version probe
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between a [`RelayProcess`] and its background tasks
struct Shared {
    running: AtomicBool,
    failure: Mutex<Option<ProcessFailure>>,
    output: Mutex<VecDeque<String>>,
    output_limit: usize,
}

impl Shared {
    fn push_line(&self, line: String) {
        let mut output = self.output.lock();
        if output.len() == self.output_limit {
            output.pop_front();
        }
        if self.output_limit > 0 {
            output.push_back(line);
        }
    }
}

/// One instance of the relay child process
pub struct RelayProcess {
    id: u64,
    pid: Option<u32>,
    version: String,
    control_port: Option<u16>,
    config: Arc<RelayConfig>,
    shared: Arc<Shared>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    waiter: Mutex<Option<JoinHandle<std::result::Result<(), String>>>>,
}

impl RelayProcess {
    /// Write `config` to disk and spawn the relay with it
    pub async fn start(id: u64, config: Arc<RelayConfig>, settings: &ProcessConfig) -> Result<Self> {
        write_config(&config, settings).await?;

        let version = probe_version(settings).await;

        let mut cmd = Command::new(&settings.binary);
        cmd.args(settings.resolved_run_args());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ControlError::StartFailed(format!("{}: {}", settings.binary.display(), e))
        })?;
        let pid = child.id();
        info!(id, pid, version = %version, "Relay process spawned");

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            failure: Mutex::new(None),
            output: Mutex::new(VecDeque::with_capacity(settings.output_lines)),
            output_limit: settings.output_lines,
        });

        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(stdout, "stdout", Arc::clone(&shared));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(stderr, "stderr", Arc::clone(&shared));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let waiter = tokio::spawn(watch_child(
            id,
            child,
            stop_rx,
            settings.shutdown_grace_period(),
            Arc::clone(&shared),
        ));

        Ok(Self {
            id,
            pid,
            version,
            control_port: config.inbound_port(&settings.control_tag),
            config,
            shared,
            stop_tx: Mutex::new(Some(stop_tx)),
            waiter: Mutex::new(Some(waiter)),
        })
    }

    /// Stop the child and wait until it is gone.
    ///
    /// Stopping a process that already exited succeeds.
    pub async fn stop(&self) -> Result<()> {
        let stop_tx = self.stop_tx.lock().take();
        if let Some(tx) = stop_tx {
            // The waiter is gone when the child already exited
            let _ = tx.send(());
        }

        let waiter = self.waiter.lock().take();
        let Some(waiter) = waiter else {
            return Ok(());
        };

        match waiter.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ControlError::StopFailed(e)),
            Err(e) => Err(ControlError::StopFailed(e.to_string())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Why the process exited on its own, if it did
    pub fn failure(&self) -> Option<ProcessFailure> {
        self.shared.failure.lock().clone()
    }

    /// Captured tail of the process output
    pub fn result(&self) -> String {
        let output = self.shared.output.lock();
        output.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Port of the inbound serving the stats endpoint
    pub fn control_port(&self) -> Option<u16> {
        self.control_port
    }

    pub fn config(&self) -> &Arc<RelayConfig> {
        &self.config
    }
}

async fn write_config(config: &RelayConfig, settings: &ProcessConfig) -> Result<()> {
    let json = config
        .to_json_pretty()
        .map_err(|e| ControlError::StartFailed(format!("failed to serialize config: {}", e)))?;

    if let Some(parent) = settings.config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            ControlError::StartFailed(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    tokio::fs::write(&settings.config_path, json).await.map_err(|e| {
        ControlError::StartFailed(format!(
            "failed to write {}: {}",
            settings.config_path.display(),
            e
        ))
    })
}

/// Run the relay's version command and take the second word of its first line
async fn probe_version(settings: &ProcessConfig) -> String {
    let output = Command::new(&settings.binary)
        .args(&settings.version_args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => {
            parse_version(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(Ok(output)) => {
            debug!(status = ?output.status, "Version probe exited with failure");
            UNKNOWN_VERSION.to_string()
        }
        Ok(Err(e)) => {
            debug!(error = %e, "Version probe could not run");
            UNKNOWN_VERSION.to_string()
        }
        Err(_) => {
            debug!("Version probe timed out");
            UNKNOWN_VERSION.to_string()
        }
    }
}

fn parse_version(stdout: &str) -> String {
    stdout
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or(UNKNOWN_VERSION)
        .to_string()
}

fn spawn_output_reader<R>(reader: R, stream: &'static str, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "relay", stream, "{}", line);
                    shared.push_line(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(stream, error = %e, "Relay output stream closed");
                    break;
                }
            }
        }
    });
}

async fn watch_child(
    id: u64,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace_period: Duration,
    shared: Arc<Shared>,
) -> std::result::Result<(), String> {
    let result = tokio::select! {
        status = child.wait() => {
            let failure = match status {
                Ok(status) => exit_failure(status),
                Err(e) => {
                    warn!(id, error = %e, "Failed to wait for relay process");
                    ProcessFailure::Exited { code: None, signal: None }
                }
            };
            warn!(id, failure = %failure, "Relay process exited");
            *shared.failure.lock() = Some(failure);
            Ok(())
        }
        _ = stop_rx => terminate(id, &mut child, grace_period).await,
    };

    shared.running.store(false, Ordering::SeqCst);
    result
}

/// SIGTERM, then SIGKILL once the grace period is over
async fn terminate(id: u64, child: &mut Child, grace_period: Duration) -> std::result::Result<(), String> {
    if let Some(pid) = child.id() {
        info!(id, pid, "Sending SIGTERM to relay");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(id, ?status, "Relay process exited gracefully");
            Ok(())
        }
        Ok(Err(e)) => Err(format!("failed to wait for relay: {}", e)),
        Err(_) => {
            warn!(
                id,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            child
                .kill()
                .await
                .map_err(|e| format!("failed to kill relay: {}", e))
        }
    }
}

fn exit_failure(status: ExitStatus) -> ProcessFailure {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    ProcessFailure::Exited {
        code: status.code(),
        signal,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    const FAKE_RELAY: &str = r#"
if [ "$1" = "version" ]; then
    echo "Relay 1.8.4 (test build)"
    exit 0
fi
echo "started with $3"
exec sleep 30
"#;

    fn settings(dir: &Path, script: &str) -> ProcessConfig {
        let script_path = dir.join("relay.sh");
        std::fs::write(&script_path, script).unwrap();
        let script_path = script_path.to_string_lossy().to_string();

        ProcessConfig {
            binary: "/bin/sh".into(),
            config_path: dir.join("conf").join("relay.json"),
            run_args: vec![script_path.clone(), "run".into(), "-c".into(), "{config}".into()],
            version_args: vec![script_path, "version".into()],
            shutdown_grace_period_secs: 1,
            ..ProcessConfig::default()
        }
    }

    fn relay_config() -> Arc<RelayConfig> {
        Arc::new(
            serde_json::from_value(json!({
                "inbounds": [{"listen": "127.0.0.1", "port": 62789, "protocol": "dokodemo-door", "tag": "api"}]
            }))
            .unwrap(),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("Xray 1.8.4 (Xray, Penetrates Everything.)\nA unified platform"), "1.8.4");
        assert_eq!(parse_version("oops"), UNKNOWN_VERSION);
        assert_eq!(parse_version(""), UNKNOWN_VERSION);
    }

    #[test]
    fn test_output_ring_buffer() {
        let shared = Shared {
            running: AtomicBool::new(true),
            failure: Mutex::new(None),
            output: Mutex::new(VecDeque::new()),
            output_limit: 2,
        };

        for line in ["a", "b", "c"] {
            shared.push_line(line.to_string());
        }

        assert_eq!(shared.output.lock().iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), FAKE_RELAY);

        let process = RelayProcess::start(1, relay_config(), &settings).await.unwrap();

        assert!(process.is_running());
        assert!(process.pid().is_some());
        assert_eq!(process.version(), "1.8.4");
        assert_eq!(process.control_port(), Some(62789));
        assert!(settings.config_path.exists());

        wait_until(|| !process.result().is_empty()).await;
        assert!(process.result().starts_with("started with"));

        process.stop().await.unwrap();
        assert!(!process.is_running());
        assert!(process.failure().is_none());

        // A second stop is harmless
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), "echo boom >&2\nexit 3\n");

        let process = RelayProcess::start(2, relay_config(), &settings).await.unwrap();
        wait_until(|| !process.is_running()).await;

        assert_eq!(process.version(), UNKNOWN_VERSION);
        assert_eq!(
            process.failure(),
            Some(ProcessFailure::Exited {
                code: Some(3),
                signal: None
            })
        );
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ProcessConfig {
            binary: dir.path().join("does-not-exist"),
            config_path: dir.path().join("relay.json"),
            ..ProcessConfig::default()
        };

        let result = RelayProcess::start(3, relay_config(), &settings).await;
        assert!(matches!(result, Err(ControlError::StartFailed(_))));
    }
}
