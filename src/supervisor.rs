//! Relay process supervision
//!
//! The [`Supervisor`] owns the single relay instance. `restart` and `stop`
//! run under one lifecycle lock; read-only queries never take it and may see
//! a transient "not running" answer while a restart is in flight.
//!
//! Every started instance gets its own monitor task and its own cancel
//! channel. When the monitor sees its instance die it records the cause,
//! hands recovery to a separate task and exits. Recovery only proceeds if
//! the supervisor is still `Crashed` on the same instance, so a `stop` or a
//! manual restart issued in between wins.

use crate::config::ProcessConfig;
use crate::error::{ControlError, ProcessFailure, Result};
use crate::process::{RelayProcess, UNKNOWN_VERSION};
use crate::schema::RelayConfig;
use crate::synth::ConfigSource;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No relay process (initial state)
    Stopped,
    /// A process is being spawned
    Starting,
    /// The current process is alive
    Running,
    /// The current process died or failed to start
    Crashed,
}

/// Process-wide "configuration is stale" flag
#[derive(Debug, Default)]
pub struct RestartFlag(AtomicBool);

impl RestartFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear the flag, returning whether it was set.
    ///
    /// Exactly one concurrent caller observes `true` per `mark_dirty`.
    pub fn consume_if_dirty(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_dirty(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Snapshot of the supervisor for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub running: bool,
    pub pid: Option<u32>,
    pub version: String,
    pub last_error: Option<ProcessFailure>,
    pub last_result: String,
}

/// The live relay instance and the cancel signal of its monitor
struct Instance {
    process: Arc<RelayProcess>,
    cancel: watch::Sender<bool>,
}

/// Owner of the relay process lifecycle.
///
/// Like other long-lived services here it is constructed behind an `Arc`;
/// methods that spawn background tasks take `self: &Arc<Self>`.
pub struct Supervisor {
    source: Arc<dyn ConfigSource>,
    settings: ProcessConfig,
    /// Serializes restart and stop
    lifecycle: Mutex<()>,
    current: RwLock<Option<Instance>>,
    state: RwLock<SupervisorState>,
    last_error: RwLock<Option<ProcessFailure>>,
    last_result: RwLock<String>,
    /// Id of the most recently started instance
    generation: AtomicU64,
    restart_flag: RestartFlag,
}

impl Supervisor {
    pub fn new(source: Arc<dyn ConfigSource>, settings: ProcessConfig) -> Arc<Self> {
        Arc::new(Self {
            source,
            settings,
            lifecycle: Mutex::new(()),
            current: RwLock::new(None),
            state: RwLock::new(SupervisorState::Stopped),
            last_error: RwLock::new(None),
            last_result: RwLock::new(String::new()),
            generation: AtomicU64::new(0),
            restart_flag: RestartFlag::new(),
        })
    }

    /// Apply a freshly synthesized configuration.
    ///
    /// Without `force`, a running relay whose configuration is unchanged is
    /// left alone.
    pub async fn restart(self: &Arc<Self>, force: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.restart_locked(force).await
    }

    async fn restart_locked(self: &Arc<Self>, force: bool) -> Result<()> {
        let config = Arc::new(self.source.synthesize()?);

        if !force {
            let running_config = self
                .current
                .read()
                .as_ref()
                .filter(|i| i.process.is_running())
                .map(|i| Arc::clone(i.process.config()));
            if running_config.is_some_and(|running| *running == *config) {
                debug!("Relay configuration unchanged, skipping restart");
                return Ok(());
            }
        }

        let old = self.current.write().take();
        if let Some(old) = old {
            let _ = old.cancel.send(true);
            if let Err(e) = old.process.stop().await {
                warn!(id = old.process.id(), error = %e, "Failed to stop previous relay, starting anyway");
            }
            *self.last_result.write() = old.process.result();
        }

        *self.state.write() = SupervisorState::Starting;
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match RelayProcess::start(id, config, &self.settings).await {
            Ok(process) => {
                let process = Arc::new(process);
                let (cancel_tx, cancel_rx) = watch::channel(false);
                *self.current.write() = Some(Instance {
                    process: Arc::clone(&process),
                    cancel: cancel_tx,
                });
                *self.state.write() = SupervisorState::Running;
                info!(id, pid = process.pid(), "Relay started");

                self.spawn_monitor(process, cancel_rx);
                Ok(())
            }
            Err(e) => {
                error!(id, error = %e, "Failed to start relay");
                *self.last_error.write() = Some(ProcessFailure::StartFailed {
                    message: e.to_string(),
                });
                *self.state.write() = SupervisorState::Crashed;
                Err(e)
            }
        }
    }

    /// Stop the relay and its monitor
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let instance = self.current.write().take();
        match instance {
            Some(instance) if instance.process.is_running() => {
                let _ = instance.cancel.send(true);
                let result = instance.process.stop().await;
                *self.last_result.write() = instance.process.result();
                *self.state.write() = SupervisorState::Stopped;
                if result.is_ok() {
                    info!(id = instance.process.id(), "Relay stopped");
                }
                result
            }
            other => {
                if let Some(instance) = other {
                    let _ = instance.cancel.send(true);
                    if let Err(e) = instance.process.stop().await {
                        warn!(id = instance.process.id(), error = %e, "Failed to clean up exited relay");
                    }
                    *self.last_result.write() = instance.process.result();
                }
                // A crashed relay is observed here; pending recovery is dropped
                *self.state.write() = SupervisorState::Stopped;
                Err(ControlError::NotRunning)
            }
        }
    }

    /// Watch `process` until it dies or the cancel signal fires
    fn spawn_monitor(self: &Arc<Self>, process: Arc<RelayProcess>, mut cancel: watch::Receiver<bool>) {
        let supervisor = Arc::clone(self);
        let interval = self.settings.monitor_interval();

        tokio::spawn(async move {
            let id = process.id();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            debug!(id, "Relay monitor cancelled");
                            return;
                        }
                        continue;
                    }
                }

                if process.is_running() {
                    continue;
                }
                if *cancel.borrow() {
                    debug!(id, "Relay exited after cancellation, not restarting");
                    return;
                }
                if supervisor.record_crash(&process) {
                    supervisor.spawn_recovery(id);
                }
                return;
            }
        });
    }

    /// Mark the supervisor crashed if `process` is still the current instance
    fn record_crash(&self, process: &RelayProcess) -> bool {
        let current = self.current.read();
        if current.as_ref().map(|i| i.process.id()) != Some(process.id()) {
            return false;
        }

        let failure = process.failure().unwrap_or(ProcessFailure::Exited {
            code: None,
            signal: None,
        });
        warn!(id = process.id(), failure = %failure, "Relay is not running, restarting");

        *self.last_error.write() = Some(failure);
        *self.last_result.write() = process.result();
        *self.state.write() = SupervisorState::Crashed;
        true
    }

    fn spawn_recovery(self: &Arc<Self>, generation: u64) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.recover(generation).await;
        });
    }

    /// Restart a crashed relay until it comes back or someone else intervenes
    async fn recover(self: &Arc<Self>, mut expected: u64) {
        loop {
            let result = {
                let _guard = self.lifecycle.lock().await;
                if self.state() != SupervisorState::Crashed
                    || self.generation.load(Ordering::SeqCst) != expected
                {
                    debug!(expected, "Supervisor moved on, skipping recovery");
                    return;
                }
                self.restart_locked(true).await
            };

            match result {
                Ok(()) => {
                    info!("Relay recovered");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Failed to recover relay, retrying");
                    expected = self.generation.load(Ordering::SeqCst);
                    tokio::time::sleep(self.settings.monitor_interval()).await;
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|i| i.process.is_running())
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.read()
    }

    pub fn get_version(&self) -> String {
        self.current
            .read()
            .as_ref()
            .map(|i| i.process.version().to_string())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
    }

    /// Output tail of the last instance that stopped or crashed
    pub fn get_last_result(&self) -> String {
        self.last_result.read().clone()
    }

    /// Cause of the last crash or start failure
    pub fn get_last_error(&self) -> Option<ProcessFailure> {
        self.last_error.read().clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.read().as_ref().and_then(|i| i.process.pid())
    }

    /// Configuration the current instance was started with
    pub fn running_config(&self) -> Option<Arc<RelayConfig>> {
        self.current
            .read()
            .as_ref()
            .map(|i| Arc::clone(i.process.config()))
    }

    /// Instance id and control port of the running relay
    pub fn stats_endpoint(&self) -> Option<(u64, u16)> {
        let current = self.current.read();
        let instance = current.as_ref().filter(|i| i.process.is_running())?;
        Some((instance.process.id(), instance.process.control_port()?))
    }

    pub fn restart_flag(&self) -> &RestartFlag {
        &self.restart_flag
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state(),
            running: self.is_running(),
            pid: self.pid(),
            version: self.get_version(),
            last_error: self.get_last_error(),
            last_result: self.get_last_result(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FailingSource;

    impl ConfigSource for FailingSource {
        fn synthesize(&self) -> Result<RelayConfig> {
            let err = serde_json::from_str::<RelayConfig>("{").unwrap_err();
            Err(ControlError::TemplateParse(err))
        }
    }

    #[test]
    fn test_restart_flag_consumed_once() {
        let flag = RestartFlag::new();
        assert!(!flag.consume_if_dirty());

        flag.mark_dirty();
        flag.mark_dirty();
        assert!(flag.is_dirty());
        assert!(flag.consume_if_dirty());
        assert!(!flag.consume_if_dirty());
    }

    #[test]
    fn test_restart_flag_concurrent_consumers() {
        let flag = Arc::new(RestartFlag::new());

        for _ in 0..50 {
            flag.mark_dirty();
            let consumed = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let flag = Arc::clone(&flag);
                    let consumed = Arc::clone(&consumed);
                    std::thread::spawn(move || {
                        if flag.consume_if_dirty() {
                            consumed.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(consumed.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let supervisor = Supervisor::new(Arc::new(FailingSource), ProcessConfig::default());

        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.get_version(), UNKNOWN_VERSION);
        assert!(supervisor.get_last_error().is_none());
        assert!(supervisor.stats_endpoint().is_none());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_not_running() {
        let supervisor = Supervisor::new(Arc::new(FailingSource), ProcessConfig::default());

        let err = supervisor.stop().await.unwrap_err();
        assert!(matches!(err, ControlError::NotRunning));
    }

    #[tokio::test]
    async fn test_template_error_aborts_before_process_action() {
        let supervisor = Supervisor::new(Arc::new(FailingSource), ProcessConfig::default());

        let err = supervisor.restart(false).await.unwrap_err();

        assert!(matches!(err, ControlError::TemplateParse(_)));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(supervisor.pid().is_none());
    }

    #[test]
    fn test_status_serialization() {
        let status = SupervisorStatus {
            state: SupervisorState::Crashed,
            running: false,
            pid: None,
            version: "1.8.4".into(),
            last_error: Some(ProcessFailure::Exited {
                code: Some(1),
                signal: None,
            }),
            last_result: String::new(),
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "crashed");
        assert_eq!(value["last_error"]["kind"], "exited");
        assert_eq!(value["last_error"]["code"], 1);
    }
}
