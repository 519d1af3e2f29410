//! Engine supervisor
//!
//! Owns at most one engine handle. Restarts are serialized by a lifecycle
//! lock; status reads go through a lock-free swap cell and never wait on a
//! restart in progress.

use crate::config::SynthesizedConfig;
use crate::error::{EngineError, EngineResult};
use crate::process::{EngineProcess, ProcessLauncher, UNKNOWN_VERSION};
use crate::synth::ConfigSynthesizer;
use crate::traffic::TrafficReport;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observable engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Running,
    Crashed { error: String },
}

/// A started (or attempted) engine and the config it runs
struct EngineHandle {
    config: Arc<SynthesizedConfig>,
    process: Box<dyn EngineProcess>,
    /// First non-empty output seen once the process is down
    result: Mutex<Option<String>>,
    /// Set when the process never came up
    start_error: Mutex<Option<String>>,
}

impl EngineHandle {
    fn new(config: Arc<SynthesizedConfig>, process: Box<dyn EngineProcess>) -> Self {
        Self {
            config,
            process,
            result: Mutex::new(None),
            start_error: Mutex::new(None),
        }
    }

    fn result(&self) -> String {
        if self.process.is_running() {
            return String::new();
        }
        let mut cached = self.result.lock();
        if let Some(result) = cached.as_ref() {
            return result.clone();
        }
        // Output may still be draining after exit; only a non-empty result sticks.
        let result = self.process.result();
        if !result.is_empty() {
            *cached = Some(result.clone());
        }
        result
    }

    fn error(&self) -> Option<String> {
        if let Some(e) = self.start_error.lock().clone() {
            return Some(e);
        }
        self.process.last_error().map(|e| e.to_string())
    }
}

/// Keeps the engine running the latest synthesized config
pub struct Supervisor {
    synthesizer: ConfigSynthesizer,
    launcher: Arc<dyn ProcessLauncher>,
    current: ArcSwapOption<EngineHandle>,
    lifecycle: tokio::sync::Mutex<()>,
    need_restart: AtomicBool,
}

impl Supervisor {
    pub fn new(synthesizer: ConfigSynthesizer, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            synthesizer,
            launcher,
            current: ArcSwapOption::empty(),
            lifecycle: tokio::sync::Mutex::new(()),
            need_restart: AtomicBool::new(false),
        }
    }

    /// Rebuild the config and restart the engine if it changed, is down,
    /// or `force` is set.
    ///
    /// A failed build leaves the running engine untouched.
    pub async fn restart_if_needed(&self, force: bool) -> EngineResult<()> {
        let _guard = self.lifecycle.lock().await;

        let config = self.synthesizer.build().await?;
        let previous = self.current.load_full();

        if let Some(handle) = &previous {
            if !force && handle.process.is_running() && handle.config.equals(&config) {
                debug!("config unchanged, xray restart not needed");
                return Ok(());
            }
        }

        let mut stop_error = None;
        if let Some(handle) = previous.as_ref().filter(|h| h.process.is_running()) {
            if let Err(e) = handle.process.stop().await {
                warn!("failed to stop xray before restart: {}", e);
                stop_error = Some(e);
            }
        }

        let config = Arc::new(config);
        let handle = Arc::new(EngineHandle::new(
            config.clone(),
            self.launcher.create(config),
        ));
        self.current.store(Some(handle.clone()));

        if let Err(e) = handle.process.start().await {
            warn!("failed to start xray: {}", e);
            match previous.filter(|h| h.process.is_running()) {
                Some(previous) => {
                    warn!("previous xray instance still running, keeping it");
                    self.current.store(Some(previous));
                }
                None => *handle.start_error.lock() = Some(e.to_string()),
            }
            return Err(match stop_error {
                Some(stop) => EngineError::RestartFailed {
                    stop: Box::new(stop),
                    start: Box::new(e),
                },
                None => e,
            });
        }

        info!(inbounds = handle.config.inbounds.len(), "xray restarted");
        match stop_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop the engine
    pub async fn stop(&self) -> EngineResult<()> {
        let _guard = self.lifecycle.lock().await;
        match self.current.load_full() {
            Some(handle) if handle.process.is_running() => handle.process.stop().await,
            _ => Err(EngineError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .load_full()
            .map(|h| h.process.is_running())
            .unwrap_or(false)
    }

    pub async fn version(&self) -> String {
        match self.current.load_full() {
            Some(handle) => handle.process.version().await,
            None => UNKNOWN_VERSION.to_string(),
        }
    }

    /// Why the current engine is down, if it failed
    pub fn last_error(&self) -> Option<String> {
        self.current.load_full().and_then(|h| h.error())
    }

    /// Output of the last engine run; empty while it is running
    pub fn last_result(&self) -> String {
        self.current
            .load_full()
            .map(|h| h.result())
            .unwrap_or_default()
    }

    pub fn state(&self) -> EngineState {
        let Some(handle) = self.current.load_full() else {
            return EngineState::Stopped;
        };
        if handle.process.is_running() {
            return EngineState::Running;
        }
        match handle.error() {
            Some(error) => EngineState::Crashed { error },
            None => EngineState::Stopped,
        }
    }

    /// Config the current engine was started with
    pub fn current_config(&self) -> Option<Arc<SynthesizedConfig>> {
        self.current.load_full().map(|h| h.config.clone())
    }

    /// Read and reset traffic counters of the running engine
    pub async fn traffic(&self) -> EngineResult<TrafficReport> {
        match self.current.load_full() {
            Some(handle) if handle.process.is_running() => handle.process.traffic().await,
            _ => Err(EngineError::NotRunning),
        }
    }

    pub fn set_to_need_restart(&self) {
        self.need_restart.store(true, Ordering::SeqCst);
    }

    /// Consume the restart request, if any
    pub fn is_need_restart_and_set_false(&self) -> bool {
        self.need_restart
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockLauncher;
    use super::*;
    use crate::error::StoreError;
    use crate::model::{InboundRecord, Protocol};
    use crate::store::{InboundStore, MemoryStore};
    use crate::template::StaticTemplate;
    use async_trait::async_trait;

    fn setup() -> (Supervisor, Arc<MemoryStore>, MockLauncher) {
        let store = Arc::new(MemoryStore::new(vec![InboundRecord::new(
            "in1",
            443,
            Protocol::Vless,
        )]));
        let launcher = MockLauncher::default();
        let synth = ConfigSynthesizer::new(store.clone(), Arc::new(StaticTemplate::default()));
        (
            Supervisor::new(synth, Arc::new(launcher.clone())),
            store,
            launcher,
        )
    }

    #[tokio::test]
    async fn test_unchanged_config_restarts_once() {
        let (supervisor, _, launcher) = setup();

        supervisor.restart_if_needed(false).await.unwrap();
        supervisor.restart_if_needed(false).await.unwrap();

        assert_eq!(launcher.created(), 1);
        assert!(supervisor.is_running());
        assert_eq!(supervisor.state(), EngineState::Running);
    }

    #[tokio::test]
    async fn test_force_always_restarts() {
        let (supervisor, _, launcher) = setup();

        supervisor.restart_if_needed(true).await.unwrap();
        supervisor.restart_if_needed(true).await.unwrap();

        assert_eq!(launcher.created(), 2);
        assert_eq!(launcher.controls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_config_change_triggers_restart() {
        let (supervisor, store, launcher) = setup();
        supervisor.restart_if_needed(false).await.unwrap();

        store.update(|records| records[0].port = 8443);
        supervisor.restart_if_needed(false).await.unwrap();

        assert_eq!(launcher.created(), 2);
        let config = supervisor.current_config().unwrap();
        assert_eq!(config.inbounds[1].port, 8443);
    }

    #[tokio::test]
    async fn test_stopped_engine_is_restarted() {
        let (supervisor, _, launcher) = setup();
        supervisor.restart_if_needed(false).await.unwrap();
        supervisor.stop().await.unwrap();

        supervisor.restart_if_needed(false).await.unwrap();
        assert_eq!(launcher.created(), 2);
    }

    #[tokio::test]
    async fn test_last_result_sticky_until_restart() {
        let (supervisor, _, launcher) = setup();
        assert_eq!(supervisor.last_result(), "");

        supervisor.restart_if_needed(false).await.unwrap();
        assert_eq!(supervisor.last_result(), "");

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.last_result(), "started");

        *launcher.latest().output.lock() = "later output".into();
        assert_eq!(supervisor.last_result(), "started");

        supervisor.restart_if_needed(false).await.unwrap();
        assert_eq!(supervisor.last_result(), "");
    }

    #[tokio::test]
    async fn test_empty_result_is_not_cached() {
        let (supervisor, _, launcher) = setup();
        supervisor.restart_if_needed(false).await.unwrap();
        let engine = launcher.latest();
        engine.output.lock().clear();

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.last_result(), "");

        // Output drained after the exit was observed.
        *engine.output.lock() = "late crash output".into();
        assert_eq!(supervisor.last_result(), "late crash output");

        *engine.output.lock() = "even later".into();
        assert_eq!(supervisor.last_result(), "late crash output");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_restarts_are_serialized() {
        let (supervisor, _, launcher) = setup();
        let supervisor = Arc::new(supervisor);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let supervisor = supervisor.clone();
                tokio::spawn(async move { supervisor.restart_if_needed(false).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(launcher.created(), 1);
        assert_eq!(launcher.controls.stops.load(Ordering::SeqCst), 0);

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        supervisor.restart_if_needed(true).await
                    } else {
                        supervisor.stop().await.or_else(|e| match e {
                            EngineError::NotRunning => Ok(()),
                            other => Err(other),
                        })
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // At most one engine is ever left running.
        let running = launcher
            .controls
            .processes
            .lock()
            .iter()
            .filter(|p| p.running.load(Ordering::SeqCst))
            .count();
        assert!(running <= 1);
        assert_eq!(running == 1, supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_without_engine() {
        let (supervisor, _, _) = setup();
        assert!(matches!(supervisor.stop().await, Err(EngineError::NotRunning)));

        supervisor.restart_if_needed(false).await.unwrap();
        supervisor.stop().await.unwrap();
        assert!(matches!(supervisor.stop().await, Err(EngineError::NotRunning)));
        assert_eq!(supervisor.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_version_and_traffic() {
        let (supervisor, _, _) = setup();
        assert_eq!(supervisor.version().await, UNKNOWN_VERSION);
        assert!(matches!(supervisor.traffic().await, Err(EngineError::NotRunning)));

        supervisor.restart_if_needed(false).await.unwrap();
        assert_eq!(supervisor.version().await, "1.8.4");
        assert_eq!(supervisor.traffic().await.unwrap().inbounds[0].down, 2);
    }

    #[test]
    fn test_restart_flag_consumed_once() {
        let (supervisor, _, _) = setup();
        assert!(!supervisor.is_need_restart_and_set_false());

        supervisor.set_to_need_restart();
        supervisor.set_to_need_restart();
        assert!(supervisor.is_need_restart_and_set_false());
        assert!(!supervisor.is_need_restart_and_set_false());
    }

    #[tokio::test]
    async fn test_crash_reported() {
        let (supervisor, _, launcher) = setup();
        supervisor.restart_if_needed(false).await.unwrap();

        launcher.latest().crash("exit status 1");

        assert!(!supervisor.is_running());
        assert_eq!(
            supervisor.state(),
            EngineState::Crashed {
                error: "exit status 1".into()
            }
        );
        assert_eq!(supervisor.last_error().as_deref(), Some("exit status 1"));
    }

    #[tokio::test]
    async fn test_failed_start_keeps_previous_engine() {
        let (supervisor, _, launcher) = setup();
        supervisor.restart_if_needed(false).await.unwrap();
        let first = launcher.latest();

        launcher.controls.fail_stop.store(true, Ordering::SeqCst);
        launcher.controls.fail_start.store(true, Ordering::SeqCst);

        let err = supervisor.restart_if_needed(true).await.unwrap_err();
        match &err {
            EngineError::RestartFailed { stop, start } => {
                assert!(matches!(**stop, EngineError::Terminate(_)));
                assert!(matches!(**start, EngineError::Spawn(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("stuck"));
        assert_eq!(launcher.created(), 2);

        // The survivor is still the handle we talk to.
        assert!(supervisor.is_running());
        assert!(first.running.load(Ordering::SeqCst));
        launcher.controls.fail_stop.store(false, Ordering::SeqCst);
        supervisor.stop().await.unwrap();
        assert!(!first.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_start_without_survivor_is_crash() {
        let (supervisor, _, launcher) = setup();
        launcher.controls.fail_start.store(true, Ordering::SeqCst);

        assert!(supervisor.restart_if_needed(false).await.is_err());
        assert!(matches!(supervisor.state(), EngineState::Crashed { .. }));
        assert!(supervisor.last_error().unwrap().contains("xray binary missing"));
    }

    #[tokio::test]
    async fn test_stop_error_surfaced_after_start() {
        let (supervisor, _, launcher) = setup();
        supervisor.restart_if_needed(false).await.unwrap();
        launcher.controls.fail_stop.store(true, Ordering::SeqCst);

        let err = supervisor.restart_if_needed(true).await.unwrap_err();
        assert!(matches!(err, EngineError::Terminate(_)));
        assert!(supervisor.is_running());
        assert_eq!(launcher.created(), 2);
    }

    struct BrokenStore;

    #[async_trait]
    impl InboundStore for BrokenStore {
        async fn disable_invalid_clients(&self) -> Result<usize, StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }

        async fn all_inbounds(&self) -> Result<Vec<InboundRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_build_failure_touches_nothing() {
        let launcher = MockLauncher::default();
        let synth = ConfigSynthesizer::new(Arc::new(BrokenStore), Arc::new(StaticTemplate::default()));
        let supervisor = Supervisor::new(synth, Arc::new(launcher.clone()));

        let err = supervisor.restart_if_needed(true).await.unwrap_err();
        assert!(err.is_build_error());
        assert_eq!(launcher.created(), 0);
        assert_eq!(supervisor.state(), EngineState::Stopped);
    }
}
