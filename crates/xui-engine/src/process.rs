//! Xray engine process
//!
//! One [`XrayProcess`] per synthesized config. It writes the config file,
//! spawns the engine, keeps its recent output and records how it exited.

use crate::config::SynthesizedConfig;
use crate::error::{EngineError, EngineResult};
use crate::traffic::{parse_stats, TrafficReport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines of engine output kept for diagnostics
pub const OUTPUT_MAX_LINES: usize = 100;

/// Reported when the version probe fails
pub const UNKNOWN_VERSION: &str = "Unknown";

/// Where the engine lives and how to talk to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Xray binary
    pub binary_path: PathBuf,
    /// Config file written before every start
    pub config_path: PathBuf,
    /// How long to wait for the engine to exit after a kill
    pub stop_timeout_secs: u64,
    /// Host the stats API listens on
    pub api_host: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("bin/xray-linux-amd64"),
            config_path: PathBuf::from("bin/config.json"),
            stop_timeout_secs: 5,
            api_host: "127.0.0.1".into(),
        }
    }
}

impl EngineSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// A running (or runnable) engine instance (abstracted for testing)
#[async_trait]
pub trait EngineProcess: Send + Sync {
    /// Write the config and spawn the engine
    async fn start(&self) -> EngineResult<()>;

    /// Kill the engine and wait for it to exit
    async fn stop(&self) -> EngineResult<()>;

    fn is_running(&self) -> bool;

    /// Why the engine exited on its own, if it did
    fn last_error(&self) -> Option<EngineError>;

    /// Recent output, or the exit error when there was none
    fn result(&self) -> String;

    async fn version(&self) -> String;

    /// Read and reset the engine's traffic counters
    async fn traffic(&self) -> EngineResult<TrafficReport>;
}

/// Creates engine processes for a config
pub trait ProcessLauncher: Send + Sync {
    fn create(&self, config: Arc<SynthesizedConfig>) -> Box<dyn EngineProcess>;
}

/// Bounded ring of output lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    lines: Mutex<VecDeque<String>>,
}

impl LineBuffer {
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        lines.push_back(line);
        while lines.len() > OUTPUT_MAX_LINES {
            lines.pop_front();
        }
    }

    pub fn joined(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// Version from the first line of `xray -version`, e.g. `Xray 1.8.4 (...)`
pub fn parse_version(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)
        .map(String::from)
}

fn exit_message(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

#[derive(Debug, Default)]
struct ExitState {
    running: bool,
    exit_error: Option<String>,
}

struct Watcher {
    /// Taken by the first stop attempt
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Engine process backed by the Xray binary
pub struct XrayProcess {
    config: Arc<SynthesizedConfig>,
    settings: EngineSettings,
    output: Arc<LineBuffer>,
    state: Arc<Mutex<ExitState>>,
    watcher: tokio::sync::Mutex<Option<Watcher>>,
}

impl XrayProcess {
    pub fn new(config: Arc<SynthesizedConfig>, settings: EngineSettings) -> Self {
        Self {
            config,
            settings,
            output: Arc::new(LineBuffer::default()),
            state: Arc::new(Mutex::new(ExitState::default())),
            watcher: tokio::sync::Mutex::new(None),
        }
    }

    async fn write_config(&self) -> EngineResult<()> {
        let doc = self.config.to_engine_json()?;
        let content = serde_json::to_string_pretty(&doc)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;

        if let Some(parent) = self.settings.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.settings.config_path, content).await?;
        Ok(())
    }

    fn capture<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let output = self.output.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                output.push(line);
            }
        });
    }

    fn watch(&self, mut child: Child) -> Watcher {
        let (kill_tx, kill_rx) = oneshot::channel();
        let state = self.state.clone();

        let task = tokio::spawn(async move {
            let mut killed = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    killed = true;
                    if let Err(e) = child.start_kill() {
                        warn!("failed to kill xray: {}", e);
                    }
                    child.wait().await
                }
            };

            let mut state = state.lock();
            state.running = false;
            match status {
                Ok(status) if status.success() || killed => {}
                Ok(status) => {
                    let message = exit_message(status);
                    warn!("xray exited: {}", message);
                    state.exit_error = Some(message);
                }
                Err(e) => state.exit_error = Some(e.to_string()),
            }
        });

        Watcher {
            kill_tx: Some(kill_tx),
            task,
        }
    }
}

async fn probe_version(binary: &Path) -> Option<String> {
    let output = Command::new(binary).arg("-version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    parse_version(&String::from_utf8_lossy(&output.stdout))
}

#[async_trait]
impl EngineProcess for XrayProcess {
    async fn start(&self) -> EngineResult<()> {
        let mut watcher = self.watcher.lock().await;
        if self.is_running() {
            return Ok(());
        }

        self.write_config().await?;

        let mut child = Command::new(&self.settings.binary_path)
            .arg("-c")
            .arg(&self.settings.config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        if let Some(stdout) = child.stdout.take() {
            self.capture(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.capture(stderr);
        }

        *self.state.lock() = ExitState {
            running: true,
            exit_error: None,
        };
        info!(pid = ?child.id(), "xray started");
        *watcher = Some(self.watch(child));
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        let mut slot = self.watcher.lock().await;
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let Some(mut watcher) = slot.take() else {
            return Err(EngineError::NotRunning);
        };

        // The watcher may have just seen the exit; the send then fails harmlessly.
        if let Some(kill_tx) = watcher.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        let timeout = self.settings.stop_timeout();
        match tokio::time::timeout(timeout, &mut watcher.task).await {
            Ok(Ok(())) => {
                info!("xray stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                // Watcher is gone, so nobody owns the child any more.
                let mut state = self.state.lock();
                state.running = false;
                state.exit_error = Some(format!("process watcher failed: {}", e));
                Err(EngineError::Terminate(e.to_string()))
            }
            Err(_) => {
                // Still running: keep the watcher so a later stop can wait again.
                *slot = Some(watcher);
                Err(EngineError::Terminate(format!(
                    "no exit within {:?}",
                    timeout
                )))
            }
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn last_error(&self) -> Option<EngineError> {
        self.state.lock().exit_error.clone().map(EngineError::Exited)
    }

    fn result(&self) -> String {
        if self.output.is_empty() {
            return self.state.lock().exit_error.clone().unwrap_or_default();
        }
        self.output.joined()
    }

    async fn version(&self) -> String {
        probe_version(&self.settings.binary_path)
            .await
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
    }

    async fn traffic(&self) -> EngineResult<TrafficReport> {
        let port = self
            .config
            .api_port()
            .ok_or_else(|| EngineError::Telemetry("no api inbound configured".into()))?;
        let server = format!("--server={}:{}", self.settings.api_host, port);

        let output = Command::new(&self.settings.binary_path)
            .args(["api", "statsquery", server.as_str(), "-reset"])
            .output()
            .await
            .map_err(|e| EngineError::Telemetry(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Telemetry(stderr.trim().to_string()));
        }

        let report = parse_stats(&String::from_utf8_lossy(&output.stdout))?;
        debug!(
            inbounds = report.inbounds.len(),
            clients = report.clients.len(),
            "traffic collected"
        );
        Ok(report)
    }
}

/// Launches [`XrayProcess`] instances with shared settings
#[derive(Debug, Clone, Default)]
pub struct XrayLauncher {
    settings: EngineSettings,
}

impl XrayLauncher {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }
}

impl ProcessLauncher for XrayLauncher {
    fn create(&self, config: Arc<SynthesizedConfig>) -> Box<dyn EngineProcess> {
        Box::new(XrayProcess::new(config, self.settings.clone()))
    }
}
