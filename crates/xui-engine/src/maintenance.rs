//! Periodic engine maintenance
//!
//! Applies pending restart requests and brings a crashed engine back.

use crate::supervisor::{EngineState, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Tick periods of the maintenance loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceIntervals {
    /// How often pending restart requests are applied
    pub restart_check: Duration,
    /// How often a crashed engine is brought back
    pub crash_check: Duration,
}

impl Default for MaintenanceIntervals {
    fn default() -> Self {
        Self {
            restart_check: Duration::from_secs(10),
            crash_check: Duration::from_secs(30),
        }
    }
}

/// Apply a pending restart request, if any
pub async fn check_restart(supervisor: &Supervisor) {
    if !supervisor.is_need_restart_and_set_false() {
        return;
    }
    if let Err(e) = supervisor.restart_if_needed(false).await {
        warn!("restart xray failed: {}", e);
    }
}

/// Restart the engine if it died on its own. An explicit stop is left alone.
pub async fn check_crash(supervisor: &Supervisor) {
    let EngineState::Crashed { error } = supervisor.state() else {
        return;
    };
    info!(%error, "xray is not running, restarting");
    if let Err(e) = supervisor.restart_if_needed(true).await {
        warn!("restart crashed xray failed: {}", e);
    }
}

/// Run the maintenance loop until `shutdown` flips to true or its sender is dropped
pub async fn run_maintenance(
    supervisor: Arc<Supervisor>,
    intervals: MaintenanceIntervals,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = Instant::now();
    let mut restart_tick = interval_at(start + intervals.restart_check, intervals.restart_check);
    let mut crash_tick = interval_at(start + intervals.crash_check, intervals.crash_check);
    restart_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    crash_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        restart_check = ?intervals.restart_check,
        crash_check = ?intervals.crash_check,
        "maintenance loop started"
    );

    loop {
        tokio::select! {
            _ = restart_tick.tick() => check_restart(&supervisor).await,
            _ = crash_tick.tick() => check_crash(&supervisor).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("maintenance loop stopped");
}
