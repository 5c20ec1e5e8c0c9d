//! Expiry Sweeper - recurring local expiry of overdue escrows
//!
//! A single owner drives the sweep on a fixed interval. Runs never overlap:
//! a tick that finds the previous run still in progress is skipped.

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info};

use crate::{
    coordinator::{EscrowCoordinator, SweepReport},
    error::EscrowError,
    EscrowResult,
};

/// Configuration for the expiry sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Seconds between sweep runs
    pub interval_secs: u64,
    /// Whether the node starts the background sweep
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            enabled: true,
        }
    }
}

pub struct ExpirySweeper {
    coordinator: Arc<EscrowCoordinator>,
    interval: Duration,
    running: Mutex<()>,
}

impl ExpirySweeper {
    pub fn new(coordinator: Arc<EscrowCoordinator>, config: &SweeperConfig) -> Self {
        Self {
            coordinator,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            running: Mutex::new(()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sweep now; `None` if another run holds the sweep
    pub async fn run_once(&self) -> EscrowResult<Option<SweepReport>> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Expiry sweep already in progress, skipping");
            return Ok(None);
        };

        self.coordinator.sweep_expired().await.map(Some)
    }

    /// Start the recurring sweep on the current runtime
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let sweeper = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!("Expiry sweeper started (every {:?})", sweeper.interval);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.run_once().await {
                            error!("Expiry sweep failed: {}", e);
                        }
                    }
                }
            }

            info!("Expiry sweeper stopped");
        });

        SweeperHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

/// Owner of a running sweep task
pub struct SweeperHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for an in-flight run to finish
    pub async fn shutdown(mut self) -> EscrowResult<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        self.task
            .await
            .map_err(|e| EscrowError::internal(format!("sweeper task failed: {e}")))
    }
}
