//! Main Escrow Node - wiring, health and shutdown
//!
//! Builds every component from an [`EngineConfig`]: the store (Postgres when
//! configured, in-memory otherwise), the fulfillment vault, the ledger
//! client, the coordinator and the expiry sweeper.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::EngineConfig,
    coordinator::{EscrowCoordinator, SweepReport},
    ledger::{JsonRpcLedgerClient, LedgerClient},
    store::{EscrowStore, MemoryStore, PgStore},
    sweeper::{ExpirySweeper, SweeperHandle},
    vault::FulfillmentVault,
    EscrowResult,
};

/// Main escrow node that owns all components
pub struct EscrowNode {
    config: EngineConfig,
    /// Store used by the coordinator
    store: Arc<dyn EscrowStore>,
    /// Same store when it is Postgres, for pool shutdown
    postgres: Option<Arc<PgStore>>,
    ledger: Arc<dyn LedgerClient>,
    coordinator: Arc<EscrowCoordinator>,
    sweeper: Arc<ExpirySweeper>,
    sweeper_handle: Mutex<Option<SweeperHandle>>,
}

impl EscrowNode {
    /// Create a node from configuration and connect to the ledger
    ///
    /// An unreachable ledger is logged and reported by
    /// [`health_check`](Self::health_check); ledger reads fail as transient
    /// until it connects.
    pub async fn new(config: EngineConfig) -> EscrowResult<Self> {
        info!("Initializing escrow node");
        config.validate()?;

        let (store, postgres): (Arc<dyn EscrowStore>, Option<Arc<PgStore>>) = match &config.database {
            Some(db) => {
                let pg = Arc::new(PgStore::connect(db).await?);
                let store: Arc<dyn EscrowStore> = pg.clone();
                (store, Some(pg))
            }
            None => {
                warn!("No database configured, using the in-memory store");
                let store: Arc<dyn EscrowStore> = Arc::new(MemoryStore::new());
                (store, None)
            }
        };

        let ledger: Arc<dyn LedgerClient> = Arc::new(JsonRpcLedgerClient::new(config.ledger.clone())?);
        if let Err(e) = ledger.connect().await {
            warn!("Ledger not reachable at startup: {}", e);
        }

        let mut node = Self::with_components(config, store, ledger, Arc::new(SystemClock))?;
        node.postgres = postgres;

        info!("Escrow node initialized successfully");
        Ok(node)
    }

    /// Assemble a node from already-built components
    pub fn with_components(
        config: EngineConfig,
        store: Arc<dyn EscrowStore>,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
    ) -> EscrowResult<Self> {
        let vault = FulfillmentVault::new(&config.encryption_key)?;
        let coordinator = Arc::new(EscrowCoordinator::new(
            config.coordinator.clone(),
            store.clone(),
            ledger.clone(),
            vault,
            clock,
        ));
        let sweeper = Arc::new(ExpirySweeper::new(coordinator.clone(), &config.sweeper));

        Ok(Self {
            config,
            store,
            postgres: None,
            ledger,
            coordinator,
            sweeper,
            sweeper_handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> Arc<EscrowCoordinator> {
        self.coordinator.clone()
    }

    pub fn ledger(&self) -> Arc<dyn LedgerClient> {
        self.ledger.clone()
    }

    /// Start the background expiry sweep; `false` if disabled or already running
    pub async fn start_sweeper(&self) -> bool {
        if !self.config.sweeper.enabled {
            info!("Expiry sweeper disabled by configuration");
            return false;
        }

        let mut handle = self.sweeper_handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        *handle = Some(self.sweeper.clone().spawn());
        true
    }

    /// One sweep outside the schedule; `None` if a run is already in progress
    pub async fn sweep_now(&self) -> EscrowResult<Option<SweepReport>> {
        self.sweeper.run_once().await
    }

    /// Health check for the escrow node
    pub async fn health_check(&self) -> EscrowResult<NodeHealth> {
        let mut issues = Vec::new();

        let store_reachable = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                issues.push(format!("Store error: {}", e));
                false
            }
        };

        let ledger_connected = self.ledger.is_connected();
        if !ledger_connected {
            issues.push("Ledger client is not connected".to_string());
        }

        let sweeper_running = self
            .sweeper_handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        if self.config.sweeper.enabled && !sweeper_running {
            issues.push("Expiry sweeper is not running".to_string());
        }

        Ok(NodeHealth {
            healthy: issues.is_empty(),
            store_reachable,
            ledger_connected,
            sweeper_running,
            issues,
            timestamp: Utc::now(),
        })
    }

    /// Stop the sweeper, disconnect the ledger and close the database pool
    pub async fn shutdown(&self) -> EscrowResult<()> {
        info!("Shutting down escrow node");

        if let Some(handle) = self.sweeper_handle.lock().await.take() {
            handle.shutdown().await?;
        }

        self.ledger.disconnect().await?;

        if let Some(pg) = &self.postgres {
            pg.close().await;
        }

        info!("Escrow node shutdown complete");
        Ok(())
    }
}

/// Node health status
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub healthy: bool,
    pub store_reachable: bool,
    pub ledger_connected: bool,
    pub sweeper_running: bool,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
