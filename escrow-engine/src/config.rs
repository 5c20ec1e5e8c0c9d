//! Engine configuration
//!
//! Loaded from an optional TOML file layered under `GIGESCROW_*`
//! environment variables (`__` separates nested keys, e.g.
//! `GIGESCROW_DATABASE__URL`).

use serde::Deserialize;
use std::fmt;

use crate::{
    coordinator::CoordinatorConfig, error::EscrowError, ledger::LedgerClientConfig,
    store::DatabaseConfig, sweeper::SweeperConfig, tx_builder::MAX_REFUND_WINDOW_DAYS,
    EscrowResult,
};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "gigescrow";

const ENV_PREFIX: &str = "GIGESCROW";

#[derive(Clone, Deserialize)]
pub struct EngineConfig {
    /// Secret the fulfillment vault key is derived from
    #[serde(default)]
    pub encryption_key: String,
    /// Postgres settings; the in-memory store is used without them
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub ledger: LedgerClientConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("encryption_key", &"<redacted>")
            .field(
                "database",
                &self.database.as_ref().map(DatabaseConfig::url_masked),
            )
            .field("ledger", &self.ledger)
            .field("sweeper", &self.sweeper)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl EngineConfig {
    /// Load from `path` (or `gigescrow.toml` if present) and the environment
    pub fn load(path: Option<&str>) -> EscrowResult<Self> {
        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let builder = config::Config::builder().add_source(file).add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Self::from_builder(builder)
    }

    /// Parse an inline TOML document, without consulting the environment
    pub fn from_toml(source: &str) -> EscrowResult<Self> {
        Self::from_builder(config::Config::builder().add_source(config::File::from_str(
            source,
            config::FileFormat::Toml,
        )))
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> EscrowResult<Self> {
        let engine: Self = builder
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| EscrowError::config(e.to_string()))?;

        engine.validate()?;
        Ok(engine)
    }

    /// Reject settings the engine cannot start with
    pub fn validate(&self) -> EscrowResult<()> {
        if self.encryption_key.trim().is_empty() {
            return Err(EscrowError::config(format!(
                "encryption_key is required (set {ENV_PREFIX}_ENCRYPTION_KEY)"
            )));
        }
        if !(1..=MAX_REFUND_WINDOW_DAYS).contains(&self.coordinator.refund_window_days) {
            return Err(EscrowError::config(format!(
                "coordinator.refund_window_days must be between 1 and {MAX_REFUND_WINDOW_DAYS}"
            )));
        }
        if let Some(db) = &self.database {
            if db.url.is_empty() {
                return Err(EscrowError::config("database.url is empty"));
            }
            if db.min_connections > db.max_connections {
                return Err(EscrowError::config(
                    "database.min_connections exceeds max_connections",
                ));
            }
        }
        Ok(())
    }
}
