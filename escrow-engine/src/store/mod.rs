//! Persistence boundary
//!
//! Escrow and transaction repositories plus the two directories the engine
//! reads from external CRUD (gigs, user wallets). [`EscrowStore`] ties them
//! together and adds the composite writes that must commit or roll back as
//! one unit.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    models::{
        Escrow, EscrowFilter, EscrowStats, EscrowStatus, EscrowTransition, Gig, GigStatus,
        LedgerTransactionRecord, NewEscrow, NewLedgerTransaction, TransactionFilter,
        TransactionStats, TxStatus,
    },
    EscrowResult,
};

pub use memory::MemoryStore;
pub use postgres::{DatabaseConfig, PgStore};

/// Durable escrow records
///
/// Status changes are guarded on `status = created`: a transition on a
/// terminal escrow is a `Conflict`, never a silent no-op.
#[async_trait]
pub trait EscrowRepository: Send + Sync {
    /// Insert in `created` status; `Conflict` if the gig already has an active escrow
    async fn create(&self, escrow: NewEscrow) -> EscrowResult<Escrow>;

    async fn find_by_id(&self, id: Uuid) -> EscrowResult<Option<Escrow>>;

    /// All escrows of a gig, newest first
    async fn find_by_gig(&self, gig_id: Uuid) -> EscrowResult<Vec<Escrow>>;

    /// The gig's escrow in `created` status, if any
    async fn find_active_by_gig(&self, gig_id: Uuid) -> EscrowResult<Option<Escrow>>;

    async fn find_by_create_hash(&self, tx_hash: &str) -> EscrowResult<Option<Escrow>>;

    /// Escrows where `address` is either party, newest first
    async fn find_by_wallet(&self, address: &str, filter: &EscrowFilter) -> EscrowResult<Vec<Escrow>>;

    /// Guarded move out of `created`
    async fn update_status(
        &self,
        id: Uuid,
        status: EscrowStatus,
        release_tx_hash: Option<&str>,
    ) -> EscrowResult<Escrow>;

    async fn get_stats(&self, address: &str) -> EscrowResult<EscrowStats>;

    /// `created` escrows with `cancel_after < now`, soonest first
    async fn find_expired(&self, now: DateTime<Utc>) -> EscrowResult<Vec<Escrow>>;

    /// Administrative removal; returns whether a row was deleted
    async fn delete(&self, id: Uuid) -> EscrowResult<bool>;
}

/// Append-only ledger transaction audit log
#[async_trait]
pub trait LedgerTransactionRepository: Send + Sync {
    /// `Conflict` if the hash is already recorded
    async fn record_transaction(&self, tx: NewLedgerTransaction) -> EscrowResult<LedgerTransactionRecord>;

    async fn find_transaction(&self, id: Uuid) -> EscrowResult<Option<LedgerTransactionRecord>>;

    async fn find_transaction_by_hash(&self, tx_hash: &str) -> EscrowResult<Option<LedgerTransactionRecord>>;

    async fn find_transactions_by_gig(&self, gig_id: Uuid) -> EscrowResult<Vec<LedgerTransactionRecord>>;

    async fn find_transactions_by_wallet(
        &self,
        address: &str,
        filter: &TransactionFilter,
    ) -> EscrowResult<Vec<LedgerTransactionRecord>>;

    /// Guarded `pending -> confirmed | failed`
    async fn update_transaction_status(
        &self,
        tx_hash: &str,
        status: TxStatus,
    ) -> EscrowResult<LedgerTransactionRecord>;

    async fn get_transaction_stats(&self, address: &str) -> EscrowResult<TransactionStats>;
}

/// Gig lookup owned by external CRUD
#[async_trait]
pub trait GigDirectory: Send + Sync {
    async fn get_gig(&self, id: Uuid) -> EscrowResult<Option<Gig>>;

    async fn set_gig_status(&self, id: Uuid, status: GigStatus) -> EscrowResult<()>;
}

/// User wallet lookup owned by external CRUD
#[async_trait]
pub trait WalletDirectory: Send + Sync {
    async fn wallet_for_user(&self, user_id: Uuid) -> EscrowResult<Option<String>>;
}

/// Everything the coordinator persists, with the all-or-nothing writes
#[async_trait]
pub trait EscrowStore:
    EscrowRepository + LedgerTransactionRepository + GigDirectory + WalletDirectory
{
    /// Insert the escrow, its create record and the gig status in one unit
    async fn open_escrow(
        &self,
        escrow: NewEscrow,
        record: NewLedgerTransaction,
        gig_status: GigStatus,
    ) -> EscrowResult<Escrow>;

    /// Apply a terminal transition, its record and the gig status in one unit
    async fn close_escrow(
        &self,
        transition: EscrowTransition,
        record: NewLedgerTransaction,
        gig_status: GigStatus,
    ) -> EscrowResult<Escrow>;

    /// Cheap reachability check
    async fn ping(&self) -> EscrowResult<()>;
}
