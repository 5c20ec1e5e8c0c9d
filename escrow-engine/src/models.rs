//! Core data models for the escrow system
//!
//! This module contains the persisted records (escrows and ledger
//! transaction records), the status state machines, and the request
//! and response types flowing through the coordinator.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::{error::EscrowError, EscrowResult};

/// Default page size for list queries
pub const DEFAULT_LIMIT: i64 = 50;

/// Escrow state machine enum
///
/// `Created` is the only non-terminal state; every transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Funds locked on the ledger, awaiting release or cancellation
    Created,
    /// Fulfillment presented, funds delivered to the freelancer
    Released,
    /// Cancelled after cancel-after, funds returned to the client
    Cancelled,
    /// Cancel-after passed locally without a recorded ledger transaction
    Expired,
}

impl EscrowStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created)
    }

    /// Check if this state allows release or cancellation
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Check whether a transition to `to` is allowed
    pub fn can_transition_to(&self, to: EscrowStatus) -> bool {
        matches!(self, Self::Created) && to.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Released => "released",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscrowStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "released" => Ok(Self::Released),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(EscrowError::internal(format!("unknown escrow status '{other}'"))),
        }
    }
}

/// Ledger transaction type recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Payment,
    EscrowCreate,
    EscrowFinish,
    EscrowCancel,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::EscrowCreate => "escrow_create",
            Self::EscrowFinish => "escrow_finish",
            Self::EscrowCancel => "escrow_cancel",
        }
    }

    /// Name of the matching ledger `TransactionType`
    pub fn ledger_name(&self) -> &'static str {
        match self {
            Self::Payment => "Payment",
            Self::EscrowCreate => "EscrowCreate",
            Self::EscrowFinish => "EscrowFinish",
            Self::EscrowCancel => "EscrowCancel",
        }
    }
}

impl FromStr for TxType {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment" => Ok(Self::Payment),
            "escrow_create" => Ok(Self::EscrowCreate),
            "escrow_finish" => Ok(Self::EscrowFinish),
            "escrow_cancel" => Ok(Self::EscrowCancel),
            other => Err(EscrowError::internal(format!("unknown transaction type '{other}'"))),
        }
    }
}

/// Status of an observed ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TxStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(EscrowError::internal(format!("unknown transaction status '{other}'"))),
        }
    }
}

/// Gig status as seen by the escrow flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GigStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

impl GigStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for GigStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EscrowError::internal(format!("unknown gig status '{other}'"))),
        }
    }
}

/// Escrow model mirroring one ledger-native escrow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: Uuid,
    /// Sequence of the EscrowCreate, unique per owner account
    pub ledger_sequence: u32,
    pub gig_id: Uuid,

    // Parties
    pub client_wallet: String,
    pub freelancer_wallet: String,

    /// Native units
    pub amount: Decimal,

    /// Uppercase hex SHA-256 of the fulfillment
    pub condition: String,
    /// `iv:salt:tag:ciphertext` envelope; never serialized outward
    #[serde(skip_serializing, default)]
    pub fulfillment_ciphertext: String,

    // Timing
    pub finish_after: Option<DateTime<Utc>>,
    pub cancel_after: DateTime<Utc>,

    pub status: EscrowStatus,

    // Ledger linkage
    pub create_tx_hash: Option<String>,
    pub release_tx_hash: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Escrow {
    /// Whether `address` is the client or the freelancer
    pub fn is_party(&self, address: &str) -> bool {
        self.client_wallet == address || self.freelancer_wallet == address
    }

    /// Whether cancellation is allowed at `now` (boundary inclusive)
    pub fn is_cancellable_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.cancel_after
    }

    /// Whether the escrow should be swept at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == EscrowStatus::Created && self.cancel_after < now
    }
}

/// Fields for a new escrow row
#[derive(Debug, Clone)]
pub struct NewEscrow {
    pub ledger_sequence: u32,
    pub gig_id: Uuid,
    pub client_wallet: String,
    pub freelancer_wallet: String,
    pub amount: Decimal,
    pub condition: String,
    pub fulfillment_ciphertext: String,
    pub finish_after: Option<DateTime<Utc>>,
    pub cancel_after: DateTime<Utc>,
    pub create_tx_hash: Option<String>,
}

impl NewEscrow {
    /// Materialize the row with a fresh id in `created` status
    pub fn into_escrow(self, now: DateTime<Utc>) -> Escrow {
        Escrow {
            id: Uuid::new_v4(),
            ledger_sequence: self.ledger_sequence,
            gig_id: self.gig_id,
            client_wallet: self.client_wallet,
            freelancer_wallet: self.freelancer_wallet,
            amount: self.amount,
            condition: self.condition,
            fulfillment_ciphertext: self.fulfillment_ciphertext,
            finish_after: self.finish_after,
            cancel_after: self.cancel_after,
            status: EscrowStatus::Created,
            create_tx_hash: self.create_tx_hash,
            release_tx_hash: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only audit record of a ledger transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransactionRecord {
    pub id: Uuid,
    pub tx_hash: String,
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount: Option<Decimal>,
    pub currency: String,
    pub tx_type: TxType,
    pub gig_id: Option<Uuid>,
    pub status: TxStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Fields for a new ledger transaction record
#[derive(Debug, Clone)]
pub struct NewLedgerTransaction {
    pub tx_hash: String,
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount: Option<Decimal>,
    pub currency: String,
    pub tx_type: TxType,
    pub gig_id: Option<Uuid>,
    pub status: TxStatus,
    pub metadata: serde_json::Value,
}

impl NewLedgerTransaction {
    /// Confirmed native-currency escrow transaction
    pub fn confirmed_escrow(
        tx_type: TxType,
        tx_hash: &str,
        from_wallet: &str,
        to_wallet: &str,
        amount: Decimal,
        gig_id: Uuid,
    ) -> Self {
        Self {
            tx_hash: tx_hash.to_string(),
            from_wallet: from_wallet.to_string(),
            to_wallet: to_wallet.to_string(),
            amount: Some(amount),
            currency: crate::ledger::NATIVE_CURRENCY.to_string(),
            tx_type,
            gig_id: Some(gig_id),
            status: TxStatus::Confirmed,
            metadata: serde_json::json!({}),
        }
    }

    pub fn into_record(self, now: DateTime<Utc>) -> LedgerTransactionRecord {
        let confirmed_at = (self.status == TxStatus::Confirmed).then_some(now);
        LedgerTransactionRecord {
            id: Uuid::new_v4(),
            tx_hash: self.tx_hash,
            from_wallet: self.from_wallet,
            to_wallet: self.to_wallet,
            amount: self.amount,
            currency: self.currency,
            tx_type: self.tx_type,
            gig_id: self.gig_id,
            status: self.status,
            metadata: self.metadata,
            created_at: now,
            confirmed_at,
        }
    }
}

/// Gig as exposed by the gig collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gig {
    pub id: Uuid,
    /// Freelancer who owns the gig
    pub owner_id: Uuid,
    pub status: GigStatus,
}

/// Authenticated caller
///
/// Built by the boundary layer after authentication; the coordinator
/// trusts `user_id` and `wallet_address` as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub wallet_address: String,
}

impl Actor {
    pub fn new(user_id: Uuid, wallet_address: impl Into<String>) -> Self {
        Self {
            user_id,
            wallet_address: wallet_address.into(),
        }
    }
}

/// Terminal transition applied atomically with its audit record
#[derive(Debug, Clone)]
pub struct EscrowTransition {
    pub escrow_id: Uuid,
    pub to_status: EscrowStatus,
    pub tx_hash: Option<String>,
}

impl EscrowTransition {
    pub fn new(escrow_id: Uuid, to_status: EscrowStatus, tx_hash: Option<&str>) -> EscrowResult<Self> {
        if !to_status.is_terminal() {
            return Err(EscrowError::invalid_parameter(format!(
                "{to_status} is not a terminal escrow status"
            )));
        }
        Ok(Self {
            escrow_id,
            to_status,
            tx_hash: tx_hash.map(str::to_string),
        })
    }
}

/// Escrow list filter and pagination
#[derive(Debug, Clone, Default)]
pub struct EscrowFilter {
    pub status: Option<EscrowStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl EscrowFilter {
    pub fn limit(&self) -> i64 {
        self.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.filter(|o| *o >= 0).unwrap_or(0)
    }
}

/// Transaction list filter and pagination
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub tx_type: Option<TxType>,
    pub status: Option<TxStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl TransactionFilter {
    pub fn limit(&self) -> i64 {
        self.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.filter(|o| *o >= 0).unwrap_or(0)
    }
}

/// Per-wallet escrow aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscrowStats {
    /// Escrows where the wallet is the client
    pub total_escrows_created: i64,
    /// Escrows where the wallet is the freelancer
    pub total_escrows_received: i64,
    pub active_escrows: i64,
    pub total_amount_in_escrow: Decimal,
}

/// Per-wallet transaction aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub total_sent: Decimal,
    pub total_received: Decimal,
    pub total_transactions: i64,
    pub pending_transactions: i64,
}
