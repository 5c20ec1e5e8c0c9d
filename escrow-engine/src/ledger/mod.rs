//! Ledger boundary
//!
//! The coordinator only ever talks to the ledger through [`LedgerClient`].
//! Wire shapes (drops strings, ledger-epoch seconds, untyped JSON objects)
//! are resolved here and never leak past this module.

pub mod address;
pub mod amount;
pub mod jsonrpc;

#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::EscrowResult;

pub use address::is_valid_address;
pub use amount::{from_drops, from_ledger_time, to_drops, to_ledger_time, Amount};
pub use jsonrpc::{JsonRpcLedgerClient, LedgerClientConfig};

/// Currency code of the ledger's base asset
pub const NATIVE_CURRENCY: &str = "XRP";

/// Engine result code of an applied, successful transaction
pub const SUCCESS_RESULT: &str = "tesSUCCESS";

/// Ledger object types the engine looks up by owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Escrow,
    Check,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Escrow => "escrow",
            Self::Check => "check",
        }
    }
}

/// Outcome of a backend-initiated submit-and-wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub hash: String,
    pub result_code: String,
    pub validated: bool,
    pub ledger_index: Option<u32>,
}

impl SubmitOutcome {
    pub fn is_success(&self) -> bool {
        self.result_code == SUCCESS_RESULT
    }
}

/// Transaction as reported by the ledger
#[derive(Debug, Clone, Serialize)]
pub struct LedgerTransaction {
    pub hash: String,
    pub tx_type: String,
    pub account: String,
    pub destination: Option<String>,
    pub owner: Option<String>,
    pub offer_sequence: Option<u32>,
    pub sequence: Option<u32>,
    pub amount: Option<Amount>,
    /// `None` until the transaction is in a validated ledger
    pub result_code: Option<String>,
    pub validated: bool,
    pub ledger_index: Option<u32>,
}

impl LedgerTransaction {
    pub fn is_success(&self) -> bool {
        self.result_code.as_deref() == Some(SUCCESS_RESULT)
    }

    /// Parse a `tx` result (API v1 flat layout or v2 `tx_json`)
    pub fn from_json(result: &Value) -> EscrowResult<Self> {
        let tx = result.get("tx_json").unwrap_or(result);

        let hash = str_field(result, "hash")
            .or_else(|| str_field(tx, "hash"))
            .ok_or_else(|| crate::error::EscrowError::ledger_io("transaction without hash"))?;
        let tx_type = str_field(tx, "TransactionType")
            .ok_or_else(|| crate::error::EscrowError::ledger_io("transaction without type"))?;

        let amount = match tx.get("Amount") {
            Some(raw) => Some(Amount::from_ledger_json(raw)?),
            None => None,
        };

        let result_code = result
            .get("meta")
            .and_then(|meta| meta.get("TransactionResult"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            hash,
            tx_type,
            account: str_field(tx, "Account").unwrap_or_default(),
            destination: str_field(tx, "Destination"),
            owner: str_field(tx, "Owner"),
            offer_sequence: u32_field(tx, "OfferSequence"),
            sequence: u32_field(tx, "Sequence"),
            amount,
            result_code,
            validated: result.get("validated").and_then(Value::as_bool).unwrap_or(false),
            ledger_index: u32_field(result, "ledger_index"),
        })
    }
}

/// Object owned by an account (escrow, check, ...)
#[derive(Debug, Clone, Serialize)]
pub struct AccountObject {
    pub entry_type: String,
    pub account: Option<String>,
    pub destination: Option<String>,
    /// `Amount` of an escrow, `SendMax` of a check
    pub amount: Option<Amount>,
    pub condition: Option<String>,
    /// Invoice id a check was created with
    pub invoice_id: Option<String>,
    pub cancel_after: Option<DateTime<Utc>>,
    pub finish_after: Option<DateTime<Utc>>,
    /// Hash of the transaction that last modified the object
    pub previous_txn_id: Option<String>,
    pub previous_txn_lgr_seq: Option<u32>,
    pub raw: Value,
}

impl AccountObject {
    pub fn from_json(raw: Value) -> EscrowResult<Self> {
        let amount = match raw.get("Amount").or_else(|| raw.get("SendMax")) {
            Some(value) => Some(Amount::from_ledger_json(value)?),
            None => None,
        };

        Ok(Self {
            entry_type: str_field(&raw, "LedgerEntryType").unwrap_or_default(),
            account: str_field(&raw, "Account"),
            destination: str_field(&raw, "Destination"),
            amount,
            condition: str_field(&raw, "Condition"),
            invoice_id: str_field(&raw, "InvoiceID"),
            cancel_after: u32_field(&raw, "CancelAfter").map(from_ledger_time),
            finish_after: u32_field(&raw, "FinishAfter").map(from_ledger_time),
            previous_txn_id: str_field(&raw, "PreviousTxnID"),
            previous_txn_lgr_seq: u32_field(&raw, "PreviousTxnLgrSeq"),
            raw,
        })
    }
}

/// Connection to the ledger network
///
/// Constructed once at startup, connected explicitly and torn down on
/// shutdown. Reconnect policy belongs to the implementation.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn connect(&self) -> EscrowResult<()>;

    async fn disconnect(&self) -> EscrowResult<()>;

    fn is_connected(&self) -> bool;

    /// Submit a signed blob and wait until it is validated
    async fn submit_and_wait(&self, signed_tx_blob: &str) -> EscrowResult<SubmitOutcome>;

    /// Look up a transaction by hash (`NotFound` if the ledger does not know it)
    async fn get_transaction(&self, hash: &str) -> EscrowResult<LedgerTransaction>;

    /// Objects of `object_type` owned by `address`
    async fn get_account_objects(
        &self,
        address: &str,
        object_type: ObjectType,
    ) -> EscrowResult<Vec<AccountObject>>;
}

/// Check owned by `owner` that carries `invoice_id` (hex, case-insensitive)
pub async fn find_check_by_invoice_id(
    ledger: &dyn LedgerClient,
    owner: &str,
    invoice_id: &str,
) -> EscrowResult<Option<AccountObject>> {
    let checks = ledger.get_account_objects(owner, ObjectType::Check).await?;
    Ok(checks.into_iter().find(|check| {
        check
            .invoice_id
            .as_deref()
            .is_some_and(|id| id.eq_ignore_ascii_case(invoice_id))
    }))
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn u32_field(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}
