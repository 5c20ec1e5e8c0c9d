//! Ledger transaction builder - unsigned escrow and check descriptors
//!
//! Descriptors serialize to the ledger's JSON transaction shape and are
//! handed to an external wallet for signing. Nothing here signs or submits.
//! Native escrows only lock the base asset; issued currencies are held in
//! checks keyed by an invoice id instead.

use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::{
    condition::{condition_for, ConditionGenerator},
    error::EscrowError,
    ledger::{to_drops, to_ledger_time, Amount, NATIVE_CURRENCY},
    EscrowResult,
};

/// Refund window appended to the delivery date of a milestone escrow
pub const DEFAULT_REFUND_WINDOW_DAYS: i64 = 30;

/// Longest accepted refund window
pub const MAX_REFUND_WINDOW_DAYS: i64 = 3_650;

/// Memo type attached to milestone checks
const CHECK_MEMO_TYPE: &str = "escrow";

/// Unsigned escrow transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "TransactionType")]
pub enum TxDescriptor {
    EscrowCreate(EscrowCreateTx),
    EscrowFinish(EscrowFinishTx),
    EscrowCancel(EscrowCancelTx),
    CheckCreate(CheckCreateTx),
    CheckCash(CheckCashTx),
    CheckCancel(CheckCancelTx),
}

impl TxDescriptor {
    pub fn transaction_type(&self) -> &'static str {
        match self {
            Self::EscrowCreate(_) => "EscrowCreate",
            Self::EscrowFinish(_) => "EscrowFinish",
            Self::EscrowCancel(_) => "EscrowCancel",
            Self::CheckCreate(_) => "CheckCreate",
            Self::CheckCash(_) => "CheckCash",
            Self::CheckCancel(_) => "CheckCancel",
        }
    }

    pub fn to_json(&self) -> EscrowResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EscrowCreateTx {
    pub account: String,
    pub destination: String,
    /// Drops
    pub amount: String,
    /// Seconds since the ledger epoch
    pub cancel_after: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_after: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EscrowFinishTx {
    pub account: String,
    pub owner: String,
    pub offer_sequence: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<String>,
}

impl fmt::Debug for EscrowFinishTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowFinishTx")
            .field("account", &self.account)
            .field("owner", &self.owner)
            .field("offer_sequence", &self.offer_sequence)
            .field("condition", &self.condition)
            .field("fulfillment", &self.fulfillment.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EscrowCancelTx {
    pub account: String,
    pub owner: String,
    pub offer_sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckCreateTx {
    pub account: String,
    pub destination: String,
    /// Ledger amount JSON (drops string or issued object)
    pub send_max: serde_json::Value,
    #[serde(rename = "InvoiceID", skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub memos: Vec<MemoWrapper>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemoWrapper {
    pub memo: Memo,
}

/// Memo fields are uppercase hex of their UTF-8 text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Memo {
    pub memo_data: String,
    pub memo_type: String,
}

impl Memo {
    pub fn new(memo_type: &str, data: &str) -> Self {
        Self {
            memo_data: hex::encode_upper(data),
            memo_type: hex::encode_upper(memo_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckCashTx {
    pub account: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
    /// Exact amount to cash; may be less than the check's SendMax
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckCancelTx {
    pub account: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
}

/// Milestone check ready for signing, linked to its gig by `invoice_id`
#[derive(Debug, Clone)]
pub struct MilestoneCheck {
    pub descriptor: TxDescriptor,
    pub invoice_id: String,
}

/// Milestone escrow ready for signing, with its secret
#[derive(Clone)]
pub struct MilestoneEscrow {
    pub descriptor: TxDescriptor,
    pub condition: String,
    pub fulfillment: String,
    pub finish_after: DateTime<Utc>,
    pub cancel_after: DateTime<Utc>,
}

impl fmt::Debug for MilestoneEscrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MilestoneEscrow")
            .field("descriptor", &self.descriptor)
            .field("condition", &self.condition)
            .field("fulfillment", &"<redacted>")
            .field("finish_after", &self.finish_after)
            .field("cancel_after", &self.cancel_after)
            .finish()
    }
}

/// Builds unsigned escrow and check descriptors
#[derive(Debug, Clone)]
pub struct LedgerTransactionBuilder {
    conditions: ConditionGenerator,
    refund_window: Duration,
}

impl Default for LedgerTransactionBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_REFUND_WINDOW_DAYS)
    }
}

impl LedgerTransactionBuilder {
    /// `refund_window_days` is clamped to `1..=MAX_REFUND_WINDOW_DAYS`
    pub fn new(refund_window_days: i64) -> Self {
        Self {
            conditions: ConditionGenerator::new(),
            refund_window: Duration::days(refund_window_days.clamp(1, MAX_REFUND_WINDOW_DAYS)),
        }
    }

    pub fn refund_window(&self) -> Duration {
        self.refund_window
    }

    /// Build an EscrowCreate
    ///
    /// `cancel_after` is mandatory on the ledger and must fall after
    /// `finish_after` when both are given. Only the native currency can be
    /// locked in a native escrow.
    pub fn build_escrow_create(
        &self,
        from: &str,
        to: &str,
        amount: &Amount,
        cancel_after: Option<DateTime<Utc>>,
        finish_after: Option<DateTime<Utc>>,
        condition: Option<&str>,
    ) -> EscrowResult<TxDescriptor> {
        let cancel_after = cancel_after
            .ok_or_else(|| EscrowError::invalid_parameter("CancelAfter is required for escrow"))?;

        let value = match amount {
            Amount::Native { value } => *value,
            Amount::Issued { currency, .. } => {
                return Err(EscrowError::unsupported_currency(format!(
                    "native escrow only locks {NATIVE_CURRENCY}, got {currency}"
                )))
            }
        };

        if let Some(finish_after) = finish_after {
            if finish_after >= cancel_after {
                return Err(EscrowError::invalid_parameter(
                    "FinishAfter must be before CancelAfter",
                ));
            }
        }

        Ok(TxDescriptor::EscrowCreate(EscrowCreateTx {
            account: from.to_string(),
            destination: to.to_string(),
            amount: to_drops(value)?.to_string(),
            cancel_after: to_ledger_time(cancel_after)?,
            finish_after: finish_after.map(to_ledger_time).transpose()?,
            condition: condition.map(str::to_uppercase),
        }))
    }

    /// Build an EscrowFinish; with a fulfillment the matching condition is attached too
    pub fn build_escrow_finish(
        &self,
        finisher: &str,
        owner: &str,
        sequence: u32,
        fulfillment: Option<&str>,
    ) -> EscrowResult<TxDescriptor> {
        let (condition, fulfillment) = match fulfillment {
            Some(f) => {
                let condition = condition_for(f)
                    .ok_or_else(|| EscrowError::invalid_parameter("fulfillment is not valid hex"))?;
                (Some(condition), Some(f.to_uppercase()))
            }
            None => (None, None),
        };

        Ok(TxDescriptor::EscrowFinish(EscrowFinishTx {
            account: finisher.to_string(),
            owner: owner.to_string(),
            offer_sequence: sequence,
            condition,
            fulfillment,
        }))
    }

    pub fn build_escrow_cancel(&self, canceller: &str, owner: &str, sequence: u32) -> TxDescriptor {
        TxDescriptor::EscrowCancel(EscrowCancelTx {
            account: canceller.to_string(),
            owner: owner.to_string(),
            offer_sequence: sequence,
        })
    }

    /// Conditional escrow releasable from `delivery_date`, refundable after the refund window
    pub fn build_milestone_escrow(
        &self,
        client: &str,
        freelancer: &str,
        amount: &Amount,
        delivery_date: DateTime<Utc>,
    ) -> EscrowResult<MilestoneEscrow> {
        if !amount.is_native() {
            return Err(EscrowError::unsupported_currency(format!(
                "milestone escrow only locks {NATIVE_CURRENCY}, got {}; use a check instead",
                amount.currency()
            )));
        }

        let pair = self.conditions.generate();
        let finish_after = delivery_date;
        let cancel_after = delivery_date
            .checked_add_signed(self.refund_window)
            .ok_or_else(|| {
                EscrowError::invalid_parameter(format!(
                    "delivery date {delivery_date} is outside the ledger time range"
                ))
            })?;

        let descriptor = self.build_escrow_create(
            client,
            freelancer,
            amount,
            Some(cancel_after),
            Some(finish_after),
            Some(&pair.condition),
        )?;

        info!(
            "Built milestone escrow: {} -> {}, {} {}",
            client,
            freelancer,
            amount.value(),
            amount.currency()
        );

        Ok(MilestoneEscrow {
            descriptor,
            condition: pair.condition,
            fulfillment: pair.fulfillment,
            finish_after,
            cancel_after,
        })
    }

    /// Build a CheckCreate; the recipient can cash up to `amount` until the check is cancelled
    pub fn build_check_create(
        &self,
        from: &str,
        to: &str,
        amount: &Amount,
        invoice_id: Option<&str>,
        memo: Option<&str>,
    ) -> EscrowResult<TxDescriptor> {
        let invoice_id = invoice_id.map(normalize_invoice_id).transpose()?;

        Ok(TxDescriptor::CheckCreate(CheckCreateTx {
            account: from.to_string(),
            destination: to.to_string(),
            send_max: check_amount(amount)?,
            invoice_id,
            memos: memo
                .map(|text| MemoWrapper {
                    memo: Memo::new(CHECK_MEMO_TYPE, text),
                })
                .into_iter()
                .collect(),
        }))
    }

    /// Check holding a milestone payment in any currency, tagged with a fresh invoice id
    pub fn build_milestone_check(
        &self,
        client: &str,
        freelancer: &str,
        amount: &Amount,
        gig_id: &str,
    ) -> EscrowResult<MilestoneCheck> {
        let invoice_id = generate_invoice_id();
        let memo = format!("Milestone payment for gig {gig_id}");

        let descriptor =
            self.build_check_create(client, freelancer, amount, Some(&invoice_id), Some(&memo))?;

        info!(
            "Built milestone check: {} -> {}, {} {}",
            client,
            freelancer,
            amount.value(),
            amount.currency()
        );

        Ok(MilestoneCheck {
            descriptor,
            invoice_id,
        })
    }

    /// Build a CheckCash; without `amount` the wallet cashes the full SendMax
    pub fn build_check_cash(
        &self,
        recipient: &str,
        check_id: &str,
        amount: Option<&Amount>,
    ) -> EscrowResult<TxDescriptor> {
        Ok(TxDescriptor::CheckCash(CheckCashTx {
            account: recipient.to_string(),
            check_id: normalize_ledger_id(check_id, "check id")?,
            amount: amount.map(check_amount).transpose()?,
        }))
    }

    pub fn build_check_cancel(&self, account: &str, check_id: &str) -> EscrowResult<TxDescriptor> {
        Ok(TxDescriptor::CheckCancel(CheckCancelTx {
            account: account.to_string(),
            check_id: normalize_ledger_id(check_id, "check id")?,
        }))
    }
}

/// Fresh 256-bit invoice id, uppercase hex
pub fn generate_invoice_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode_upper(bytes)
}

fn check_amount(amount: &Amount) -> EscrowResult<serde_json::Value> {
    if amount.value() <= Decimal::ZERO {
        return Err(EscrowError::invalid_parameter(format!(
            "amount must be positive, got {}",
            amount.value()
        )));
    }
    amount.to_ledger_json()
}

fn normalize_invoice_id(invoice_id: &str) -> EscrowResult<String> {
    normalize_ledger_id(invoice_id, "invoice id")
}

/// 256-bit ledger identifiers travel as 64 uppercase hex characters
fn normalize_ledger_id(id: &str, what: &str) -> EscrowResult<String> {
    if id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(id.to_ascii_uppercase())
    } else {
        Err(EscrowError::invalid_parameter(format!(
            "{what} must be 64 hex characters"
        )))
    }
}
