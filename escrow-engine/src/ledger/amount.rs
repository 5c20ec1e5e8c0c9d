//! Ledger amounts and ledger time
//!
//! The ledger encodes native amounts as a string of integer drops and
//! issued-currency amounts as `{currency, issuer, value}` objects. Both are
//! resolved into [`Amount`] once, here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::NATIVE_CURRENCY;
use crate::{error::EscrowError, EscrowResult};

/// Drops per native unit
pub const DROPS_PER_UNIT: u64 = 1_000_000;

/// Seconds between the Unix epoch and the ledger epoch (2000-01-01T00:00:00Z)
pub const LEDGER_EPOCH_OFFSET: i64 = 946_684_800;

/// Amount in either the native currency or an issued currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Amount {
    /// Native units (not drops)
    Native { value: Decimal },
    Issued {
        currency: String,
        issuer: String,
        value: Decimal,
    },
}

/// Wire shape of a ledger amount
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireAmount {
    Drops(String),
    Issued {
        currency: String,
        issuer: String,
        value: String,
    },
}

impl Amount {
    pub fn native(value: Decimal) -> Self {
        Self::Native { value }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native { .. })
    }

    pub fn value(&self) -> Decimal {
        match self {
            Self::Native { value } | Self::Issued { value, .. } => *value,
        }
    }

    pub fn currency(&self) -> &str {
        match self {
            Self::Native { .. } => NATIVE_CURRENCY,
            Self::Issued { currency, .. } => currency,
        }
    }

    /// Parse a ledger JSON amount (drops string or issued object)
    pub fn from_ledger_json(value: &serde_json::Value) -> EscrowResult<Self> {
        let wire: WireAmount = serde_json::from_value(value.clone())
            .map_err(|e| EscrowError::ledger_io(format!("unrecognised amount {value}: {e}")))?;

        match wire {
            WireAmount::Drops(drops) => {
                let drops = drops
                    .parse::<u64>()
                    .map_err(|_| EscrowError::ledger_io(format!("invalid drops amount '{drops}'")))?;
                Ok(Self::native(from_drops(drops)))
            }
            WireAmount::Issued {
                currency,
                issuer,
                value,
            } => {
                let value = Decimal::from_str(&value)
                    .map_err(|_| EscrowError::ledger_io(format!("invalid token value '{value}'")))?;
                Ok(Self::Issued {
                    currency,
                    issuer,
                    value,
                })
            }
        }
    }

    /// Encode for a ledger transaction
    pub fn to_ledger_json(&self) -> EscrowResult<serde_json::Value> {
        match self {
            Self::Native { value } => Ok(serde_json::Value::String(to_drops(*value)?.to_string())),
            Self::Issued {
                currency,
                issuer,
                value,
            } => Ok(serde_json::json!({
                "currency": currency,
                "issuer": issuer,
                "value": value.normalize().to_string(),
            })),
        }
    }
}

/// Convert native units to integer drops
pub fn to_drops(value: Decimal) -> EscrowResult<u64> {
    if value <= Decimal::ZERO {
        return Err(EscrowError::invalid_parameter(format!(
            "amount must be positive, got {value}"
        )));
    }

    let drops = value * Decimal::from(DROPS_PER_UNIT);
    if drops.fract() != Decimal::ZERO {
        return Err(EscrowError::invalid_parameter(format!(
            "amount {value} is finer than one drop"
        )));
    }

    u64::from_str(&drops.trunc().to_string())
        .map_err(|_| EscrowError::invalid_parameter(format!("amount {value} out of range")))
}

/// Convert integer drops to native units
pub fn from_drops(drops: u64) -> Decimal {
    (Decimal::from(drops) / Decimal::from(DROPS_PER_UNIT)).normalize()
}

/// Convert a timestamp to seconds since the ledger epoch
pub fn to_ledger_time(at: DateTime<Utc>) -> EscrowResult<u32> {
    let secs = at.timestamp() - LEDGER_EPOCH_OFFSET;
    u32::try_from(secs).map_err(|_| {
        EscrowError::invalid_parameter(format!("{at} is outside the ledger time range"))
    })
}

/// Convert seconds since the ledger epoch to a timestamp
pub fn from_ledger_time(secs: u32) -> DateTime<Utc> {
    // u32 seconds past 2000 always fit the chrono range
    DateTime::<Utc>::from_timestamp(i64::from(secs) + LEDGER_EPOCH_OFFSET, 0).unwrap_or_default()
}
