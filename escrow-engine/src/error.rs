//! Error types for the escrow system
//!
//! One taxonomy for every escrow operation: validation, authorization,
//! conflicts at the persistence boundary, integrity failures (fulfillment
//! mismatch, decryption) and the I/O failures of the ledger and database.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Escrow, gig or user missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not the party allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Duplicate active escrow or an already-terminal transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Fulfillment does not hash to the committed condition
    #[error("Fulfillment does not match condition")]
    InvalidFulfillment,

    /// Ledger address failed the format check
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Missing or malformed transaction parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Cancellation requested before the escrow's cancel-after instant
    #[error("Escrow cannot be cancelled before {cancel_after}")]
    TooEarly { cancel_after: DateTime<Utc> },

    /// Native escrow only locks the ledger's base currency
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// Envelope malformed, tampered with, or sealed under another key
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The ledger rejected or failed a transaction
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Ledger or store call exceeded its deadline
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Ledger endpoint unreachable or returned an unusable response
    #[error("Ledger I/O error: {0}")]
    LedgerIo(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, machine-readable error kind for the boundary layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Conflict,
    InvalidFulfillment,
    InvalidAddress,
    InvalidParameter,
    TooEarly,
    UnsupportedCurrency,
    Decryption,
    Config,
    Ledger,
    Transient,
    Internal,
}

impl EscrowError {
    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an invalid address error
    pub fn invalid_address<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create an unsupported currency error
    pub fn unsupported_currency<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedCurrency(msg.into())
    }

    /// Create a decryption error
    pub fn decryption<S: Into<String>>(msg: S) -> Self {
        Self::Decryption(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a ledger error
    pub fn ledger<S: Into<String>>(msg: S) -> Self {
        Self::Ledger(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a ledger I/O error
    pub fn ledger_io<S: Into<String>>(msg: S) -> Self {
        Self::LedgerIo(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Kind used by the boundary layer to pick an external status
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidFulfillment => ErrorKind::InvalidFulfillment,
            Self::InvalidAddress(_) => ErrorKind::InvalidAddress,
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::TooEarly { .. } => ErrorKind::TooEarly,
            Self::UnsupportedCurrency(_) => ErrorKind::UnsupportedCurrency,
            Self::Decryption(_) => ErrorKind::Decryption,
            Self::Config(_) => ErrorKind::Config,
            Self::Ledger(_) => ErrorKind::Ledger,
            Self::Timeout(_) | Self::LedgerIo(_) => ErrorKind::Transient,
            Self::Database(e) if is_transient_db_error(e) => ErrorKind::Transient,
            Self::Database(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same call unchanged
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

fn is_transient_db_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(EscrowError::not_found("escrow").kind(), ErrorKind::NotFound);
        assert_eq!(EscrowError::InvalidFulfillment.kind(), ErrorKind::InvalidFulfillment);
        assert!(EscrowError::timeout("ledger").is_transient());
        assert!(EscrowError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!EscrowError::conflict("already released").is_transient());
    }

    #[test]
    fn test_too_early_message_carries_timestamp() {
        let cancel_after = Utc::now();
        let err = EscrowError::TooEarly { cancel_after };
        assert!(err.to_string().contains(&cancel_after.to_string()));
    }
}
