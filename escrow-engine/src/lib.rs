//! Milestone escrow coordination for a gig marketplace
//!
//! Funds are locked in ledger-native conditional escrows. This crate owns
//! the escrow lifecycle around them:
//! - SHA-256 condition/fulfillment pairs and unsigned ledger transaction descriptors
//! - An intent/confirm state machine with guarded, all-or-nothing persistence
//! - Authenticated encryption of fulfillments at rest
//! - PostgreSQL or in-memory storage, a JSON-RPC ledger client and a background expiry sweep

pub mod clock;
pub mod condition;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod models;
pub mod node;
pub mod store;
pub mod sweeper;
pub mod tx_builder;
pub mod vault;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
