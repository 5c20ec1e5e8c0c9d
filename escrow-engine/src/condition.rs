//! Condition generator - fulfillment secrets and their SHA-256 conditions
//!
//! A fulfillment is 32 random bytes; its condition is the SHA-256 digest.
//! Both travel as uppercase hex.

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;

/// Fulfillment length in bytes
pub const FULFILLMENT_LEN: usize = 32;

/// Condition/fulfillment pair; lives only in memory and in the client-held intent
#[derive(Clone, PartialEq, Eq)]
pub struct ConditionFulfillmentPair {
    pub condition: String,
    pub fulfillment: String,
}

impl fmt::Debug for ConditionFulfillmentPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionFulfillmentPair")
            .field("condition", &self.condition)
            .field("fulfillment", &"<redacted>")
            .finish()
    }
}

/// Produces fresh condition/fulfillment pairs from the OS CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionGenerator;

impl ConditionGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generate a new pair
    pub fn generate(&self) -> ConditionFulfillmentPair {
        let mut secret = [0u8; FULFILLMENT_LEN];
        OsRng.fill_bytes(&mut secret);

        ConditionFulfillmentPair {
            condition: hex::encode_upper(Sha256::digest(secret)),
            fulfillment: hex::encode_upper(secret),
        }
    }
}

/// Condition for a hex-encoded fulfillment
///
/// `None` if the hex is malformed or does not decode to `FULFILLMENT_LEN` bytes.
pub fn condition_for(fulfillment_hex: &str) -> Option<String> {
    let preimage = hex::decode(fulfillment_hex).ok()?;
    if preimage.len() != FULFILLMENT_LEN {
        return None;
    }
    Some(hex::encode_upper(Sha256::digest(preimage)))
}

/// Check that `fulfillment` hashes to `condition` (hex, case-insensitive)
pub fn validate_fulfillment(condition: &str, fulfillment: &str) -> bool {
    match condition_for(fulfillment) {
        Some(computed) => computed.eq_ignore_ascii_case(condition),
        None => false,
    }
}
