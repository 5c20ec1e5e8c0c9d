//! Classic ledger address check
//!
//! An address is the base58 (ledger alphabet) encoding of a type byte 0,
//! a 20-byte account id and a 4-byte double SHA-256 checksum.

use sha2::{Digest, Sha256};

const ACCOUNT_ID_TYPE: u8 = 0x00;
const DECODED_LEN: usize = 25;

/// Whether `address` is a well-formed classic account address
pub fn is_valid_address(address: &str) -> bool {
    if !address.starts_with('r') || !(25..=35).contains(&address.len()) {
        return false;
    }

    let Ok(decoded) = bs58::decode(address)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .into_vec()
    else {
        return false;
    };
    if decoded.len() != DECODED_LEN || decoded[0] != ACCOUNT_ID_TYPE {
        return false;
    }

    let (payload, checksum) = decoded.split_at(DECODED_LEN - 4);
    let digest = Sha256::digest(Sha256::digest(payload));
    digest[..4] == *checksum
}
