//! Fulfillment vault - authenticated encryption of secrets at rest
//!
//! Envelopes are four colon-joined hex fields `iv:salt:tag:ciphertext`,
//! sealed with ChaCha20-Poly1305 under SHA-256 of the configured secret.
//! The salt is random and carried along for a future per-envelope key
//! derivation; it is not mixed into the key today.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{error::EscrowError, EscrowResult};

const IV_LEN: usize = 12;
const SALT_LEN: usize = 64;
const TAG_LEN: usize = 16;
const ENVELOPE_FIELDS: usize = 4;

/// Seals and opens fulfillment envelopes
#[derive(Clone)]
pub struct FulfillmentVault {
    key: [u8; 32],
}

impl fmt::Debug for FulfillmentVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FulfillmentVault")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl FulfillmentVault {
    /// Derive the vault key from `secret`; an empty secret is a configuration error
    pub fn new(secret: &str) -> EscrowResult<Self> {
        if secret.is_empty() {
            return Err(EscrowError::config("encryption key is not set"));
        }

        Ok(Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        })
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Seal `plaintext`; every call uses a fresh IV and salt
    pub fn encrypt(&self, plaintext: &str) -> EscrowResult<String> {
        let mut iv = [0u8; IV_LEN];
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut iv);
        OsRng.fill_bytes(&mut salt);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher()
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .map_err(|e| EscrowError::internal(format!("encryption failed: {e}")))?;

        Ok([
            hex::encode(iv),
            hex::encode(salt),
            hex::encode(tag),
            hex::encode(buffer),
        ]
        .join(":"))
    }

    /// Open an envelope produced by [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, envelope: &str) -> EscrowResult<String> {
        let fields: Vec<&str> = envelope.split(':').collect();
        if fields.len() != ENVELOPE_FIELDS {
            return Err(EscrowError::decryption(format!(
                "expected {ENVELOPE_FIELDS} envelope fields, found {}",
                fields.len()
            )));
        }

        let iv = decode_field("iv", fields[0], Some(IV_LEN))?;
        decode_field("salt", fields[1], Some(SALT_LEN))?;
        let tag = decode_field("tag", fields[2], Some(TAG_LEN))?;
        let mut buffer = decode_field("ciphertext", fields[3], None)?;

        self.cipher()
            .decrypt_in_place_detached(
                Nonce::from_slice(&iv),
                b"",
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| EscrowError::decryption("authentication failed"))?;

        String::from_utf8(buffer)
            .map_err(|_| EscrowError::decryption("plaintext is not valid UTF-8"))
    }

    /// One-way SHA-256 fingerprint (lowercase hex)
    pub fn hash(&self, data: &str) -> String {
        hex::encode(Sha256::digest(data.as_bytes()))
    }
}

fn decode_field(name: &str, field: &str, expected_len: Option<usize>) -> EscrowResult<Vec<u8>> {
    let bytes = hex::decode(field)
        .map_err(|_| EscrowError::decryption(format!("{name} is not valid hex")))?;

    match expected_len {
        Some(len) if bytes.len() != len => Err(EscrowError::decryption(format!(
            "{name} must be {len} bytes, found {}",
            bytes.len()
        ))),
        _ => Ok(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> FulfillmentVault {
        FulfillmentVault::new("test-encryption-key").unwrap()
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        assert!(matches!(
            FulfillmentVault::new(""),
            Err(EscrowError::Config(_))
        ));
    }

    #[test]
    fn test_round_trip() {
        let vault = vault();
        let long = "x".repeat(10_000);
        for plaintext in ["", "A3F1C2", long.as_str(), "Ünïcødé ✓ 漢字 🚀"] {
            let envelope = vault.encrypt(plaintext).unwrap();
            assert_eq!(envelope.split(':').count(), 4);
            assert_eq!(vault.decrypt(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_encrypt_is_not_deterministic() {
        let vault = vault();
        let a = vault.encrypt("same plaintext").unwrap();
        let b = vault.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = vault().encrypt("abc").unwrap();
        let fields: Vec<&str> = envelope.split(':').collect();
        assert_eq!(fields[0].len(), IV_LEN * 2);
        assert_eq!(fields[1].len(), SALT_LEN * 2);
        assert_eq!(fields[2].len(), TAG_LEN * 2);
        assert_eq!(fields[3].len(), 6);
    }

    #[test]
    fn test_malformed_envelopes() {
        let vault = vault();
        for envelope in ["", "a:b:c", "a:b:c:d:e", "zz:zz:zz:zz"] {
            assert!(matches!(
                vault.decrypt(envelope),
                Err(EscrowError::Decryption(_))
            ));
        }
    }

    #[test]
    fn test_corrupted_tag_fails() {
        let vault = vault();
        let envelope = vault.encrypt("secret fulfillment").unwrap();
        let mut fields: Vec<String> = envelope.split(':').map(str::to_string).collect();

        let tag = &mut fields[2];
        let flipped = if tag.ends_with("00") { "ff" } else { "00" };
        tag.replace_range(tag.len() - 2.., flipped);

        assert!(matches!(
            vault.decrypt(&fields.join(":")),
            Err(EscrowError::Decryption(_))
        ));
    }

    #[test]
    fn test_corrupted_ciphertext_fails() {
        let vault = vault();
        let envelope = vault.encrypt("secret fulfillment").unwrap();
        let mut fields: Vec<String> = envelope.split(':').map(str::to_string).collect();

        let ciphertext = &mut fields[3];
        let flipped = if ciphertext.starts_with('0') { "1" } else { "0" };
        ciphertext.replace_range(..1, flipped);

        assert!(vault.decrypt(&fields.join(":")).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = vault().encrypt("secret").unwrap();
        let other = FulfillmentVault::new("another-key").unwrap();
        assert!(matches!(
            other.decrypt(&envelope),
            Err(EscrowError::Decryption(_))
        ));
    }

    #[test]
    fn test_hash_is_deterministic_sha256() {
        let vault = vault();
        assert_eq!(vault.hash("abc"), vault.hash("abc"));
        assert_eq!(
            vault.hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", vault());
        assert!(debug.contains("<redacted>"));
    }
}
