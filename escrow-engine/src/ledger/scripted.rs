//! In-process ledger double driven by test scripts

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{AccountObject, LedgerClient, LedgerTransaction, ObjectType, SubmitOutcome, SUCCESS_RESULT};
use crate::{error::EscrowError, EscrowResult};

#[derive(Default)]
pub struct ScriptedLedger {
    connected: AtomicBool,
    transactions: Mutex<HashMap<String, LedgerTransaction>>,
    objects: Mutex<HashMap<String, Vec<AccountObject>>>,
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&self, tx: LedgerTransaction) {
        self.transactions
            .lock()
            .unwrap()
            .insert(tx.hash.clone(), tx);
    }

    pub fn add_object(&self, owner: &str, object: AccountObject) {
        self.objects
            .lock()
            .unwrap()
            .entry(owner.to_string())
            .or_default()
            .push(object);
    }

    /// Validated transaction of `tx_type` with `result_code`
    pub fn validated(hash: &str, tx_type: &str, result_code: &str) -> LedgerTransaction {
        LedgerTransaction {
            hash: hash.to_string(),
            tx_type: tx_type.to_string(),
            account: String::new(),
            destination: None,
            owner: None,
            offer_sequence: None,
            sequence: None,
            amount: None,
            result_code: Some(result_code.to_string()),
            validated: true,
            ledger_index: Some(1),
        }
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn connect(&self) -> EscrowResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> EscrowResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn submit_and_wait(&self, signed_tx_blob: &str) -> EscrowResult<SubmitOutcome> {
        let hash = hex::encode_upper(Sha256::digest(signed_tx_blob.as_bytes()));
        self.add_transaction(Self::validated(&hash, "Payment", SUCCESS_RESULT));
        Ok(SubmitOutcome {
            hash,
            result_code: SUCCESS_RESULT.to_string(),
            validated: true,
            ledger_index: Some(1),
        })
    }

    async fn get_transaction(&self, hash: &str) -> EscrowResult<LedgerTransaction> {
        self.transactions
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("transaction {hash}")))
    }

    async fn get_account_objects(
        &self,
        address: &str,
        object_type: ObjectType,
    ) -> EscrowResult<Vec<AccountObject>> {
        let wanted = match object_type {
            ObjectType::Escrow => "Escrow",
            ObjectType::Check => "Check",
        };
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(address)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|o| o.entry_type == wanted)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
