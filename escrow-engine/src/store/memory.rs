//! In-memory store
//!
//! One `RwLock` guards every table, so each composite write validates all
//! of its steps before touching anything and commits under a single guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{EscrowRepository, EscrowStore, GigDirectory, LedgerTransactionRepository, WalletDirectory};
use crate::{
    error::EscrowError,
    models::{
        Escrow, EscrowFilter, EscrowStats, EscrowStatus, EscrowTransition, Gig, GigStatus,
        LedgerTransactionRecord, NewEscrow, NewLedgerTransaction, TransactionFilter,
        TransactionStats, TxStatus,
    },
    EscrowResult,
};

#[derive(Default)]
struct State {
    /// Insertion order
    escrows: Vec<Escrow>,
    transactions: Vec<LedgerTransactionRecord>,
    gigs: HashMap<Uuid, Gig>,
    wallets: HashMap<Uuid, String>,
}

impl State {
    fn check_no_active_escrow(&self, gig_id: Uuid) -> EscrowResult<()> {
        if self
            .escrows
            .iter()
            .any(|e| e.gig_id == gig_id && e.status.is_active())
        {
            return Err(EscrowError::conflict(format!(
                "gig {gig_id} already has an active escrow"
            )));
        }
        Ok(())
    }

    fn check_new_hash(&self, tx_hash: &str) -> EscrowResult<()> {
        if self.transactions.iter().any(|t| t.tx_hash == tx_hash) {
            return Err(EscrowError::conflict(format!(
                "transaction {tx_hash} already recorded"
            )));
        }
        Ok(())
    }

    fn check_gig(&self, gig_id: Uuid) -> EscrowResult<()> {
        if self.gigs.contains_key(&gig_id) {
            Ok(())
        } else {
            Err(EscrowError::not_found(format!("gig {gig_id}")))
        }
    }

    fn escrow_index(&self, id: Uuid, to: EscrowStatus) -> EscrowResult<usize> {
        let index = self
            .escrows
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| EscrowError::not_found(format!("escrow {id}")))?;

        let current = self.escrows[index].status;
        if !current.can_transition_to(to) {
            return Err(EscrowError::conflict(format!(
                "escrow {id} is already {current}"
            )));
        }
        Ok(index)
    }

    fn apply_transition(&mut self, index: usize, to: EscrowStatus, tx_hash: Option<&str>) -> Escrow {
        let escrow = &mut self.escrows[index];
        escrow.status = to;
        if let Some(hash) = tx_hash {
            escrow.release_tx_hash = Some(hash.to_string());
        }
        escrow.updated_at = Utc::now();
        escrow.clone()
    }

    fn push_escrow(&mut self, escrow: NewEscrow) -> Escrow {
        let escrow = escrow.into_escrow(Utc::now());
        self.escrows.push(escrow.clone());
        escrow
    }

    fn push_transaction(&mut self, tx: NewLedgerTransaction) -> LedgerTransactionRecord {
        let record = tx.into_record(Utc::now());
        self.transactions.push(record.clone());
        record
    }

    fn set_gig_status(&mut self, gig_id: Uuid, status: GigStatus) -> EscrowResult<()> {
        let gig = self
            .gigs
            .get_mut(&gig_id)
            .ok_or_else(|| EscrowError::not_found(format!("gig {gig_id}")))?;
        gig.status = status;
        Ok(())
    }
}

/// Store kept entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a gig as the external gig CRUD would
    pub async fn insert_gig(&self, gig: Gig) {
        self.state.write().await.gigs.insert(gig.id, gig);
    }

    /// Seed a user's wallet as the external user CRUD would
    pub async fn insert_user(&self, user_id: Uuid, wallet_address: impl Into<String>) {
        self.state
            .write()
            .await
            .wallets
            .insert(user_id, wallet_address.into());
    }
}

/// Newest first; ties keep the later insertion first
fn newest_first<T: Clone>(items: impl DoubleEndedIterator<Item = T>, created_at: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut items: Vec<T> = items.rev().collect();
    items.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
    items
}

fn page<T>(items: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    items
        .into_iter()
        .skip(usize::try_from(offset).unwrap_or(0))
        .take(usize::try_from(limit).unwrap_or(0))
        .collect()
}

#[async_trait]
impl EscrowRepository for MemoryStore {
    async fn create(&self, escrow: NewEscrow) -> EscrowResult<Escrow> {
        let mut state = self.state.write().await;
        state.check_no_active_escrow(escrow.gig_id)?;
        Ok(state.push_escrow(escrow))
    }

    async fn find_by_id(&self, id: Uuid) -> EscrowResult<Option<Escrow>> {
        let state = self.state.read().await;
        Ok(state.escrows.iter().find(|e| e.id == id).cloned())
    }

    async fn find_by_gig(&self, gig_id: Uuid) -> EscrowResult<Vec<Escrow>> {
        let state = self.state.read().await;
        Ok(newest_first(
            state.escrows.iter().filter(|e| e.gig_id == gig_id).cloned(),
            |e| e.created_at,
        ))
    }

    async fn find_active_by_gig(&self, gig_id: Uuid) -> EscrowResult<Option<Escrow>> {
        Ok(self
            .find_by_gig(gig_id)
            .await?
            .into_iter()
            .find(|e| e.status.is_active()))
    }

    async fn find_by_create_hash(&self, tx_hash: &str) -> EscrowResult<Option<Escrow>> {
        let state = self.state.read().await;
        Ok(state
            .escrows
            .iter()
            .find(|e| e.create_tx_hash.as_deref() == Some(tx_hash))
            .cloned())
    }

    async fn find_by_wallet(&self, address: &str, filter: &EscrowFilter) -> EscrowResult<Vec<Escrow>> {
        let state = self.state.read().await;
        let matching = newest_first(
            state
                .escrows
                .iter()
                .filter(|e| e.is_party(address))
                .filter(|e| filter.status.map_or(true, |s| e.status == s))
                .cloned(),
            |e| e.created_at,
        );
        Ok(page(matching, filter.limit(), filter.offset()))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: EscrowStatus,
        release_tx_hash: Option<&str>,
    ) -> EscrowResult<Escrow> {
        let mut state = self.state.write().await;
        let index = state.escrow_index(id, status)?;
        Ok(state.apply_transition(index, status, release_tx_hash))
    }

    async fn get_stats(&self, address: &str) -> EscrowResult<EscrowStats> {
        let state = self.state.read().await;
        let mut stats = EscrowStats::default();

        for escrow in state.escrows.iter().filter(|e| e.is_party(address)) {
            if escrow.client_wallet == address {
                stats.total_escrows_created += 1;
            }
            if escrow.freelancer_wallet == address {
                stats.total_escrows_received += 1;
            }
            if escrow.status.is_active() {
                stats.active_escrows += 1;
                stats.total_amount_in_escrow += escrow.amount;
            }
        }
        Ok(stats)
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> EscrowResult<Vec<Escrow>> {
        let state = self.state.read().await;
        let mut expired: Vec<Escrow> = state
            .escrows
            .iter()
            .filter(|e| e.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|e| e.cancel_after);
        Ok(expired)
    }

    async fn delete(&self, id: Uuid) -> EscrowResult<bool> {
        let mut state = self.state.write().await;
        let before = state.escrows.len();
        state.escrows.retain(|e| e.id != id);
        Ok(state.escrows.len() != before)
    }
}

#[async_trait]
impl LedgerTransactionRepository for MemoryStore {
    async fn record_transaction(&self, tx: NewLedgerTransaction) -> EscrowResult<LedgerTransactionRecord> {
        let mut state = self.state.write().await;
        state.check_new_hash(&tx.tx_hash)?;
        Ok(state.push_transaction(tx))
    }

    async fn find_transaction(&self, id: Uuid) -> EscrowResult<Option<LedgerTransactionRecord>> {
        let state = self.state.read().await;
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn find_transaction_by_hash(&self, tx_hash: &str) -> EscrowResult<Option<LedgerTransactionRecord>> {
        let state = self.state.read().await;
        Ok(state.transactions.iter().find(|t| t.tx_hash == tx_hash).cloned())
    }

    async fn find_transactions_by_gig(&self, gig_id: Uuid) -> EscrowResult<Vec<LedgerTransactionRecord>> {
        let state = self.state.read().await;
        Ok(newest_first(
            state
                .transactions
                .iter()
                .filter(|t| t.gig_id == Some(gig_id))
                .cloned(),
            |t| t.created_at,
        ))
    }

    async fn find_transactions_by_wallet(
        &self,
        address: &str,
        filter: &TransactionFilter,
    ) -> EscrowResult<Vec<LedgerTransactionRecord>> {
        let state = self.state.read().await;
        let matching = newest_first(
            state
                .transactions
                .iter()
                .filter(|t| t.from_wallet == address || t.to_wallet == address)
                .filter(|t| filter.tx_type.map_or(true, |ty| t.tx_type == ty))
                .filter(|t| filter.status.map_or(true, |s| t.status == s))
                .cloned(),
            |t| t.created_at,
        );
        Ok(page(matching, filter.limit(), filter.offset()))
    }

    async fn update_transaction_status(
        &self,
        tx_hash: &str,
        status: TxStatus,
    ) -> EscrowResult<LedgerTransactionRecord> {
        let mut state = self.state.write().await;
        let record = state
            .transactions
            .iter_mut()
            .find(|t| t.tx_hash == tx_hash)
            .ok_or_else(|| EscrowError::not_found(format!("transaction {tx_hash}")))?;

        if record.status.is_terminal() || !status.is_terminal() {
            return Err(EscrowError::conflict(format!(
                "transaction {tx_hash} cannot move from {} to {}",
                record.status.as_str(),
                status.as_str()
            )));
        }

        record.status = status;
        if status == TxStatus::Confirmed {
            record.confirmed_at = Some(Utc::now());
        }
        Ok(record.clone())
    }

    async fn get_transaction_stats(&self, address: &str) -> EscrowResult<TransactionStats> {
        let state = self.state.read().await;
        let mut stats = TransactionStats::default();

        for tx in state
            .transactions
            .iter()
            .filter(|t| t.from_wallet == address || t.to_wallet == address)
        {
            let amount = tx.amount.unwrap_or(Decimal::ZERO);
            if tx.from_wallet == address {
                stats.total_sent += amount;
            }
            if tx.to_wallet == address {
                stats.total_received += amount;
            }
            stats.total_transactions += 1;
            if tx.status == TxStatus::Pending {
                stats.pending_transactions += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl GigDirectory for MemoryStore {
    async fn get_gig(&self, id: Uuid) -> EscrowResult<Option<Gig>> {
        Ok(self.state.read().await.gigs.get(&id).cloned())
    }

    async fn set_gig_status(&self, id: Uuid, status: GigStatus) -> EscrowResult<()> {
        self.state.write().await.set_gig_status(id, status)
    }
}

#[async_trait]
impl WalletDirectory for MemoryStore {
    async fn wallet_for_user(&self, user_id: Uuid) -> EscrowResult<Option<String>> {
        Ok(self.state.read().await.wallets.get(&user_id).cloned())
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn open_escrow(
        &self,
        escrow: NewEscrow,
        record: NewLedgerTransaction,
        gig_status: GigStatus,
    ) -> EscrowResult<Escrow> {
        let mut state = self.state.write().await;
        state.check_no_active_escrow(escrow.gig_id)?;
        state.check_new_hash(&record.tx_hash)?;
        state.check_gig(escrow.gig_id)?;

        let gig_id = escrow.gig_id;
        let escrow = state.push_escrow(escrow);
        state.push_transaction(record);
        state.set_gig_status(gig_id, gig_status)?;

        debug!("Opened escrow {} for gig {}", escrow.id, gig_id);
        Ok(escrow)
    }

    async fn close_escrow(
        &self,
        transition: EscrowTransition,
        record: NewLedgerTransaction,
        gig_status: GigStatus,
    ) -> EscrowResult<Escrow> {
        let mut state = self.state.write().await;
        let index = state.escrow_index(transition.escrow_id, transition.to_status)?;
        state.check_new_hash(&record.tx_hash)?;
        let gig_id = state.escrows[index].gig_id;
        state.check_gig(gig_id)?;

        let escrow = state.apply_transition(index, transition.to_status, transition.tx_hash.as_deref());
        state.push_transaction(record);
        state.set_gig_status(gig_id, gig_status)?;

        debug!("Closed escrow {} as {}", escrow.id, escrow.status);
        Ok(escrow)
    }

    async fn ping(&self) -> EscrowResult<()> {
        Ok(())
    }
}
