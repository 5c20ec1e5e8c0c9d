//! Escrow Coordinator - intent/confirm lifecycle of ledger escrows
//!
//! Every flow is two-phase: an intent builds an unsigned ledger transaction
//! for an external wallet, and a confirm records the submitted result. The
//! coordinator checks parties and time windows; one-active-escrow-per-gig
//! and single terminal transitions are enforced by the store's guarded
//! writes, so concurrent callers lose with `Conflict` instead of racing.
//!
//! The fulfillment relayed back at confirm time comes from the caller and is
//! only used for the hash check against the condition, never for
//! authorization.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    condition::validate_fulfillment,
    error::EscrowError,
    ledger::{is_valid_address, AccountObject, Amount, LedgerClient, ObjectType},
    models::{
        Actor, Escrow, EscrowFilter, EscrowStats, EscrowStatus, EscrowTransition, GigStatus,
        LedgerTransactionRecord, NewEscrow, NewLedgerTransaction, TxStatus, TxType,
    },
    store::EscrowStore,
    tx_builder::{LedgerTransactionBuilder, TxDescriptor, DEFAULT_REFUND_WINDOW_DAYS},
    vault::FulfillmentVault,
    EscrowResult,
};

/// Configuration for the escrow coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Days between delivery and cancel-after on milestone escrows
    pub refund_window_days: i64,
    /// Check confirms against the ledger before recording them
    pub verify_on_confirm: bool,
    /// Bound on each ledger read made by the coordinator
    pub ledger_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refund_window_days: DEFAULT_REFUND_WINDOW_DAYS,
            verify_on_confirm: false,
            ledger_timeout_secs: 10,
        }
    }
}

/// Escrow creation request
#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    pub gig_id: Uuid,
    pub amount: Amount,
    pub delivery_date: DateTime<Utc>,
}

/// Unsigned EscrowCreate plus the secret the caller relays back at confirm
#[derive(Clone, Serialize)]
pub struct EscrowIntent {
    pub gig_id: Uuid,
    pub client_wallet: String,
    pub freelancer_wallet: String,
    pub amount: Decimal,
    pub delivery_date: DateTime<Utc>,
    pub finish_after: DateTime<Utc>,
    pub cancel_after: DateTime<Utc>,
    pub condition: String,
    pub fulfillment: String,
    pub transaction: TxDescriptor,
}

impl fmt::Debug for EscrowIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowIntent")
            .field("gig_id", &self.gig_id)
            .field("client_wallet", &self.client_wallet)
            .field("freelancer_wallet", &self.freelancer_wallet)
            .field("amount", &self.amount)
            .field("cancel_after", &self.cancel_after)
            .field("condition", &self.condition)
            .field("fulfillment", &"<redacted>")
            .finish()
    }
}

/// Escrow creation confirmation, sent after the EscrowCreate was submitted
#[derive(Clone, Deserialize)]
pub struct ConfirmCreateRequest {
    pub gig_id: Uuid,
    pub tx_hash: String,
    pub ledger_sequence: u32,
    pub condition: String,
    pub fulfillment: String,
    pub cancel_after: DateTime<Utc>,
    pub finish_after: Option<DateTime<Utc>>,
    pub amount: Decimal,
}

impl fmt::Debug for ConfirmCreateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmCreateRequest")
            .field("gig_id", &self.gig_id)
            .field("tx_hash", &self.tx_hash)
            .field("ledger_sequence", &self.ledger_sequence)
            .field("condition", &self.condition)
            .field("fulfillment", &"<redacted>")
            .field("cancel_after", &self.cancel_after)
            .field("amount", &self.amount)
            .finish()
    }
}

/// Unsigned finish or cancel transaction for an escrow
#[derive(Debug, Clone, Serialize)]
pub struct TransitionIntent {
    pub escrow_id: Uuid,
    pub transaction: TxDescriptor,
}

/// Escrows of a wallet with its aggregates
#[derive(Debug, Clone, Serialize)]
pub struct EscrowListing {
    pub escrows: Vec<Escrow>,
    pub stats: EscrowStats,
}

/// Outcome of one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    /// Already moved by a concurrent confirm
    pub skipped: usize,
    pub failed: Vec<Uuid>,
}

/// Orchestrates escrow creation, release, cancellation and expiry
pub struct EscrowCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn EscrowStore>,
    ledger: Arc<dyn LedgerClient>,
    vault: FulfillmentVault,
    builder: LedgerTransactionBuilder,
    clock: Arc<dyn Clock>,
}

impl EscrowCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn EscrowStore>,
        ledger: Arc<dyn LedgerClient>,
        vault: FulfillmentVault,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let builder = LedgerTransactionBuilder::new(config.refund_window_days);
        Self {
            config,
            store,
            ledger,
            vault,
            builder,
            clock,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Prepare an EscrowCreate for a gig; nothing is persisted
    pub async fn create_intent(
        &self,
        actor: &Actor,
        request: CreateIntentRequest,
    ) -> EscrowResult<EscrowIntent> {
        let gig = self
            .store
            .get_gig(request.gig_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("gig {}", request.gig_id)))?;

        if self.store.find_active_by_gig(gig.id).await?.is_some() {
            return Err(EscrowError::conflict(format!(
                "gig {} already has an active escrow",
                gig.id
            )));
        }

        let freelancer_wallet = self.freelancer_wallet(gig.owner_id).await?;
        ensure_address("client", &actor.wallet_address)?;
        ensure_address("freelancer", &freelancer_wallet)?;

        let milestone = self.builder.build_milestone_escrow(
            &actor.wallet_address,
            &freelancer_wallet,
            &request.amount,
            request.delivery_date,
        )?;

        info!(
            "Prepared escrow intent for gig {}: {} -> {}",
            gig.id, actor.wallet_address, freelancer_wallet
        );

        Ok(EscrowIntent {
            gig_id: gig.id,
            client_wallet: actor.wallet_address.clone(),
            freelancer_wallet,
            amount: request.amount.value(),
            delivery_date: request.delivery_date,
            finish_after: milestone.finish_after,
            cancel_after: milestone.cancel_after,
            condition: milestone.condition,
            fulfillment: milestone.fulfillment,
            transaction: milestone.descriptor,
        })
    }

    /// Record a submitted EscrowCreate
    ///
    /// Replaying a confirm for an already-recorded create hash returns the
    /// existing escrow.
    pub async fn confirm_create(
        &self,
        actor: &Actor,
        request: ConfirmCreateRequest,
    ) -> EscrowResult<Escrow> {
        let tx_hash = normalize_tx_hash(&request.tx_hash)?;

        if let Some(existing) = self.existing_for_create_hash(&tx_hash, request.gig_id).await? {
            info!("EscrowCreate {} already recorded as escrow {}", tx_hash, existing.id);
            return Ok(existing);
        }

        if request.amount <= Decimal::ZERO {
            return Err(EscrowError::invalid_parameter("amount must be positive"));
        }
        if let Some(finish_after) = request.finish_after {
            if finish_after >= request.cancel_after {
                return Err(EscrowError::invalid_parameter(
                    "finish_after must be before cancel_after",
                ));
            }
        }

        let gig = self
            .store
            .get_gig(request.gig_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("gig {}", request.gig_id)))?;
        let freelancer_wallet = self.freelancer_wallet(gig.owner_id).await?;
        ensure_address("client", &actor.wallet_address)?;
        ensure_address("freelancer", &freelancer_wallet)?;

        if !validate_fulfillment(&request.condition, &request.fulfillment) {
            warn!("Rejected escrow confirm for gig {}: fulfillment mismatch", gig.id);
            return Err(EscrowError::InvalidFulfillment);
        }

        if self.config.verify_on_confirm {
            self.verify_on_ledger(&tx_hash, TxType::EscrowCreate, Some(request.ledger_sequence))
                .await?;
        }

        let fulfillment_ciphertext = self.vault.encrypt(&request.fulfillment.to_uppercase())?;
        let escrow = NewEscrow {
            ledger_sequence: request.ledger_sequence,
            gig_id: gig.id,
            client_wallet: actor.wallet_address.clone(),
            freelancer_wallet: freelancer_wallet.clone(),
            amount: request.amount,
            condition: request.condition.to_uppercase(),
            fulfillment_ciphertext,
            finish_after: request.finish_after,
            cancel_after: request.cancel_after,
            create_tx_hash: Some(tx_hash.clone()),
        };
        let record = NewLedgerTransaction::confirmed_escrow(
            TxType::EscrowCreate,
            &tx_hash,
            &actor.wallet_address,
            &freelancer_wallet,
            request.amount,
            gig.id,
        );

        let escrow = match self
            .store
            .open_escrow(escrow, record, GigStatus::InProgress)
            .await
        {
            Ok(escrow) => escrow,
            Err(EscrowError::Conflict(reason)) => {
                // a concurrent replay of the same hash may have won
                if let Some(existing) = self.existing_for_create_hash(&tx_hash, gig.id).await? {
                    return Ok(existing);
                }
                return Err(EscrowError::Conflict(reason));
            }
            Err(e) => return Err(e),
        };

        info!(
            "Escrow {} created for gig {} (sequence {}, tx {})",
            escrow.id, escrow.gig_id, escrow.ledger_sequence, tx_hash
        );
        Ok(escrow)
    }

    /// Prepare an EscrowFinish carrying the decrypted fulfillment; client only
    pub async fn release_intent(&self, actor: &Actor, escrow_id: Uuid) -> EscrowResult<TransitionIntent> {
        let escrow = self.load_escrow(escrow_id).await?;

        if escrow.client_wallet != actor.wallet_address {
            return Err(EscrowError::forbidden("only the client can release the escrow"));
        }
        ensure_active(&escrow)?;

        let fulfillment = self.vault.decrypt(&escrow.fulfillment_ciphertext)?;
        let transaction = self.builder.build_escrow_finish(
            &actor.wallet_address,
            &escrow.client_wallet,
            escrow.ledger_sequence,
            Some(&fulfillment),
        )?;

        info!("Prepared release intent for escrow {}", escrow.id);
        Ok(TransitionIntent {
            escrow_id: escrow.id,
            transaction,
        })
    }

    /// Record a submitted EscrowFinish
    pub async fn release_confirm(
        &self,
        actor: &Actor,
        escrow_id: Uuid,
        tx_hash: &str,
    ) -> EscrowResult<Escrow> {
        let tx_hash = normalize_tx_hash(tx_hash)?;
        let escrow = self.load_escrow(escrow_id).await?;

        ensure_party(&escrow, actor)?;
        ensure_active(&escrow)?;

        if self.config.verify_on_confirm {
            self.verify_on_ledger(&tx_hash, TxType::EscrowFinish, None).await?;
        }

        let transition = EscrowTransition::new(escrow.id, EscrowStatus::Released, Some(&tx_hash))?;
        let record = NewLedgerTransaction::confirmed_escrow(
            TxType::EscrowFinish,
            &tx_hash,
            &escrow.client_wallet,
            &escrow.freelancer_wallet,
            escrow.amount,
            escrow.gig_id,
        );

        let released = self
            .store
            .close_escrow(transition, record, GigStatus::Completed)
            .await?;

        info!("Escrow {} released (tx {})", released.id, tx_hash);
        Ok(released)
    }

    /// Prepare an EscrowCancel; either party, once cancel-after is reached
    pub async fn cancel_intent(&self, actor: &Actor, escrow_id: Uuid) -> EscrowResult<TransitionIntent> {
        let escrow = self.load_escrow(escrow_id).await?;

        ensure_party(&escrow, actor)?;
        ensure_active(&escrow)?;
        self.ensure_cancellable(&escrow)?;

        let transaction = self.builder.build_escrow_cancel(
            &actor.wallet_address,
            &escrow.client_wallet,
            escrow.ledger_sequence,
        );

        info!("Prepared cancel intent for escrow {}", escrow.id);
        Ok(TransitionIntent {
            escrow_id: escrow.id,
            transaction,
        })
    }

    /// Record a submitted EscrowCancel; the refund flows freelancer -> client
    pub async fn cancel_confirm(
        &self,
        actor: &Actor,
        escrow_id: Uuid,
        tx_hash: &str,
    ) -> EscrowResult<Escrow> {
        let tx_hash = normalize_tx_hash(tx_hash)?;
        let escrow = self.load_escrow(escrow_id).await?;

        ensure_party(&escrow, actor)?;
        ensure_active(&escrow)?;
        self.ensure_cancellable(&escrow)?;

        if self.config.verify_on_confirm {
            self.verify_on_ledger(&tx_hash, TxType::EscrowCancel, None).await?;
        }

        let transition = EscrowTransition::new(escrow.id, EscrowStatus::Cancelled, Some(&tx_hash))?;
        let record = NewLedgerTransaction::confirmed_escrow(
            TxType::EscrowCancel,
            &tx_hash,
            &escrow.freelancer_wallet,
            &escrow.client_wallet,
            escrow.amount,
            escrow.gig_id,
        );

        let cancelled = self
            .store
            .close_escrow(transition, record, GigStatus::Cancelled)
            .await?;

        info!("Escrow {} cancelled (tx {})", cancelled.id, tx_hash);
        Ok(cancelled)
    }

    /// Mark every `created` escrow past cancel-after as expired
    ///
    /// Local bookkeeping only. Each escrow is handled on its own; a failure
    /// is logged and retried on the next sweep.
    pub async fn sweep_expired(&self) -> EscrowResult<SweepReport> {
        let now = self.clock.now();
        let candidates = self.store.find_expired(now).await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for escrow in candidates {
            match self
                .store
                .update_status(escrow.id, EscrowStatus::Expired, None)
                .await
            {
                Ok(_) => {
                    debug!("Escrow {} expired (cancel_after {})", escrow.id, escrow.cancel_after);
                    report.expired += 1;
                }
                Err(EscrowError::Conflict(_)) => {
                    debug!("Escrow {} left created state during sweep", escrow.id);
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!("Failed to expire escrow {}: {}", escrow.id, e);
                    report.failed.push(escrow.id);
                }
            }
        }

        info!(
            "Expiry sweep: {} examined, {} expired, {} skipped, {} failed",
            report.examined,
            report.expired,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }

    /// Escrow details; parties only
    pub async fn get_escrow(&self, actor: &Actor, escrow_id: Uuid) -> EscrowResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;
        ensure_party(&escrow, actor)?;
        Ok(escrow)
    }

    /// The actor's escrows (either role) plus aggregates
    pub async fn list_escrows(&self, actor: &Actor, filter: &EscrowFilter) -> EscrowResult<EscrowListing> {
        let escrows = self
            .store
            .find_by_wallet(&actor.wallet_address, filter)
            .await?;
        let stats = self.store.get_stats(&actor.wallet_address).await?;
        Ok(EscrowListing { escrows, stats })
    }

    /// The ledger object backing an escrow, if it still exists on the ledger
    pub async fn ledger_escrow(&self, actor: &Actor, escrow_id: Uuid) -> EscrowResult<Option<AccountObject>> {
        let escrow = self.get_escrow(actor, escrow_id).await?;

        let objects = self
            .bounded(
                "account_objects",
                self.ledger
                    .get_account_objects(&escrow.client_wallet, ObjectType::Escrow),
            )
            .await?;

        let by_hash = escrow.create_tx_hash.as_deref().and_then(|hash| {
            objects.iter().find(|o| {
                o.previous_txn_id
                    .as_deref()
                    .is_some_and(|id| id.eq_ignore_ascii_case(hash))
            })
        });
        let found = by_hash.or_else(|| {
            objects
                .iter()
                .find(|o| o.previous_txn_lgr_seq == Some(escrow.ledger_sequence))
        });

        Ok(found.cloned())
    }

    /// Move a pending transaction record to its ledger outcome
    ///
    /// Records still pending on the ledger (unknown or unvalidated) are
    /// returned unchanged.
    pub async fn reconcile_transaction(&self, tx_hash: &str) -> EscrowResult<LedgerTransactionRecord> {
        let tx_hash = normalize_tx_hash(tx_hash)?;
        let record = self
            .store
            .find_transaction_by_hash(&tx_hash)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("transaction {tx_hash}")))?;

        if record.status.is_terminal() {
            return Ok(record);
        }

        let ledger_tx = match self
            .bounded("tx", self.ledger.get_transaction(&tx_hash))
            .await
        {
            Ok(tx) => tx,
            Err(EscrowError::NotFound(_)) => return Ok(record),
            Err(e) => return Err(e),
        };
        if !ledger_tx.validated {
            return Ok(record);
        }

        let status = if ledger_tx.is_success() {
            TxStatus::Confirmed
        } else {
            TxStatus::Failed
        };

        match self.store.update_transaction_status(&tx_hash, status).await {
            Ok(updated) => {
                info!("Transaction {} reconciled as {}", tx_hash, status.as_str());
                Ok(updated)
            }
            Err(EscrowError::Conflict(_)) => self
                .store
                .find_transaction_by_hash(&tx_hash)
                .await?
                .ok_or_else(|| EscrowError::not_found(format!("transaction {tx_hash}"))),
            Err(e) => Err(e),
        }
    }

    async fn load_escrow(&self, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.store
            .find_by_id(escrow_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("escrow {escrow_id}")))
    }

    async fn freelancer_wallet(&self, owner_id: Uuid) -> EscrowResult<String> {
        self.store
            .wallet_for_user(owner_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("wallet for freelancer {owner_id}")))
    }

    async fn existing_for_create_hash(&self, tx_hash: &str, gig_id: Uuid) -> EscrowResult<Option<Escrow>> {
        match self.store.find_by_create_hash(tx_hash).await? {
            Some(existing) if existing.gig_id == gig_id => Ok(Some(existing)),
            Some(existing) => Err(EscrowError::conflict(format!(
                "transaction {tx_hash} already recorded for gig {}",
                existing.gig_id
            ))),
            None => Ok(None),
        }
    }

    fn ensure_cancellable(&self, escrow: &Escrow) -> EscrowResult<()> {
        if escrow.is_cancellable_at(self.clock.now()) {
            Ok(())
        } else {
            Err(EscrowError::TooEarly {
                cancel_after: escrow.cancel_after,
            })
        }
    }

    /// Check a confirm's hash against the ledger before anything is written
    async fn verify_on_ledger(
        &self,
        tx_hash: &str,
        expected: TxType,
        sequence: Option<u32>,
    ) -> EscrowResult<()> {
        let tx = match self.bounded("tx", self.ledger.get_transaction(tx_hash)).await {
            Ok(tx) => tx,
            Err(EscrowError::NotFound(_)) => {
                return Err(EscrowError::ledger_io(format!(
                    "transaction {tx_hash} is not yet known to the ledger"
                )))
            }
            Err(e) => return Err(e),
        };

        if tx.tx_type != expected.ledger_name() {
            return Err(EscrowError::invalid_parameter(format!(
                "transaction {tx_hash} is {}, expected {}",
                tx.tx_type,
                expected.ledger_name()
            )));
        }
        if !tx.validated {
            return Err(EscrowError::timeout(format!(
                "transaction {tx_hash} is not validated yet"
            )));
        }
        if !tx.is_success() {
            return Err(EscrowError::ledger(format!(
                "transaction {tx_hash} failed with {}",
                tx.result_code.as_deref().unwrap_or("no result")
            )));
        }
        if let (Some(expected_seq), Some(actual_seq)) = (sequence, tx.sequence) {
            if expected_seq != actual_seq {
                return Err(EscrowError::invalid_parameter(format!(
                    "transaction {tx_hash} has sequence {actual_seq}, expected {expected_seq}"
                )));
            }
        }

        debug!("Verified {} {} on the ledger", expected.ledger_name(), tx_hash);
        Ok(())
    }

    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = EscrowResult<T>>,
    ) -> EscrowResult<T> {
        let limit = Duration::from_secs(self.config.ledger_timeout_secs);
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| EscrowError::timeout(format!("ledger {what} exceeded {limit:?}")))?
    }
}

fn ensure_address(role: &str, address: &str) -> EscrowResult<()> {
    if is_valid_address(address) {
        Ok(())
    } else {
        Err(EscrowError::invalid_address(format!(
            "invalid {role} wallet address '{address}'"
        )))
    }
}

fn ensure_party(escrow: &Escrow, actor: &Actor) -> EscrowResult<()> {
    if escrow.is_party(&actor.wallet_address) {
        Ok(())
    } else {
        Err(EscrowError::forbidden(format!(
            "not a party to escrow {}",
            escrow.id
        )))
    }
}

fn ensure_active(escrow: &Escrow) -> EscrowResult<()> {
    if escrow.status.is_active() {
        Ok(())
    } else {
        Err(EscrowError::conflict(format!(
            "escrow {} is already {}",
            escrow.id, escrow.status
        )))
    }
}

/// Ledger hashes are 32 bytes of hex; stored uppercase
fn normalize_tx_hash(tx_hash: &str) -> EscrowResult<String> {
    if tx_hash.len() == 64 && tx_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(tx_hash.to_ascii_uppercase())
    } else {
        Err(EscrowError::invalid_parameter(format!(
            "'{tx_hash}' is not a ledger transaction hash"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ledger::{scripted::ScriptedLedger, SUCCESS_RESULT};
    use crate::models::{Gig, TransactionFilter};
    use crate::store::{
        EscrowRepository, GigDirectory, LedgerTransactionRepository, MemoryStore,
    };
    use chrono::{Duration as ChronoDuration, TimeZone};

    const CLIENT: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
    const FREELANCER: &str = "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe";
    const STRANGER: &str = "rf1BiGeXwwQoi8Z2ueFYTEXSwuJYfV2Jpn";

    struct Fixture {
        coordinator: Arc<EscrowCoordinator>,
        store: Arc<MemoryStore>,
        ledger: Arc<ScriptedLedger>,
        clock: Arc<FixedClock>,
        client: Actor,
        freelancer: Actor,
        stranger: Actor,
        gig_id: Uuid,
    }

    fn hash(n: u8) -> String {
        format!("{n:02X}").repeat(32)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    async fn fixture_with(config: CoordinatorConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(ScriptedLedger::new());
        let clock = Arc::new(FixedClock::new(start()));

        let client = Actor::new(Uuid::new_v4(), CLIENT);
        let freelancer = Actor::new(Uuid::new_v4(), FREELANCER);
        let stranger = Actor::new(Uuid::new_v4(), STRANGER);
        store.insert_user(client.user_id, CLIENT).await;
        store.insert_user(freelancer.user_id, FREELANCER).await;

        let gig_id = Uuid::new_v4();
        store
            .insert_gig(Gig {
                id: gig_id,
                owner_id: freelancer.user_id,
                status: GigStatus::Open,
            })
            .await;

        let coordinator = Arc::new(EscrowCoordinator::new(
            config,
            store.clone(),
            ledger.clone(),
            FulfillmentVault::new("coordinator-test-key").unwrap(),
            clock.clone(),
        ));

        Fixture {
            coordinator,
            store,
            ledger,
            clock,
            client,
            freelancer,
            stranger,
            gig_id,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(CoordinatorConfig::default()).await
    }

    fn ten() -> Amount {
        Amount::native(Decimal::new(10, 0))
    }

    fn confirm_request(fx: &Fixture, intent: &EscrowIntent, tx_hash: &str) -> ConfirmCreateRequest {
        ConfirmCreateRequest {
            gig_id: fx.gig_id,
            tx_hash: tx_hash.to_string(),
            ledger_sequence: 7,
            condition: intent.condition.clone(),
            fulfillment: intent.fulfillment.clone(),
            cancel_after: intent.cancel_after,
            finish_after: Some(intent.finish_after),
            amount: intent.amount,
        }
    }

    async fn intent(fx: &Fixture) -> EscrowIntent {
        fx.coordinator
            .create_intent(
                &fx.client,
                CreateIntentRequest {
                    gig_id: fx.gig_id,
                    amount: ten(),
                    delivery_date: start() + ChronoDuration::days(7),
                },
            )
            .await
            .unwrap()
    }

    async fn created_escrow(fx: &Fixture) -> Escrow {
        let intent = intent(fx).await;
        fx.coordinator
            .confirm_create(&fx.client, confirm_request(fx, &intent, &hash(1)))
            .await
            .unwrap()
    }

    async fn gig_status(fx: &Fixture) -> GigStatus {
        fx.store.get_gig(fx.gig_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_create_and_confirm_scenario() {
        let fx = fixture().await;
        let intent = intent(&fx).await;

        assert_eq!(intent.freelancer_wallet, FREELANCER);
        assert_eq!(intent.amount, Decimal::new(10, 0));
        assert_eq!(intent.cancel_after, start() + ChronoDuration::days(37));
        assert_eq!(intent.transaction.transaction_type(), "EscrowCreate");
        assert!(!format!("{intent:?}").contains(&intent.fulfillment));

        let mut wrong = confirm_request(&fx, &intent, &hash(1));
        wrong.fulfillment = hash(0xAB);
        let err = fx.coordinator.confirm_create(&fx.client, wrong).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidFulfillment));
        assert!(fx.store.find_by_gig(fx.gig_id).await.unwrap().is_empty());
        assert_eq!(gig_status(&fx).await, GigStatus::Open);

        let escrow = fx
            .coordinator
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(1)))
            .await
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Created);
        assert_eq!(escrow.client_wallet, CLIENT);
        assert_eq!(escrow.condition, intent.condition);
        assert_ne!(escrow.fulfillment_ciphertext, intent.fulfillment);
        assert_eq!(gig_status(&fx).await, GigStatus::InProgress);

        let record = fx
            .store
            .find_transaction_by_hash(&hash(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.tx_type, TxType::EscrowCreate);
        assert_eq!(record.status, TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_create_intent_rejects_active_gig_and_bad_input() {
        let fx = fixture().await;
        created_escrow(&fx).await;

        let err = fx
            .coordinator
            .create_intent(
                &fx.client,
                CreateIntentRequest {
                    gig_id: fx.gig_id,
                    amount: ten(),
                    delivery_date: start(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict(_)));

        let err = fx
            .coordinator
            .create_intent(
                &fx.client,
                CreateIntentRequest {
                    gig_id: Uuid::new_v4(),
                    amount: ten(),
                    delivery_date: start(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_intent_validation() {
        let fx = fixture().await;

        let bad_client = Actor::new(fx.client.user_id, "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTi");
        let err = fx
            .coordinator
            .create_intent(
                &bad_client,
                CreateIntentRequest {
                    gig_id: fx.gig_id,
                    amount: ten(),
                    delivery_date: start(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidAddress(_)));

        let err = fx
            .coordinator
            .create_intent(
                &fx.client,
                CreateIntentRequest {
                    gig_id: fx.gig_id,
                    amount: Amount::Issued {
                        currency: "USD".to_string(),
                        issuer: STRANGER.to_string(),
                        value: Decimal::new(10, 0),
                    },
                    delivery_date: start(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::UnsupportedCurrency(_)));

        fx.store.insert_user(fx.freelancer.user_id, "not-an-address").await;
        let err = fx
            .coordinator
            .create_intent(
                &fx.client,
                CreateIntentRequest {
                    gig_id: fx.gig_id,
                    amount: ten(),
                    delivery_date: start(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_confirm_create_is_idempotent_per_hash() {
        let fx = fixture().await;
        let intent = intent(&fx).await;

        let first = fx
            .coordinator
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(1)))
            .await
            .unwrap();
        let replay = fx
            .coordinator
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(1).to_lowercase()))
            .await
            .unwrap();

        assert_eq!(first.id, replay.id);
        assert_eq!(fx.store.find_by_gig(fx.gig_id).await.unwrap().len(), 1);
        assert_eq!(fx.store.find_transactions_by_gig(fx.gig_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_confirms_for_one_gig() {
        let fx = fixture().await;
        let intent = intent(&fx).await;

        let (a, b) = tokio::join!(
            fx.coordinator
                .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(1))),
            fx.coordinator
                .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(2))),
        );

        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(EscrowError::Conflict(_)))));
        assert_eq!(fx.store.find_by_gig(fx.gig_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_intent_is_client_only() {
        let fx = fixture().await;
        let escrow = created_escrow(&fx).await;

        let err = fx
            .coordinator
            .release_intent(&fx.freelancer, escrow.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Forbidden(_)));

        let intent = fx.coordinator.release_intent(&fx.client, escrow.id).await.unwrap();
        match intent.transaction {
            TxDescriptor::EscrowFinish(tx) => {
                assert_eq!(tx.owner, CLIENT);
                assert_eq!(tx.offer_sequence, 7);
                let fulfillment = tx.fulfillment.unwrap();
                assert!(validate_fulfillment(&escrow.condition, &fulfillment));
                assert_eq!(tx.condition.as_deref(), Some(escrow.condition.as_str()));
            }
            other => panic!("unexpected descriptor {other:?}"),
        }

        let unchanged = fx.store.find_by_id(escrow.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, EscrowStatus::Created);
    }

    #[tokio::test]
    async fn test_release_confirm_twice_conflicts() {
        let fx = fixture().await;
        let escrow = created_escrow(&fx).await;

        let released = fx
            .coordinator
            .release_confirm(&fx.client, escrow.id, &hash(2))
            .await
            .unwrap();
        assert_eq!(released.status, EscrowStatus::Released);
        assert_eq!(released.release_tx_hash.as_deref(), Some(hash(2).as_str()));
        assert_eq!(gig_status(&fx).await, GigStatus::Completed);

        let err = fx
            .coordinator
            .release_confirm(&fx.client, escrow.id, &hash(3))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict(_)));

        let finishes = fx
            .store
            .find_transactions_by_wallet(
                CLIENT,
                &TransactionFilter {
                    tx_type: Some(TxType::EscrowFinish),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(finishes.len(), 1);

        let err = fx
            .coordinator
            .release_intent(&fx.client, escrow.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_window_boundary() {
        let fx = fixture().await;
        let escrow = created_escrow(&fx).await;

        fx.clock.set(escrow.cancel_after - ChronoDuration::seconds(1));
        match fx.coordinator.cancel_intent(&fx.client, escrow.id).await {
            Err(EscrowError::TooEarly { cancel_after }) => assert_eq!(cancel_after, escrow.cancel_after),
            other => panic!("expected TooEarly, got {other:?}"),
        }

        fx.clock.set(escrow.cancel_after);
        let intent = fx
            .coordinator
            .cancel_intent(&fx.freelancer, escrow.id)
            .await
            .unwrap();
        assert_eq!(intent.transaction.transaction_type(), "EscrowCancel");

        let err = fx
            .coordinator
            .cancel_intent(&fx.stranger, escrow.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_cancel_confirm_records_refund() {
        let fx = fixture().await;
        let escrow = created_escrow(&fx).await;

        let err = fx
            .coordinator
            .cancel_confirm(&fx.client, escrow.id, &hash(4))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::TooEarly { .. }));

        fx.clock.set(escrow.cancel_after + ChronoDuration::hours(1));
        let cancelled = fx
            .coordinator
            .cancel_confirm(&fx.client, escrow.id, &hash(4))
            .await
            .unwrap();
        assert_eq!(cancelled.status, EscrowStatus::Cancelled);
        assert_eq!(gig_status(&fx).await, GigStatus::Cancelled);

        let record = fx
            .store
            .find_transaction_by_hash(&hash(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.tx_type, TxType::EscrowCancel);
        assert_eq!(record.from_wallet, FREELANCER);
        assert_eq!(record.to_wallet, CLIENT);
    }

    #[tokio::test]
    async fn test_release_and_cancel_race() {
        let fx = fixture().await;
        let escrow = created_escrow(&fx).await;
        fx.clock.set(escrow.cancel_after);

        let (release_hash, cancel_hash) = (hash(5), hash(6));
        let (release, cancel) = tokio::join!(
            fx.coordinator.release_confirm(&fx.client, escrow.id, &release_hash),
            fx.coordinator.cancel_confirm(&fx.freelancer, escrow.id, &cancel_hash),
        );

        assert!(release.is_ok() ^ cancel.is_ok());
        let loser = if release.is_ok() { cancel } else { release };
        assert!(matches!(loser, Err(EscrowError::Conflict(_))));

        let records = fx.store.find_transactions_by_gig(fx.gig_id).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_expires_only_past_due() {
        let fx = fixture().await;
        let due = created_escrow(&fx).await;

        let other_gig = Uuid::new_v4();
        fx.store
            .insert_gig(Gig {
                id: other_gig,
                owner_id: fx.freelancer.user_id,
                status: GigStatus::Open,
            })
            .await;
        let later = fx
            .coordinator
            .confirm_create(
                &fx.client,
                ConfirmCreateRequest {
                    gig_id: other_gig,
                    tx_hash: hash(9),
                    ledger_sequence: 8,
                    condition: crate::condition::condition_for(&hash(0x42)).unwrap(),
                    fulfillment: hash(0x42),
                    cancel_after: due.cancel_after + ChronoDuration::days(10),
                    finish_after: None,
                    amount: Decimal::new(5, 0),
                },
            )
            .await
            .unwrap();

        fx.clock.set(due.cancel_after + ChronoDuration::seconds(1));
        let report = fx.coordinator.sweep_expired().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.expired, 1);
        assert!(report.failed.is_empty());

        let due = fx.store.find_by_id(due.id).await.unwrap().unwrap();
        let later = fx.store.find_by_id(later.id).await.unwrap().unwrap();
        assert_eq!(due.status, EscrowStatus::Expired);
        assert_eq!(later.status, EscrowStatus::Created);

        let again = fx.coordinator.sweep_expired().await.unwrap();
        assert_eq!(again.examined, 0);
    }

    #[tokio::test]
    async fn test_get_and_list_escrows() {
        let fx = fixture().await;
        let escrow = created_escrow(&fx).await;

        let seen = fx.coordinator.get_escrow(&fx.freelancer, escrow.id).await.unwrap();
        assert_eq!(seen.id, escrow.id);

        let err = fx
            .coordinator
            .get_escrow(&fx.stranger, escrow.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Forbidden(_)));

        let err = fx
            .coordinator
            .get_escrow(&fx.client, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotFound(_)));

        let listing = fx
            .coordinator
            .list_escrows(&fx.client, &EscrowFilter::default())
            .await
            .unwrap();
        assert_eq!(listing.escrows.len(), 1);
        assert_eq!(listing.stats.total_escrows_created, 1);
        assert_eq!(listing.stats.active_escrows, 1);
        assert_eq!(listing.stats.total_amount_in_escrow, Decimal::new(10, 0));

        let json = serde_json::to_string(&listing).unwrap();
        assert!(!json.contains(&escrow.fulfillment_ciphertext));
    }

    #[tokio::test]
    async fn test_verify_on_confirm() {
        let fx = fixture_with(CoordinatorConfig {
            verify_on_confirm: true,
            ..Default::default()
        })
        .await;
        let intent = intent(&fx).await;

        let err = fx
            .coordinator
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(1)))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        fx.ledger
            .add_transaction(ScriptedLedger::validated(&hash(1), "EscrowCreate", "tecNO_PERMISSION"));
        let err = fx
            .coordinator
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Ledger(_)));

        let mut pending = ScriptedLedger::validated(&hash(2), "EscrowCreate", SUCCESS_RESULT);
        pending.validated = false;
        fx.ledger.add_transaction(pending);
        let err = fx
            .coordinator
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(2)))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        fx.ledger
            .add_transaction(ScriptedLedger::validated(&hash(3), "Payment", SUCCESS_RESULT));
        let err = fx
            .coordinator
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidParameter(_)));

        assert!(fx.store.find_by_gig(fx.gig_id).await.unwrap().is_empty());

        fx.ledger
            .add_transaction(ScriptedLedger::validated(&hash(4), "EscrowCreate", SUCCESS_RESULT));
        let escrow = fx
            .coordinator
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(4)))
            .await
            .unwrap();
        assert_eq!(escrow.create_tx_hash.as_deref(), Some(hash(4).as_str()));
    }

    /// Ledger whose reads never complete
    struct StalledLedger;

    #[async_trait::async_trait]
    impl LedgerClient for StalledLedger {
        async fn connect(&self) -> EscrowResult<()> {
            Ok(())
        }

        async fn disconnect(&self) -> EscrowResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn submit_and_wait(&self, _blob: &str) -> EscrowResult<crate::ledger::SubmitOutcome> {
            std::future::pending().await
        }

        async fn get_transaction(&self, _hash: &str) -> EscrowResult<crate::ledger::LedgerTransaction> {
            std::future::pending().await
        }

        async fn get_account_objects(
            &self,
            _address: &str,
            _object_type: ObjectType,
        ) -> EscrowResult<Vec<AccountObject>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_timeout_persists_nothing() {
        let config = CoordinatorConfig {
            verify_on_confirm: true,
            ledger_timeout_secs: 2,
            ..Default::default()
        };
        let fx = fixture_with(config.clone()).await;
        let intent = intent(&fx).await;

        let stalled = EscrowCoordinator::new(
            config,
            fx.store.clone(),
            Arc::new(StalledLedger),
            FulfillmentVault::new("coordinator-test-key").unwrap(),
            fx.clock.clone(),
        );

        let err = stalled
            .confirm_create(&fx.client, confirm_request(&fx, &intent, &hash(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Timeout(_)));
        assert!(err.is_transient());

        assert!(fx.store.find_by_gig(fx.gig_id).await.unwrap().is_empty());
        assert!(fx.store.find_transaction_by_hash(&hash(1)).await.unwrap().is_none());
        assert_eq!(gig_status(&fx).await, GigStatus::Open);

        fx.ledger
            .add_transaction(ScriptedLedger::validated(&hash(1), "EscrowCreate", SUCCESS_RESULT));
        let escrow = created_escrow(&fx).await;
        let err = stalled.ledger_escrow(&fx.client, escrow.id).await.unwrap_err();
        assert!(matches!(err, EscrowError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_create_intent_rejects_far_future_delivery() {
        let fx = fixture().await;

        let err = fx
            .coordinator
            .create_intent(
                &fx.client,
                CreateIntentRequest {
                    gig_id: fx.gig_id,
                    amount: ten(),
                    delivery_date: DateTime::<Utc>::MAX_UTC,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_short_fulfillment_is_rejected() {
        let fx = fixture().await;
        let intent = intent(&fx).await;

        let mut request = confirm_request(&fx, &intent, &hash(1));
        request.fulfillment = "AB".to_string();
        request.condition = hex::encode_upper(<sha2::Sha256 as sha2::Digest>::digest([0xAB]));

        let err = fx
            .coordinator
            .confirm_create(&fx.client, request)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidFulfillment));
        assert!(fx.store.find_by_gig(fx.gig_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_escrow_lookup() {
        let fx = fixture().await;
        let escrow = created_escrow(&fx).await;

        assert!(fx
            .coordinator
            .ledger_escrow(&fx.client, escrow.id)
            .await
            .unwrap()
            .is_none());

        let object = AccountObject::from_json(serde_json::json!({
            "LedgerEntryType": "Escrow",
            "Account": CLIENT,
            "Destination": FREELANCER,
            "Amount": "10000000",
            "PreviousTxnID": hash(1).to_lowercase(),
            "PreviousTxnLgrSeq": 555
        }))
        .unwrap();
        fx.ledger.add_object(CLIENT, object);

        let found = fx
            .coordinator
            .ledger_escrow(&fx.freelancer, escrow.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.previous_txn_lgr_seq, Some(555));
    }

    #[tokio::test]
    async fn test_reconcile_pending_transaction() {
        let fx = fixture().await;
        let mut pending = NewLedgerTransaction::confirmed_escrow(
            TxType::Payment,
            &hash(7),
            CLIENT,
            FREELANCER,
            Decimal::new(1, 0),
            fx.gig_id,
        );
        pending.status = TxStatus::Pending;
        fx.store.record_transaction(pending).await.unwrap();

        let unchanged = fx.coordinator.reconcile_transaction(&hash(7)).await.unwrap();
        assert_eq!(unchanged.status, TxStatus::Pending);

        fx.ledger
            .add_transaction(ScriptedLedger::validated(&hash(7), "Payment", SUCCESS_RESULT));
        let confirmed = fx.coordinator.reconcile_transaction(&hash(7)).await.unwrap();
        assert_eq!(confirmed.status, TxStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());

        let err = fx
            .coordinator
            .reconcile_transaction("not-a-hash")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidParameter(_)));
    }
}
