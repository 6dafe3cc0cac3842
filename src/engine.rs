// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 The escrow-ledger developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Ledger and escrow workflows.
//!
//! [`LedgerEngine`] is the central component: it owns the store, the
//! journal engine, the idempotency guard, and the deal/dispute/staged
//! deposit records, and exposes the money-moving operations: deposits,
//! escrow funding, fee-split release, dispute arbitration, spend,
//! refund, and reconciliation.
//!
//! # Transaction discipline
//!
//! Status transitions commit under the same record mutex as the journal
//! post, so a deal is released at most once and a dispute resolved at
//! most once. External processor calls happen strictly before the
//! atomic apply (payment intents, refunds) or strictly after it
//! (payout transfers); never under ledger locks. A failed payout does
//! not roll back the committed journal; the ledger is the source of
//! truth and the transfer is queued for reconciliation.

use crate::account::AccountKind;
use crate::base::{Actor, Currency, DealId, DepositId, DisputeId, JournalId, OwnerId};
use crate::deal::{Deal, DealStatus, Dispute, DisputeState, DisputeWinner};
use crate::entry::{EntryRef, Leg};
use crate::error::LedgerError;
use crate::events::{DepositState, StagedDeposit};
use crate::idempotency::{IdempotencyGuard, IdempotencyKey, Outcome};
use crate::journal::JournalEngine;
use crate::processor::{IntentStatus, PaymentProcessor};
use crate::store::LedgerStore;
use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Fixed platform parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Platform fee taken on release, in whole percent.
    pub fee_percent: u8,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// Default currency for the CLI and demos.
    pub currency: Currency,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_percent: 10,
            webhook_secret: "whsec_dev".into(),
            currency: Currency::new("usd"),
        }
    }
}

/// A seller's connected payout destination and its eligibility flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutProfile {
    pub account: String,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
}

/// One administrative or workflow action, append-only.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: Actor,
    pub action: &'static str,
    pub target: String,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// A payout transfer that failed and awaits a reconciliation retry.
#[derive(Debug, Clone)]
pub struct PendingPayout {
    pub deal_id: DealId,
    pub seller: OwnerId,
    pub destination: String,
    pub amount: i64,
    pub currency: Currency,
}

/// An executed processor refund whose ledger mirror has not committed,
/// awaiting a reconciliation retry.
#[derive(Debug, Clone)]
pub struct PendingRefund {
    pub payment_ref: String,
    pub refund_ref: String,
    pub owner: OwnerId,
    pub amount: i64,
    pub currency: Currency,
}

/// Result of `deposit_request`: what the paying client needs.
#[derive(Debug, Clone)]
pub struct DepositRequest {
    pub deposit_id: DepositId,
    pub payment_ref: String,
    pub client_secret: String,
}

/// Result of a successful release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub journal_id: JournalId,
    pub seller_amount: i64,
    pub fee: i64,
    /// Processor transfer reference when the best-effort payout went out.
    pub transfer: Option<String>,
}

/// Result of dispute resolution; `replayed` marks the idempotent path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisputeOutcome {
    pub journal_id: JournalId,
    pub winner: DisputeWinner,
    pub replayed: bool,
}

/// Result of a refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundOutcome {
    pub journal_id: JournalId,
    pub refund_ref: String,
    pub amount: i64,
}

/// Invariant sweep over every committed journal and account.
#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub journals_checked: usize,
    pub accounts_checked: usize,
    pub issues: Vec<String>,
    /// Size of the eventual-consistency window: payouts not yet settled
    /// externally.
    pub pending_payouts: usize,
    /// Refunds executed by the processor but not yet mirrored into the
    /// ledger.
    pub pending_refunds: usize,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// The ledger and escrow engine.
pub struct LedgerEngine {
    config: EngineConfig,
    store: Arc<LedgerStore>,
    journal: JournalEngine,
    guard: IdempotencyGuard,
    deals: DashMap<DealId, Arc<Deal>>,
    disputes: DashMap<DisputeId, Arc<Dispute>>,
    dispute_by_deal: DashMap<DealId, DisputeId>,
    /// Staged deposits keyed by processor payment reference.
    staged: DashMap<String, Mutex<StagedDeposit>>,
    deposit_refs: DashMap<DepositId, String>,
    payout_profiles: DashMap<OwnerId, PayoutProfile>,
    pending_payouts: SegQueue<PendingPayout>,
    pending_refunds: SegQueue<PendingRefund>,
    audit: Mutex<Vec<AuditRecord>>,
    processor: Arc<dyn PaymentProcessor>,
    next_deal: AtomicU64,
    next_dispute: AtomicU64,
    next_deposit: AtomicU64,
}

impl LedgerEngine {
    pub fn new(config: EngineConfig, processor: Arc<dyn PaymentProcessor>) -> Self {
        debug_assert!(config.fee_percent <= 100, "fee percent out of range");
        let store = Arc::new(LedgerStore::new());
        Self {
            journal: JournalEngine::new(Arc::clone(&store)),
            store,
            guard: IdempotencyGuard::new(),
            config,
            deals: DashMap::new(),
            disputes: DashMap::new(),
            dispute_by_deal: DashMap::new(),
            staged: DashMap::new(),
            deposit_refs: DashMap::new(),
            payout_profiles: DashMap::new(),
            pending_payouts: SegQueue::new(),
            pending_refunds: SegQueue::new(),
            audit: Mutex::new(Vec::new()),
            processor,
            next_deal: AtomicU64::new(0),
            next_dispute: AtomicU64::new(0),
            next_deposit: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    // === Balance queries ===

    /// Owner's available balance, zero if the account was never touched.
    pub fn available_balance(&self, owner: OwnerId, currency: &Currency) -> i64 {
        self.balance_of(Some(owner), AccountKind::Available, currency)
    }

    pub fn escrow_balance(&self, owner: OwnerId, currency: &Currency) -> i64 {
        self.balance_of(Some(owner), AccountKind::Escrow, currency)
    }

    pub fn platform_revenue_balance(&self, currency: &Currency) -> i64 {
        self.balance_of(None, AccountKind::PlatformRevenue, currency)
    }

    fn balance_of(&self, owner: Option<OwnerId>, kind: AccountKind, currency: &Currency) -> i64 {
        self.store
            .lookup(owner, kind, currency)
            .and_then(|id| self.store.account(id))
            .map(|a| a.balance())
            .unwrap_or(0)
    }

    // === Deposits ===

    /// Creates a processor payment intent and stages a local deposit
    /// record awaiting settlement events.
    ///
    /// The external call happens before any local record exists; a
    /// processor timeout leaves nothing behind to reconcile.
    pub fn deposit_request(
        &self,
        owner: OwnerId,
        amount: i64,
        currency: &Currency,
    ) -> Result<DepositRequest, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let intent = self.processor.create_payment_intent(owner, amount, currency)?;
        let id = DepositId(self.next_deposit.fetch_add(1, Ordering::Relaxed) + 1);
        let staged = StagedDeposit::new(
            id,
            intent.reference.clone(),
            owner,
            amount,
            currency.clone(),
        );
        self.staged.insert(intent.reference.clone(), Mutex::new(staged));
        self.deposit_refs.insert(id, intent.reference.clone());
        info!(owner = %owner, amount, payment_ref = %intent.reference, "deposit staged");
        Ok(DepositRequest {
            deposit_id: id,
            payment_ref: intent.reference,
            client_secret: intent.client_secret,
        })
    }

    /// Credits a settled deposit into the owner's available balance.
    ///
    /// At most one DEPOSIT journal exists per payment reference: the
    /// idempotency key is held across the post, so duplicate deliveries
    /// (sequential or concurrent) replay the original journal.
    pub fn deposit_succeeded(&self, payment_ref: &str) -> Result<Outcome, LedgerError> {
        let (owner, amount, currency) = {
            let staged = self
                .staged
                .get(payment_ref)
                .ok_or(LedgerError::UnknownPaymentReference)?;
            let staged = staged.lock();
            (staged.owner, staged.amount, staged.currency.clone())
        };

        let outcome = self.guard.run(
            IdempotencyKey::new(EntryRef::Deposit, payment_ref),
            || {
                let available =
                    self.store
                        .get_or_create(Some(owner), AccountKind::Available, &currency)?;
                let clearing = self
                    .store
                    .get_or_create(None, AccountKind::Clearing, &currency)?;
                self.journal.post(vec![
                    Leg::new(clearing, -amount, EntryRef::Deposit, payment_ref)
                        .with_external_ref(payment_ref),
                    Leg::new(available, amount, EntryRef::Deposit, payment_ref)
                        .with_external_ref(payment_ref),
                ])
            },
        )?;

        self.mark_deposit(payment_ref, DepositState::Succeeded)?;
        Ok(outcome)
    }

    /// Advances a staged deposit's state; stale events cannot downgrade
    /// an already-advanced record. Returns whether the record moved.
    pub fn mark_deposit(
        &self,
        payment_ref: &str,
        state: DepositState,
    ) -> Result<bool, LedgerError> {
        let staged = self
            .staged
            .get(payment_ref)
            .ok_or(LedgerError::UnknownPaymentReference)?;
        Ok(staged.lock().advance_to(state))
    }

    /// Snapshot of a staged deposit.
    pub fn staged_deposit(&self, payment_ref: &str) -> Option<StagedDeposit> {
        self.staged.get(payment_ref).map(|s| s.lock().clone())
    }

    // === Payout accounts ===

    /// Creates a connected payout account for the owner and returns the
    /// hosted onboarding link. Eligibility flags stay off until the
    /// processor confirms via `payout_account.updated`.
    pub fn register_payout_account(&self, owner: OwnerId) -> Result<String, LedgerError> {
        let account = self.processor.create_payout_account(owner)?;
        let link = self.processor.create_payout_onboarding_link(&account)?;
        self.payout_profiles.insert(
            owner,
            PayoutProfile {
                account,
                payouts_enabled: false,
                details_submitted: false,
            },
        );
        Ok(link)
    }

    /// Applies a `payout_account.updated` event. No ledger effect.
    pub fn update_payout_profile(
        &self,
        owner: OwnerId,
        payouts_enabled: bool,
        details_submitted: bool,
    ) {
        match self.payout_profiles.entry(owner) {
            Entry::Occupied(mut profile) => {
                let profile = profile.get_mut();
                profile.payouts_enabled = payouts_enabled;
                profile.details_submitted = details_submitted;
            }
            Entry::Vacant(_) => {
                // Event for an owner we never onboarded; acknowledge only.
                warn!(owner = %owner, "payout update for unregistered owner ignored");
            }
        }
    }

    pub fn payout_profile(&self, owner: OwnerId) -> Option<PayoutProfile> {
        self.payout_profiles.get(&owner).map(|p| p.clone())
    }

    // === Deals ===

    pub fn open_deal(
        &self,
        buyer: OwnerId,
        seller: OwnerId,
        amount: i64,
        currency: &Currency,
    ) -> Result<DealId, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if buyer == seller {
            return Err(LedgerError::Validation("buyer and seller must differ"));
        }
        let id = DealId(self.next_deal.fetch_add(1, Ordering::Relaxed) + 1);
        self.deals.insert(
            id,
            Arc::new(Deal::new(id, buyer, seller, amount, currency.clone())),
        );
        Ok(id)
    }

    pub fn deal(&self, id: DealId) -> Option<Arc<Deal>> {
        self.deals.get(&id).map(|d| Arc::clone(&d))
    }

    /// Moves the deal amount from the buyer's available balance into
    /// escrow and marks the deal in progress.
    pub fn fund_deal(&self, deal_id: DealId, actor: Actor) -> Result<JournalId, LedgerError> {
        let deal = self.deal(deal_id).ok_or(LedgerError::DealNotFound)?;
        if !actor.is_or_admin(deal.buyer()) {
            return Err(LedgerError::NotPermitted);
        }

        let mut state = deal.lock();
        if state.status != DealStatus::Open {
            return Err(LedgerError::DealNotOpen);
        }
        let available =
            self.store
                .get_or_create(Some(deal.buyer()), AccountKind::Available, deal.currency())?;
        let escrow =
            self.store
                .get_or_create(Some(deal.buyer()), AccountKind::Escrow, deal.currency())?;
        let journal_id = self.journal.post(vec![
            Leg::new(available, -deal.amount(), EntryRef::EscrowFund, deal_id.to_string()),
            Leg::new(escrow, deal.amount(), EntryRef::EscrowFund, deal_id.to_string()),
        ])?;
        state.status = DealStatus::InProgress;
        drop(state);

        self.record_audit(actor, "fund_deal", deal_id.to_string(), journal_id.to_string());
        info!(deal = %deal_id, journal = %journal_id, "deal funded into escrow");
        Ok(journal_id)
    }

    /// Completes a deal: splits the escrowed amount between the seller
    /// and the platform fee, marks the deal completed, then best-effort
    /// initiates the external payout.
    ///
    /// The payout happens strictly after the internal journal commits; a
    /// transfer failure is logged and queued for reconciliation, never
    /// rolled back.
    pub fn release(&self, deal_id: DealId, actor: Actor) -> Result<ReleaseOutcome, LedgerError> {
        let deal = self.deal(deal_id).ok_or(LedgerError::DealNotFound)?;
        if !actor.is_or_admin(deal.buyer()) {
            return Err(LedgerError::NotPermitted);
        }

        let mut state = deal.lock();
        if state.status != DealStatus::InProgress {
            return Err(LedgerError::DealNotInProgress);
        }
        let escrow = self
            .store
            .lookup(Some(deal.buyer()), AccountKind::Escrow, deal.currency())
            .ok_or(LedgerError::InsufficientEscrow)?;
        let escrow_balance = self
            .store
            .account(escrow)
            .map(|a| a.balance())
            .unwrap_or(0);
        if escrow_balance < deal.amount() {
            return Err(LedgerError::InsufficientEscrow);
        }

        // Widened multiply; the fee never exceeds the deal amount, so the
        // cast back cannot truncate.
        let fee = (deal.amount() as i128 * i128::from(self.config.fee_percent) / 100) as i64;
        let seller_amount = deal.amount() - fee;
        let seller_available =
            self.store
                .get_or_create(Some(deal.seller()), AccountKind::Available, deal.currency())?;

        // Zero-amount legs are not representable; at a 100% fee the
        // whole escrow goes to revenue and the seller leg is omitted.
        let mut legs = vec![Leg::new(
            escrow,
            -deal.amount(),
            EntryRef::Release,
            deal_id.to_string(),
        )];
        if seller_amount > 0 {
            legs.push(Leg::new(
                seller_available,
                seller_amount,
                EntryRef::Release,
                deal_id.to_string(),
            ));
        }
        if fee > 0 {
            let revenue =
                self.store
                    .get_or_create(None, AccountKind::PlatformRevenue, deal.currency())?;
            legs.push(Leg::new(revenue, fee, EntryRef::Fee, deal_id.to_string()));
        }
        let journal_id = self.journal.post(legs)?;
        state.status = DealStatus::Completed;
        state.settlement = Some(journal_id);
        drop(state);

        self.record_audit(actor, "release", deal_id.to_string(), journal_id.to_string());
        info!(deal = %deal_id, journal = %journal_id, seller_amount, fee, "escrow released");

        let transfer = self.initiate_payout(&deal, seller_amount);
        Ok(ReleaseOutcome {
            journal_id,
            seller_amount,
            fee,
            transfer,
        })
    }

    /// Best-effort external payout after a committed release. No ledger
    /// locks are held here.
    fn initiate_payout(&self, deal: &Deal, seller_amount: i64) -> Option<String> {
        let profile = self.payout_profile(deal.seller())?;
        if !profile.payouts_enabled {
            info!(seller = %deal.seller(), "payout destination not enabled; transfer skipped");
            return None;
        }
        match self
            .processor
            .create_transfer(&profile.account, seller_amount, deal.currency())
        {
            Ok(reference) => {
                info!(deal = %deal.id(), transfer = %reference, "payout transfer created");
                Some(reference)
            }
            Err(err) => {
                // Internal settlement stands; the transfer is retried by
                // the reconciliation sweep.
                warn!(deal = %deal.id(), error = %err, "payout transfer failed; queued for retry");
                self.pending_payouts.push(PendingPayout {
                    deal_id: deal.id(),
                    seller: deal.seller(),
                    destination: profile.account,
                    amount: seller_amount,
                    currency: deal.currency().clone(),
                });
                None
            }
        }
    }

    // === Disputes ===

    /// Contests an in-progress deal. Only the buyer or seller may open a
    /// dispute, and a deal carries at most one.
    pub fn open_dispute(&self, deal_id: DealId, actor: Actor) -> Result<DisputeId, LedgerError> {
        let deal = self.deal(deal_id).ok_or(LedgerError::DealNotFound)?;
        let opened_by = match actor {
            Actor::User(id) if id == deal.buyer() || id == deal.seller() => id,
            Actor::User(_) => return Err(LedgerError::NotPermitted),
            // Disputes are opened by a party, not by the platform.
            Actor::Admin => return Err(LedgerError::NotPermitted),
        };

        let mut state = deal.lock();
        if state.status != DealStatus::InProgress {
            return Err(LedgerError::DealNotInProgress);
        }
        let dispute_id = match self.dispute_by_deal.entry(deal_id) {
            Entry::Occupied(existing) => return Ok(*existing.get()),
            Entry::Vacant(slot) => {
                let id = DisputeId(self.next_dispute.fetch_add(1, Ordering::Relaxed) + 1);
                self.disputes
                    .insert(id, Arc::new(Dispute::new(id, deal_id, opened_by)));
                slot.insert(id);
                id
            }
        };
        state.status = DealStatus::Disputed;
        drop(state);

        self.record_audit(actor, "open_dispute", deal_id.to_string(), dispute_id.to_string());
        info!(deal = %deal_id, dispute = %dispute_id, "dispute opened");
        Ok(dispute_id)
    }

    pub fn dispute(&self, id: DisputeId) -> Option<Arc<Dispute>> {
        self.disputes.get(&id).map(|d| Arc::clone(&d))
    }

    /// The dispute opened against a deal, if any.
    pub fn dispute_for_deal(&self, deal_id: DealId) -> Option<DisputeId> {
        self.dispute_by_deal.get(&deal_id).map(|d| *d)
    }

    /// Arbitrates a dispute: pays the full escrowed amount to the
    /// winner's available account and resolves the dispute.
    ///
    /// The journal post, both status transitions, and the audit record
    /// commit while the dispute and deal locks are held, together or
    /// not at all. A second call is an idempotent no-op returning the
    /// prior outcome.
    pub fn resolve_dispute(
        &self,
        dispute_id: DisputeId,
        winner: DisputeWinner,
        actor: Actor,
    ) -> Result<DisputeOutcome, LedgerError> {
        if !actor.is_admin() {
            return Err(LedgerError::NotPermitted);
        }
        let dispute = self.dispute(dispute_id).ok_or(LedgerError::DisputeNotFound)?;

        let mut d = dispute.lock();
        if d.state == DisputeState::Resolved {
            return match (d.payout, d.winner) {
                (Some(journal_id), Some(winner)) => Ok(DisputeOutcome {
                    journal_id,
                    winner,
                    replayed: true,
                }),
                _ => Err(LedgerError::Validation("resolved dispute missing payout")),
            };
        }

        let deal = self.deal(dispute.deal_id()).ok_or(LedgerError::DealNotFound)?;
        // Lock order is dispute then deal, everywhere.
        let mut ds = deal.lock();
        if ds.status != DealStatus::Disputed {
            return Err(LedgerError::DealNotDisputed);
        }

        let escrow = self
            .store
            .lookup(Some(deal.buyer()), AccountKind::Escrow, deal.currency())
            .ok_or(LedgerError::InsufficientEscrow)?;
        let winner_owner = match winner {
            DisputeWinner::Buyer => deal.buyer(),
            DisputeWinner::Seller => deal.seller(),
        };
        let winner_available =
            self.store
                .get_or_create(Some(winner_owner), AccountKind::Available, deal.currency())?;

        // No fee on arbitration payouts; see DESIGN.md on the asymmetry
        // with release.
        let journal_id = self.journal.post(vec![
            Leg::new(escrow, -deal.amount(), EntryRef::DisputePayout, dispute_id.to_string()),
            Leg::new(
                winner_available,
                deal.amount(),
                EntryRef::DisputePayout,
                dispute_id.to_string(),
            ),
        ])?;

        ds.status = DealStatus::Resolved;
        ds.settlement = Some(journal_id);
        d.state = DisputeState::Resolved;
        d.winner = Some(winner);
        d.resolved_at = Some(Utc::now());
        d.payout = Some(journal_id);
        self.record_audit(
            actor,
            "resolve_dispute",
            dispute_id.to_string(),
            format!("winner={winner} journal={journal_id}"),
        );
        drop(ds);
        drop(d);

        info!(dispute = %dispute_id, journal = %journal_id, %winner, "dispute resolved");
        Ok(DisputeOutcome {
            journal_id,
            winner,
            replayed: false,
        })
    }

    // === Spend / Refund ===

    /// Debits the owner's available balance for a platform product; the
    /// counter-leg accrues to platform revenue.
    pub fn spend(
        &self,
        owner: OwnerId,
        amount: i64,
        currency: &Currency,
        ref_type: EntryRef,
        ref_id: &str,
    ) -> Result<JournalId, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let available = self
            .store
            .lookup(Some(owner), AccountKind::Available, currency)
            .ok_or(LedgerError::InsufficientBalance)?;
        let revenue = self
            .store
            .get_or_create(None, AccountKind::PlatformRevenue, currency)?;
        self.journal.post(vec![
            Leg::new(available, -amount, ref_type, ref_id),
            Leg::new(revenue, amount, ref_type, ref_id),
        ])
    }

    /// Refunds (part of) a settled deposit: verifies processor-side
    /// eligibility, creates the external refund, then mirrors it into
    /// the ledger tagged with the processor refund reference.
    ///
    /// `amount` defaults to the unrefunded remainder. Once the external
    /// refund has executed it is counted against the deposit even if the
    /// ledger mirror fails; the unmirrored refund is queued for a
    /// reconciliation retry and the error propagates.
    pub fn refund(
        &self,
        payment_ref: &str,
        amount: Option<i64>,
    ) -> Result<RefundOutcome, LedgerError> {
        let snapshot = self
            .staged_deposit(payment_ref)
            .ok_or(LedgerError::UnknownPaymentReference)?;
        if snapshot.state != DepositState::Succeeded {
            return Err(LedgerError::NotRefundEligible);
        }
        let remaining = snapshot.amount - snapshot.refunded;
        let amount = amount.unwrap_or(remaining);
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if amount > remaining {
            return Err(LedgerError::NotRefundEligible);
        }

        // Processor-side eligibility, before any mutation.
        let intent = self.processor.retrieve_payment_intent(payment_ref)?;
        if intent.status != IntentStatus::Succeeded {
            return Err(LedgerError::NotRefundEligible);
        }
        // The owner must still hold the funds being returned.
        if self.available_balance(snapshot.owner, &snapshot.currency) < amount {
            return Err(LedgerError::InsufficientBalance);
        }

        let refund_ref = self.processor.create_refund(payment_ref, amount)?;
        // Processor-side truth has moved; count the refund against the
        // deposit now, whether or not the mirror below commits.
        if let Some(staged) = self.staged.get(payment_ref) {
            let mut staged = staged.lock();
            staged.refunded += amount;
            staged.updated_at = Utc::now();
        }

        let outcome = match self.mirror_refund(
            payment_ref,
            &refund_ref,
            snapshot.owner,
            amount,
            &snapshot.currency,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                // A concurrent debit may have drained the balance between
                // the eligibility check and the post. The executed refund
                // must not vanish; queue it for the reconciliation sweep.
                warn!(
                    payment_ref,
                    refund = %refund_ref,
                    error = %err,
                    "executed refund not mirrored; queued for retry"
                );
                self.pending_refunds.push(PendingRefund {
                    payment_ref: payment_ref.to_string(),
                    refund_ref,
                    owner: snapshot.owner,
                    amount,
                    currency: snapshot.currency.clone(),
                });
                return Err(err);
            }
        };

        info!(payment_ref, refund = %refund_ref, amount, "refund mirrored into ledger");
        Ok(RefundOutcome {
            journal_id: outcome.journal_id(),
            refund_ref,
            amount,
        })
    }

    /// Posts the internal counterpart of an executed processor refund.
    /// Keyed by the refund reference, so a retry can never double-post.
    fn mirror_refund(
        &self,
        payment_ref: &str,
        refund_ref: &str,
        owner: OwnerId,
        amount: i64,
        currency: &Currency,
    ) -> Result<Outcome, LedgerError> {
        self.guard.run(
            IdempotencyKey::new(EntryRef::Refund, refund_ref),
            || {
                let available = self
                    .store
                    .lookup(Some(owner), AccountKind::Available, currency)
                    .ok_or(LedgerError::AccountNotFound)?;
                let clearing = self
                    .store
                    .get_or_create(None, AccountKind::Clearing, currency)?;
                self.journal.post(vec![
                    Leg::new(available, -amount, EntryRef::Refund, payment_ref)
                        .with_external_ref(refund_ref),
                    Leg::new(clearing, amount, EntryRef::Refund, payment_ref)
                        .with_external_ref(refund_ref),
                ])
            },
        )
    }

    // === Reconciliation & audit ===

    /// Sweeps every committed journal and account and reports invariant
    /// violations: journals that do not sum to zero, balances diverging
    /// from their entry sums, negative available/escrow balances.
    pub fn reconcile(&self) -> ReconciliationReport {
        let mut issues = Vec::new();

        let journals = self.store.journals();
        for (id, entries) in &journals {
            let sum: i128 = entries.iter().map(|e| e.amount as i128).sum();
            if sum != 0 {
                issues.push(format!("journal {id} sums to {sum}"));
            }
        }

        let accounts = self.store.accounts();
        for account in &accounts {
            let data = account.lock();
            if data.balance != data.entries_total() {
                issues.push(format!(
                    "account {} balance {} diverges from entry sum {}",
                    account.id(),
                    data.balance,
                    data.entries_total()
                ));
            }
            if data.balance < 0 && !account.kind().allows_negative() {
                issues.push(format!(
                    "account {} ({}) is negative: {}",
                    account.id(),
                    account.kind(),
                    data.balance
                ));
            }
        }

        ReconciliationReport {
            journals_checked: journals.len(),
            accounts_checked: accounts.len(),
            issues,
            pending_payouts: self.pending_payouts.len(),
            pending_refunds: self.pending_refunds.len(),
        }
    }

    /// Retries queued payout transfers. Returns how many settled; the
    /// rest are requeued.
    pub fn retry_payouts(&self) -> usize {
        let mut settled = 0;
        let mut requeue = Vec::new();
        while let Some(payout) = self.pending_payouts.pop() {
            match self.processor.create_transfer(
                &payout.destination,
                payout.amount,
                &payout.currency,
            ) {
                Ok(reference) => {
                    info!(deal = %payout.deal_id, transfer = %reference, "queued payout settled");
                    settled += 1;
                }
                Err(err) => {
                    warn!(deal = %payout.deal_id, error = %err, "queued payout still failing");
                    requeue.push(payout);
                }
            }
        }
        for payout in requeue {
            self.pending_payouts.push(payout);
        }
        settled
    }

    pub fn pending_payout_count(&self) -> usize {
        self.pending_payouts.len()
    }

    /// Retries ledger mirrors for executed refunds. Returns how many
    /// committed; the rest are requeued.
    pub fn retry_refunds(&self) -> usize {
        let mut settled = 0;
        let mut requeue = Vec::new();
        while let Some(refund) = self.pending_refunds.pop() {
            match self.mirror_refund(
                &refund.payment_ref,
                &refund.refund_ref,
                refund.owner,
                refund.amount,
                &refund.currency,
            ) {
                Ok(_) => {
                    info!(
                        payment_ref = %refund.payment_ref,
                        refund = %refund.refund_ref,
                        "queued refund mirrored into ledger"
                    );
                    settled += 1;
                }
                Err(err) => {
                    warn!(
                        payment_ref = %refund.payment_ref,
                        error = %err,
                        "queued refund still not mirrorable"
                    );
                    requeue.push(refund);
                }
            }
        }
        for refund in requeue {
            self.pending_refunds.push(refund);
        }
        settled
    }

    pub fn pending_refund_count(&self) -> usize {
        self.pending_refunds.len()
    }

    /// Snapshot of the administrative audit log, in append order.
    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.audit.lock().clone()
    }

    fn record_audit(&self, actor: Actor, action: &'static str, target: String, outcome: String) {
        self.audit.lock().push(AuditRecord {
            actor,
            action,
            target,
            outcome,
            at: Utc::now(),
        });
    }
}
