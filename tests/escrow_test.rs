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

//! Deal lifecycle integration tests: escrow funding, fee-split release,
//! dispute arbitration, and best-effort payout transfers.

use escrow_ledger::{
    Actor, Currency, DealStatus, DisputeState, DisputeWinner, EngineConfig, LedgerEngine,
    LedgerError, MockProcessor, OwnerId,
};
use std::sync::Arc;

const BUYER: OwnerId = OwnerId(1);
const SELLER: OwnerId = OwnerId(2);

fn usd() -> Currency {
    Currency::new("usd")
}

fn setup() -> (Arc<MockProcessor>, LedgerEngine) {
    let processor = Arc::new(MockProcessor::new());
    let engine = LedgerEngine::new(EngineConfig::default(), processor.clone());
    (processor, engine)
}

/// Engine with the buyer holding `amount` available.
fn setup_funded_buyer(amount: i64) -> (Arc<MockProcessor>, LedgerEngine) {
    let (processor, engine) = setup();
    let request = engine.deposit_request(BUYER, amount, &usd()).unwrap();
    processor.settle_intent(&request.payment_ref);
    engine.deposit_succeeded(&request.payment_ref).unwrap();
    (processor, engine)
}

#[test]
fn fund_moves_buyer_funds_into_escrow() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();

    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    assert_eq!(engine.available_balance(BUYER, &usd()), 0);
    assert_eq!(engine.escrow_balance(BUYER, &usd()), 10_000);
    assert_eq!(engine.deal(deal).unwrap().status(), DealStatus::InProgress);
}

#[test]
fn fund_requires_buyer_funds() {
    let (_, engine) = setup_funded_buyer(5_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();

    let err = engine.fund_deal(deal, Actor::User(BUYER)).unwrap_err();
    assert_eq!(err, LedgerError::InsufficientBalance);
    // Failed funding leaves the deal open for a retry after a deposit.
    assert_eq!(engine.deal(deal).unwrap().status(), DealStatus::Open);
}

#[test]
fn fund_rejects_non_buyer() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();

    let err = engine.fund_deal(deal, Actor::User(SELLER)).unwrap_err();
    assert_eq!(err, LedgerError::NotPermitted);
}

#[test]
fn fund_twice_fails() {
    let (_, engine) = setup_funded_buyer(20_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    let err = engine.fund_deal(deal, Actor::User(BUYER)).unwrap_err();
    assert_eq!(err, LedgerError::DealNotOpen);
    assert_eq!(engine.escrow_balance(BUYER, &usd()), 10_000);
}

#[test]
fn release_splits_fee_to_platform() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    let outcome = engine.release(deal, Actor::User(BUYER)).unwrap();
    assert_eq!(outcome.seller_amount, 9_000);
    assert_eq!(outcome.fee, 1_000);

    assert_eq!(engine.escrow_balance(BUYER, &usd()), 0);
    assert_eq!(engine.available_balance(SELLER, &usd()), 9_000);
    assert_eq!(engine.platform_revenue_balance(&usd()), 1_000);
    assert_eq!(engine.deal(deal).unwrap().status(), DealStatus::Completed);
    assert_eq!(
        engine.deal(deal).unwrap().settlement(),
        Some(outcome.journal_id)
    );
    assert!(engine.reconcile().is_clean());
}

#[test]
fn release_fee_floors() {
    // floor(999 * 10%) = 99, seller gets 900
    let (_, engine) = setup_funded_buyer(999);
    let deal = engine.open_deal(BUYER, SELLER, 999, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    let outcome = engine.release(deal, Actor::User(BUYER)).unwrap();
    assert_eq!(outcome.fee, 99);
    assert_eq!(outcome.seller_amount, 900);
    assert_eq!(engine.platform_revenue_balance(&usd()), 99);
}

#[test]
fn release_handles_amounts_near_the_i64_ceiling() {
    // The fee multiply must not overflow before the division.
    let amount = i64::MAX;
    let (_, engine) = setup_funded_buyer(amount);
    let deal = engine.open_deal(BUYER, SELLER, amount, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    let outcome = engine.release(deal, Actor::User(BUYER)).unwrap();
    assert_eq!(outcome.fee, amount / 10);
    assert_eq!(outcome.seller_amount, amount - amount / 10);
    assert_eq!(engine.available_balance(SELLER, &usd()), outcome.seller_amount);
    assert!(engine.reconcile().is_clean());
}

#[test]
fn release_with_zero_fee_has_no_fee_leg() {
    let processor = Arc::new(MockProcessor::new());
    let config = EngineConfig {
        fee_percent: 0,
        ..EngineConfig::default()
    };
    let engine = LedgerEngine::new(config, processor.clone());
    let request = engine.deposit_request(BUYER, 1_000, &usd()).unwrap();
    processor.settle_intent(&request.payment_ref);
    engine.deposit_succeeded(&request.payment_ref).unwrap();

    let deal = engine.open_deal(BUYER, SELLER, 1_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    let outcome = engine.release(deal, Actor::User(BUYER)).unwrap();

    assert_eq!(outcome.fee, 0);
    assert_eq!(engine.available_balance(SELLER, &usd()), 1_000);
    let entries = engine.store().journal(outcome.journal_id).unwrap();
    assert_eq!(entries.len(), 2);
}

#[test]
fn release_twice_leaves_no_second_journal() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    engine.release(deal, Actor::User(BUYER)).unwrap();
    let journals_before = engine.store().journal_count();

    let err = engine.release(deal, Actor::User(BUYER)).unwrap_err();
    assert_eq!(err, LedgerError::DealNotInProgress);
    assert_eq!(engine.store().journal_count(), journals_before);
    assert_eq!(engine.available_balance(SELLER, &usd()), 9_000);
}

#[test]
fn release_of_unfunded_deal_fails() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();

    let err = engine.release(deal, Actor::User(BUYER)).unwrap_err();
    assert_eq!(err, LedgerError::DealNotInProgress);
}

#[test]
fn release_rejects_seller() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    let err = engine.release(deal, Actor::User(SELLER)).unwrap_err();
    assert_eq!(err, LedgerError::NotPermitted);
}

#[test]
fn admin_can_release() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    engine.release(deal, Actor::Admin).unwrap();
    assert_eq!(engine.available_balance(SELLER, &usd()), 9_000);
}

#[test]
fn release_initiates_payout_when_enabled() {
    let (processor, engine) = setup_funded_buyer(10_000);
    engine.register_payout_account(SELLER).unwrap();
    engine.update_payout_profile(SELLER, true, true);

    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    let outcome = engine.release(deal, Actor::User(BUYER)).unwrap();

    assert!(outcome.transfer.is_some());
    let transfers = processor.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].destination, "acct_2");
    // Transferred amount is net of the fee.
    assert_eq!(transfers[0].amount, 9_000);
}

#[test]
fn release_skips_payout_without_destination() {
    let (processor, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    let outcome = engine.release(deal, Actor::User(BUYER)).unwrap();
    assert_eq!(outcome.transfer, None);
    assert!(processor.transfers().is_empty());
    // The internal settlement still stands.
    assert_eq!(engine.available_balance(SELLER, &usd()), 9_000);
}

#[test]
fn failed_payout_keeps_settlement_and_queues_retry() {
    let (processor, engine) = setup_funded_buyer(10_000);
    engine.register_payout_account(SELLER).unwrap();
    engine.update_payout_profile(SELLER, true, true);
    processor.set_fail_transfers(true);

    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    let outcome = engine.release(deal, Actor::User(BUYER)).unwrap();

    // The journal committed even though the transfer failed.
    assert_eq!(outcome.transfer, None);
    assert_eq!(engine.available_balance(SELLER, &usd()), 9_000);
    assert_eq!(engine.deal(deal).unwrap().status(), DealStatus::Completed);
    assert_eq!(engine.pending_payout_count(), 1);
    assert_eq!(engine.reconcile().pending_payouts, 1);

    // Outage over; the retry settles the queued transfer without
    // touching the ledger again.
    processor.set_fail_transfers(false);
    let journals_before = engine.store().journal_count();
    assert_eq!(engine.retry_payouts(), 1);
    assert_eq!(engine.pending_payout_count(), 0);
    assert_eq!(engine.store().journal_count(), journals_before);
    assert_eq!(processor.transfers().len(), 1);
}

#[test]
fn retry_requeues_while_outage_lasts() {
    let (processor, engine) = setup_funded_buyer(10_000);
    engine.register_payout_account(SELLER).unwrap();
    engine.update_payout_profile(SELLER, true, true);
    processor.set_fail_transfers(true);

    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    engine.release(deal, Actor::User(BUYER)).unwrap();

    assert_eq!(engine.retry_payouts(), 0);
    assert_eq!(engine.pending_payout_count(), 1);
}

#[test]
fn dispute_blocks_release() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    engine.open_dispute(deal, Actor::User(SELLER)).unwrap();

    let err = engine.release(deal, Actor::User(BUYER)).unwrap_err();
    assert_eq!(err, LedgerError::DealNotInProgress);
    assert_eq!(engine.escrow_balance(BUYER, &usd()), 10_000);
}

#[test]
fn dispute_rejects_third_parties() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    let err = engine.open_dispute(deal, Actor::User(OwnerId(9))).unwrap_err();
    assert_eq!(err, LedgerError::NotPermitted);
    let err = engine.open_dispute(deal, Actor::Admin).unwrap_err();
    assert_eq!(err, LedgerError::NotPermitted);
}

#[test]
fn dispute_requires_in_progress_deal() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();

    let err = engine.open_dispute(deal, Actor::User(BUYER)).unwrap_err();
    assert_eq!(err, LedgerError::DealNotInProgress);
}

#[test]
fn second_dispute_returns_the_first() {
    let (_, engine) = setup_funded_buyer(10_000);
    let deal = engine.open_deal(BUYER, SELLER, 10_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();

    let first = engine.open_dispute(deal, Actor::User(BUYER)).unwrap();
    // The deal is now Disputed, so a second open is rejected up front;
    // the dispute registry still maps the deal to the first dispute.
    assert_eq!(
        engine.open_dispute(deal, Actor::User(SELLER)).unwrap_err(),
        LedgerError::DealNotInProgress
    );
    assert_eq!(engine.dispute_for_deal(deal), Some(first));
}

#[test]
fn resolve_pays_winner_in_full() {
    let (_, engine) = setup_funded_buyer(5_000);
    let deal = engine.open_deal(BUYER, SELLER, 5_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    let dispute = engine.open_dispute(deal, Actor::User(BUYER)).unwrap();

    let outcome = engine
        .resolve_dispute(dispute, DisputeWinner::Buyer, Actor::Admin)
        .unwrap();
    assert!(!outcome.replayed);

    // No fee on arbitration; the buyer gets the full escrowed amount back.
    assert_eq!(engine.available_balance(BUYER, &usd()), 5_000);
    assert_eq!(engine.escrow_balance(BUYER, &usd()), 0);
    assert_eq!(engine.platform_revenue_balance(&usd()), 0);
    assert_eq!(engine.deal(deal).unwrap().status(), DealStatus::Resolved);
    assert_eq!(
        engine.dispute(dispute).unwrap().state(),
        DisputeState::Resolved
    );
    assert!(engine.reconcile().is_clean());
}

#[test]
fn resolve_for_seller_pays_gross_amount() {
    let (_, engine) = setup_funded_buyer(5_000);
    let deal = engine.open_deal(BUYER, SELLER, 5_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    let dispute = engine.open_dispute(deal, Actor::User(SELLER)).unwrap();

    engine
        .resolve_dispute(dispute, DisputeWinner::Seller, Actor::Admin)
        .unwrap();
    assert_eq!(engine.available_balance(SELLER, &usd()), 5_000);
}

#[test]
fn resolve_requires_admin() {
    let (_, engine) = setup_funded_buyer(5_000);
    let deal = engine.open_deal(BUYER, SELLER, 5_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    let dispute = engine.open_dispute(deal, Actor::User(BUYER)).unwrap();

    let err = engine
        .resolve_dispute(dispute, DisputeWinner::Buyer, Actor::User(BUYER))
        .unwrap_err();
    assert_eq!(err, LedgerError::NotPermitted);
}

#[test]
fn resolve_twice_replays_prior_outcome() {
    let (_, engine) = setup_funded_buyer(5_000);
    let deal = engine.open_deal(BUYER, SELLER, 5_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    let dispute = engine.open_dispute(deal, Actor::User(BUYER)).unwrap();

    let first = engine
        .resolve_dispute(dispute, DisputeWinner::Buyer, Actor::Admin)
        .unwrap();
    // A second resolution is a no-op, even naming the other winner.
    let second = engine
        .resolve_dispute(dispute, DisputeWinner::Seller, Actor::Admin)
        .unwrap();

    assert!(second.replayed);
    assert_eq!(second.journal_id, first.journal_id);
    assert_eq!(second.winner, DisputeWinner::Buyer);
    assert_eq!(engine.available_balance(BUYER, &usd()), 5_000);
    assert_eq!(engine.available_balance(SELLER, &usd()), 0);
}

#[test]
fn workflow_actions_are_audited() {
    let (_, engine) = setup_funded_buyer(5_000);
    let deal = engine.open_deal(BUYER, SELLER, 5_000, &usd()).unwrap();
    engine.fund_deal(deal, Actor::User(BUYER)).unwrap();
    let dispute = engine.open_dispute(deal, Actor::User(BUYER)).unwrap();
    engine
        .resolve_dispute(dispute, DisputeWinner::Buyer, Actor::Admin)
        .unwrap();

    let log = engine.audit_log();
    let actions: Vec<&str> = log.iter().map(|r| r.action).collect();
    assert_eq!(actions, vec!["fund_deal", "open_dispute", "resolve_dispute"]);
    assert_eq!(log[0].actor, Actor::User(BUYER));
    assert_eq!(log[2].actor, Actor::Admin);
    assert!(log[2].outcome.contains("winner=buyer"));
}
