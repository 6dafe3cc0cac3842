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

//! Double-entry ledger and escrow engine for a marketplace platform.
//!
//! Every movement of value is a balanced journal over per-owner
//! accounts (available, escrow) and ownerless platform accounts
//! (platform revenue, processor clearing); amounts are signed integer
//! minor units and each journal's legs sum to zero. On top of the
//! ledger sit the marketplace workflows: deposits staged against an
//! external payment processor and settled by signed webhook events,
//! escrow-held deals released with a platform fee split, dispute
//! arbitration paying the full escrow to the winner, spends on platform
//! products, and processor-mirrored refunds.
//!
//! Settlement events arrive at-least-once and out of order, so every
//! ingestion path is idempotent: event ids are deduped, and each
//! external reference maps to at most one journal.
//!
//! ```
//! use escrow_ledger::{Actor, Currency, EngineConfig, LedgerEngine, MockProcessor, OwnerId};
//! use std::sync::Arc;
//!
//! let processor = Arc::new(MockProcessor::new());
//! let engine = LedgerEngine::new(EngineConfig::default(), processor.clone());
//! let usd = Currency::new("usd");
//! let (buyer, seller) = (OwnerId(1), OwnerId(2));
//!
//! // Stage a deposit, settle it as the processor would.
//! let request = engine.deposit_request(buyer, 10_000, &usd).unwrap();
//! processor.settle_intent(&request.payment_ref);
//! engine.deposit_succeeded(&request.payment_ref).unwrap();
//! assert_eq!(engine.available_balance(buyer, &usd), 10_000);
//!
//! // Escrow a deal and release it; a 10% fee accrues to the platform.
//! let deal = engine.open_deal(buyer, seller, 10_000, &usd).unwrap();
//! engine.fund_deal(deal, Actor::User(buyer)).unwrap();
//! let outcome = engine.release(deal, Actor::User(buyer)).unwrap();
//! assert_eq!(outcome.seller_amount, 9_000);
//! assert_eq!(engine.platform_revenue_balance(&usd), 1_000);
//! ```

mod account;
mod base;
mod deal;
mod engine;
mod entry;
mod error;
mod events;
mod idempotency;
mod journal;
mod processor;
mod store;

pub use account::{AccountKind, LedgerAccount};
pub use base::{
    AccountId, Actor, Currency, DealId, DepositId, DisputeId, EntryId, JournalId, OwnerId,
};
pub use deal::{Deal, DealStatus, Dispute, DisputeState, DisputeWinner};
pub use engine::{
    AuditRecord, DepositRequest, DisputeOutcome, EngineConfig, LedgerEngine, PayoutProfile,
    PendingPayout, PendingRefund, ReconciliationReport, RefundOutcome, ReleaseOutcome,
};
pub use entry::{EntryRef, LedgerEntry, Leg};
pub use error::LedgerError;
pub use events::{
    DepositState, IngestOutcome, PaymentEventIngester, ProcessorEvent, StagedDeposit,
    WebhookVerifier,
};
pub use idempotency::{IdempotencyGuard, IdempotencyKey, Outcome};
pub use journal::JournalEngine;
pub use processor::{
    IntentStatus, MockProcessor, PaymentIntent, PaymentProcessor, ProcessorError,
    RecordedTransfer,
};
pub use store::LedgerStore;
