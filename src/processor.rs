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

//! External payment-processor capability.
//!
//! The processor is consumed through a narrow trait: create/retrieve
//! payment intents, transfers, refunds, payout accounts. The engine
//! never calls it while holding ledger locks: intents are created
//! before the atomic apply, payouts strictly after it. Transfer and
//! payout failures are non-fatal to internal state.

use crate::base::{Currency, OwnerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

/// Errors from the external processor. Retryable network failure and
/// permanent rejection are the only distinction the engine cares about.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("processor unavailable: {0}")]
    Unavailable(String),

    #[error("processor rejected request: {0}")]
    Rejected(String),
}

/// Processor-side view of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Processor payment reference (`pi_...`).
    pub reference: String,
    /// Secret handed to the paying client to complete the charge.
    pub client_secret: String,
    pub amount: i64,
    pub currency: Currency,
    pub status: IntentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

/// Outbound capability set consumed from the external processor.
pub trait PaymentProcessor: Send + Sync {
    fn create_payment_intent(
        &self,
        owner: OwnerId,
        amount: i64,
        currency: &Currency,
    ) -> Result<PaymentIntent, ProcessorError>;

    fn retrieve_payment_intent(&self, reference: &str) -> Result<PaymentIntent, ProcessorError>;

    /// Transfers settled funds to a connected payout destination.
    /// Returns the processor transfer reference.
    fn create_transfer(
        &self,
        destination: &str,
        amount: i64,
        currency: &Currency,
    ) -> Result<String, ProcessorError>;

    /// Refunds (part of) a charge. Returns the processor refund reference.
    fn create_refund(&self, payment_reference: &str, amount: i64)
    -> Result<String, ProcessorError>;

    /// Creates a connected payout account for an owner. Returns the
    /// processor account reference.
    fn create_payout_account(&self, owner: OwnerId) -> Result<String, ProcessorError>;

    /// Returns a hosted onboarding link for a payout account.
    fn create_payout_onboarding_link(
        &self,
        payout_account: &str,
    ) -> Result<String, ProcessorError>;
}

/// A recorded outbound transfer, for assertions in tests and demos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransfer {
    pub reference: String,
    pub destination: String,
    pub amount: i64,
    pub currency: Currency,
}

/// In-memory processor double with scriptable failures.
///
/// Used by the CLI, the demos, and the test suites; mirrors the small
/// slice of processor behavior the engine depends on (intent lifecycle,
/// refund ceilings, transfer references).
#[derive(Debug, Default)]
pub struct MockProcessor {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    transfers: Mutex<Vec<RecordedTransfer>>,
    refunded: Mutex<HashMap<String, i64>>,
    next_ref: AtomicU64,
    fail_transfers: AtomicBool,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, prefix: &str) -> String {
        let n = self.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}_{n}")
    }

    /// Makes subsequent `create_transfer` calls fail, simulating a
    /// processor outage during payout.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::Relaxed);
    }

    /// Marks an intent as succeeded, as the processor would after the
    /// charge clears. Tests pair this with a deposit-succeeded event.
    pub fn settle_intent(&self, reference: &str) {
        if let Some(intent) = self.intents.lock().get_mut(reference) {
            intent.status = IntentStatus::Succeeded;
        }
    }

    /// Transfers recorded so far.
    pub fn transfers(&self) -> Vec<RecordedTransfer> {
        self.transfers.lock().clone()
    }
}

impl PaymentProcessor for MockProcessor {
    fn create_payment_intent(
        &self,
        _owner: OwnerId,
        amount: i64,
        currency: &Currency,
    ) -> Result<PaymentIntent, ProcessorError> {
        if amount <= 0 {
            return Err(ProcessorError::Rejected("amount must be positive".into()));
        }
        let reference = self.next("pi");
        let intent = PaymentIntent {
            client_secret: format!("{reference}_secret"),
            reference: reference.clone(),
            amount,
            currency: currency.clone(),
            status: IntentStatus::Pending,
        };
        self.intents.lock().insert(reference, intent.clone());
        Ok(intent)
    }

    fn retrieve_payment_intent(&self, reference: &str) -> Result<PaymentIntent, ProcessorError> {
        self.intents
            .lock()
            .get(reference)
            .cloned()
            .ok_or_else(|| ProcessorError::Rejected(format!("no such payment intent: {reference}")))
    }

    fn create_transfer(
        &self,
        destination: &str,
        amount: i64,
        currency: &Currency,
    ) -> Result<String, ProcessorError> {
        if self.fail_transfers.load(Ordering::Relaxed) {
            return Err(ProcessorError::Unavailable("transfer endpoint down".into()));
        }
        let reference = self.next("tr");
        self.transfers.lock().push(RecordedTransfer {
            reference: reference.clone(),
            destination: destination.to_string(),
            amount,
            currency: currency.clone(),
        });
        Ok(reference)
    }

    fn create_refund(
        &self,
        payment_reference: &str,
        amount: i64,
    ) -> Result<String, ProcessorError> {
        let intents = self.intents.lock();
        let intent = intents.get(payment_reference).ok_or_else(|| {
            ProcessorError::Rejected(format!("no such payment intent: {payment_reference}"))
        })?;
        if intent.status != IntentStatus::Succeeded {
            return Err(ProcessorError::Rejected("charge has not settled".into()));
        }
        let mut refunded = self.refunded.lock();
        let prior = refunded.get(payment_reference).copied().unwrap_or(0);
        if amount <= 0 || prior + amount > intent.amount {
            return Err(ProcessorError::Rejected("refund exceeds charge".into()));
        }
        refunded.insert(payment_reference.to_string(), prior + amount);
        Ok(self.next("re"))
    }

    fn create_payout_account(&self, owner: OwnerId) -> Result<String, ProcessorError> {
        Ok(format!("acct_{owner}"))
    }

    fn create_payout_onboarding_link(
        &self,
        payout_account: &str,
    ) -> Result<String, ProcessorError> {
        Ok(format!("https://processor.invalid/onboard/{payout_account}"))
    }
}
