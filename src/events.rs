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

//! Payment-processor webhook ingestion.
//!
//! Delivery is at-least-once and may be out of order, so every handler
//! is safe to invoke repeatedly and a stale event can never downgrade a
//! staged deposit past its current state. The event id is a dedupe key
//! distinct from the ledger-level idempotency key: the former swallows
//! redelivery of one event, the latter pins one DEPOSIT journal per
//! payment reference even across distinct event ids.

use crate::base::{Currency, DepositId, OwnerId};
use crate::engine::LedgerEngine;
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 verifier for inbound webhook payloads.
///
/// Signatures are hex-encoded over the raw request body. Verification is
/// constant-time; any failure rejects the event outright.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    /// Signs a payload the way the processor would. Used by tests and
    /// the demo sender.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// # Errors
    ///
    /// [`LedgerError::InvalidSignature`] on any mismatch, malformed hex
    /// included.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<(), LedgerError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| LedgerError::InvalidSignature)?;
        mac.update(payload);
        let expected = hex::decode(signature).map_err(|_| LedgerError::InvalidSignature)?;
        mac.verify_slice(&expected)
            .map_err(|_| LedgerError::InvalidSignature)
    }
}

/// Inbound processor event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorEvent {
    /// Processor event id; pure dedupe key.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DepositEventPayload {
    payment_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PayoutAccountPayload {
    owner: OwnerId,
    payouts_enabled: bool,
    details_submitted: bool,
}

/// Staged-deposit lifecycle. Ranked so out-of-order delivery can only
/// move a record forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositState {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl DepositState {
    fn rank(self) -> u8 {
        match self {
            DepositState::Pending => 0,
            DepositState::Processing => 1,
            // A charge reported failed or canceled can still settle on a
            // later retry; settlement itself is final.
            DepositState::Failed | DepositState::Canceled => 2,
            DepositState::Succeeded => 3,
        }
    }
}

/// Local record of a requested deposit, keyed by the processor payment
/// reference, tracking settlement state and refunded total.
#[derive(Debug, Clone)]
pub struct StagedDeposit {
    pub id: DepositId,
    pub payment_ref: String,
    pub owner: OwnerId,
    pub amount: i64,
    pub currency: Currency,
    pub state: DepositState,
    pub refunded: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagedDeposit {
    pub(crate) fn new(
        id: DepositId,
        payment_ref: String,
        owner: OwnerId,
        amount: i64,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            payment_ref,
            owner,
            amount,
            currency,
            state: DepositState::Pending,
            refunded: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advances to `next` if it is strictly ahead of the current state.
    /// Returns whether the record moved.
    pub(crate) fn advance_to(&mut self, next: DepositState) -> bool {
        if next.rank() > self.state.rank() {
            self.state = next;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }
}

/// What the ingester did with a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Handled; any ledger effect was applied (or replayed).
    Processed,
    /// Event id already seen; nothing done.
    Duplicate,
    /// Unrecognized kind; acknowledged and logged, never retried.
    Ignored,
}

/// Verifies and dispatches processor events into ledger commands.
pub struct PaymentEventIngester {
    engine: Arc<LedgerEngine>,
    verifier: WebhookVerifier,
    /// Processed-event table keyed by processor event id.
    processed: DashMap<String, DateTime<Utc>>,
}

impl PaymentEventIngester {
    pub fn new(engine: Arc<LedgerEngine>, webhook_secret: &str) -> Self {
        Self {
            engine,
            verifier: WebhookVerifier::new(webhook_secret),
            processed: DashMap::new(),
        }
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Verifies the raw payload's signature, then dispatches the event.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidSignature`] before anything else; no
    /// partially trusted events. Handler errors propagate and leave the
    /// event unrecorded, so the processor's retry can succeed later.
    pub fn ingest(&self, payload: &[u8], signature: &str) -> Result<IngestOutcome, LedgerError> {
        self.verifier.verify(payload, signature)?;
        let event: ProcessorEvent = serde_json::from_slice(payload)
            .map_err(|_| LedgerError::Validation("malformed event payload"))?;
        self.ingest_verified(event)
    }

    /// Dispatches an already-verified event with event-id dedupe.
    ///
    /// The entry for the event id is held while the handler runs, so a
    /// concurrent redelivery blocks and then reports [`IngestOutcome::Duplicate`].
    pub fn ingest_verified(&self, event: ProcessorEvent) -> Result<IngestOutcome, LedgerError> {
        match self.processed.entry(event.id.clone()) {
            Entry::Occupied(_) => Ok(IngestOutcome::Duplicate),
            Entry::Vacant(slot) => {
                let outcome = self.dispatch(&event)?;
                slot.insert(Utc::now());
                Ok(outcome)
            }
        }
    }

    fn dispatch(&self, event: &ProcessorEvent) -> Result<IngestOutcome, LedgerError> {
        match event.kind.as_str() {
            "deposit.succeeded" => {
                let payload = self.deposit_payload(event)?;
                let outcome = self.engine.deposit_succeeded(&payload.payment_reference)?;
                info!(
                    event = %event.id,
                    payment_ref = %payload.payment_reference,
                    replayed = outcome.is_replay(),
                    "deposit settled"
                );
                Ok(IngestOutcome::Processed)
            }
            "deposit.processing" => {
                let payload = self.deposit_payload(event)?;
                self.engine
                    .mark_deposit(&payload.payment_reference, DepositState::Processing)?;
                Ok(IngestOutcome::Processed)
            }
            "deposit.failed" => {
                let payload = self.deposit_payload(event)?;
                self.engine
                    .mark_deposit(&payload.payment_reference, DepositState::Failed)?;
                Ok(IngestOutcome::Processed)
            }
            "deposit.canceled" => {
                let payload = self.deposit_payload(event)?;
                self.engine
                    .mark_deposit(&payload.payment_reference, DepositState::Canceled)?;
                Ok(IngestOutcome::Processed)
            }
            "payout_account.updated" => {
                let payload: PayoutAccountPayload = serde_json::from_value(event.payload.clone())
                    .map_err(|_| LedgerError::Validation("malformed event payload"))?;
                self.engine.update_payout_profile(
                    payload.owner,
                    payload.payouts_enabled,
                    payload.details_submitted,
                );
                Ok(IngestOutcome::Processed)
            }
            other => {
                warn!(event = %event.id, kind = other, "unrecognized event kind acknowledged");
                Ok(IngestOutcome::Ignored)
            }
        }
    }

    fn deposit_payload(&self, event: &ProcessorEvent) -> Result<DepositEventPayload, LedgerError> {
        serde_json::from_value(event.payload.clone())
            .map_err(|_| LedgerError::Validation("malformed event payload"))
    }
}
