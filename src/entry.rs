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

//! Ledger entries and journal legs.
//!
//! A [`Leg`] is a proposed movement against one account; a balanced set of
//! legs becomes a journal. Once committed, each leg is recorded as an
//! immutable [`LedgerEntry`]. Amounts are signed integer minor units
//! (cents); a positive amount credits the account, a negative amount
//! debits it.

use crate::base::{AccountId, EntryId, JournalId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Business reason a ledger entry exists. Closed set; free-form context
/// goes in the entry metadata instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRef {
    /// External money settled by the processor into an available balance.
    Deposit,
    /// Buyer funds moved into escrow for a deal.
    EscrowFund,
    /// Escrow paid out to the seller on deal completion.
    Release,
    /// Platform fee taken during a release.
    Fee,
    /// Processor-side refund mirrored into the ledger.
    Refund,
    /// Available balance spent on a platform product.
    Spend,
    /// Escrow paid to the winner of an arbitrated dispute.
    DisputePayout,
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryRef::Deposit => "deposit",
            EntryRef::EscrowFund => "escrow_fund",
            EntryRef::Release => "release",
            EntryRef::Fee => "fee",
            EntryRef::Refund => "refund",
            EntryRef::Spend => "spend",
            EntryRef::DisputePayout => "dispute_payout",
        };
        f.write_str(s)
    }
}

/// One proposed movement within a journal, before it is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub account_id: AccountId,
    /// Signed amount in minor units; positive credits, negative debits.
    pub amount: i64,
    pub ref_type: EntryRef,
    /// Business reference (deal id, dispute id, payment reference, ...).
    pub ref_id: String,
    /// Processor-side reference (payment intent, refund id) when one exists.
    pub external_ref: Option<String>,
    pub metadata: serde_json::Value,
}

impl Leg {
    pub fn new(
        account_id: AccountId,
        amount: i64,
        ref_type: EntryRef,
        ref_id: impl Into<String>,
    ) -> Self {
        Leg {
            account_id,
            amount,
            ref_type,
            ref_id: ref_id.into(),
            external_ref: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A committed journal leg. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub journal_id: JournalId,
    pub account_id: AccountId,
    /// Signed amount in minor units; positive credits, negative debits.
    pub amount: i64,
    pub ref_type: EntryRef,
    pub ref_id: String,
    pub external_ref: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leg_builder_defaults() {
        let leg = Leg::new(AccountId(1), -500, EntryRef::Spend, "order-42");
        assert_eq!(leg.amount, -500);
        assert_eq!(leg.external_ref, None);
        assert!(leg.metadata.is_null());
    }

    #[test]
    fn leg_builder_attaches_external_ref_and_metadata() {
        let leg = Leg::new(AccountId(1), 500, EntryRef::Refund, "pi_1")
            .with_external_ref("re_9")
            .with_metadata(serde_json::json!({"reason": "requested_by_customer"}));
        assert_eq!(leg.external_ref.as_deref(), Some("re_9"));
        assert_eq!(leg.metadata["reason"], "requested_by_customer");
    }

    #[test]
    fn entry_ref_serializes_snake_case() {
        let json = serde_json::to_string(&EntryRef::DisputePayout).unwrap();
        assert_eq!(json, "\"dispute_payout\"");
        assert_eq!(EntryRef::EscrowFund.to_string(), "escrow_fund");
    }
}
