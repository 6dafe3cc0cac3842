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

//! Deals and disputes.
//!
//! Deal status machine:
//!
//! ```text
//! Open ──fund──► InProgress ──release──► Completed
//!                    │
//!                    └──dispute──► Disputed ──resolve──► Resolved
//! ```
//!
//! A dispute exists only while its deal is disputed and moves
//! Open → Resolved exactly once; the workflows hold the record mutex
//! across the status check, the journal post, and the transition, so a
//! deal is released or dispute-resolved at most once.

use crate::base::{DealId, DisputeId, JournalId, OwnerId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::base::Currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Open,
    InProgress,
    Completed,
    Disputed,
    Resolved,
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DealStatus::Open => "open",
            DealStatus::InProgress => "in_progress",
            DealStatus::Completed => "completed",
            DealStatus::Disputed => "disputed",
            DealStatus::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub(crate) struct DealState {
    pub(crate) status: DealStatus,
    /// Journal that settled the deal (release or dispute payout).
    pub(crate) settlement: Option<JournalId>,
}

/// An agreed exchange between a buyer and a seller whose payment is
/// escrow-held until release or dispute resolution.
#[derive(Debug)]
pub struct Deal {
    id: DealId,
    buyer: OwnerId,
    seller: OwnerId,
    amount: i64,
    currency: Currency,
    state: Mutex<DealState>,
}

impl Deal {
    pub(crate) fn new(
        id: DealId,
        buyer: OwnerId,
        seller: OwnerId,
        amount: i64,
        currency: Currency,
    ) -> Self {
        Self {
            id,
            buyer,
            seller,
            amount,
            currency,
            state: Mutex::new(DealState {
                status: DealStatus::Open,
                settlement: None,
            }),
        }
    }

    pub fn id(&self) -> DealId {
        self.id
    }

    pub fn buyer(&self) -> OwnerId {
        self.buyer
    }

    pub fn seller(&self) -> OwnerId {
        self.seller
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn status(&self) -> DealStatus {
        self.state.lock().status
    }

    /// Journal that settled the deal, once completed or resolved.
    pub fn settlement(&self) -> Option<JournalId> {
        self.state.lock().settlement
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DealState> {
        self.state.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeState {
    Open,
    Resolved,
}

/// Which side of the deal an arbitrated dispute pays out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeWinner {
    Buyer,
    Seller,
}

impl fmt::Display for DisputeWinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisputeWinner::Buyer => f.write_str("buyer"),
            DisputeWinner::Seller => f.write_str("seller"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct DisputeData {
    pub(crate) state: DisputeState,
    pub(crate) winner: Option<DisputeWinner>,
    pub(crate) resolved_at: Option<DateTime<Utc>>,
    pub(crate) payout: Option<JournalId>,
}

/// An open contest over an in-progress deal, resolved by arbitration.
#[derive(Debug)]
pub struct Dispute {
    id: DisputeId,
    deal_id: DealId,
    opened_by: OwnerId,
    inner: Mutex<DisputeData>,
}

impl Dispute {
    pub(crate) fn new(id: DisputeId, deal_id: DealId, opened_by: OwnerId) -> Self {
        Self {
            id,
            deal_id,
            opened_by,
            inner: Mutex::new(DisputeData {
                state: DisputeState::Open,
                winner: None,
                resolved_at: None,
                payout: None,
            }),
        }
    }

    pub fn id(&self) -> DisputeId {
        self.id
    }

    pub fn deal_id(&self) -> DealId {
        self.deal_id
    }

    pub fn opened_by(&self) -> OwnerId {
        self.opened_by
    }

    pub fn state(&self) -> DisputeState {
        self.inner.lock().state
    }

    pub fn winner(&self) -> Option<DisputeWinner> {
        self.inner.lock().winner
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().resolved_at
    }

    /// Journal that paid the escrow to the winner.
    pub fn payout(&self) -> Option<JournalId> {
        self.inner.lock().payout
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DisputeData> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_deal_is_open_and_unsettled() {
        let deal = Deal::new(
            DealId(1),
            OwnerId(1),
            OwnerId(2),
            10_000,
            Currency::new("usd"),
        );
        assert_eq!(deal.status(), DealStatus::Open);
        assert_eq!(deal.settlement(), None);
    }

    #[test]
    fn new_dispute_is_open_with_no_winner() {
        let dispute = Dispute::new(DisputeId(1), DealId(1), OwnerId(1));
        assert_eq!(dispute.state(), DisputeState::Open);
        assert_eq!(dispute.winner(), None);
        assert_eq!(dispute.payout(), None);
    }

    #[test]
    fn winner_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&DisputeWinner::Seller).unwrap(),
            "\"seller\""
        );
        assert_eq!(DisputeWinner::Buyer.to_string(), "buyer");
    }
}
