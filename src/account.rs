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

//! Ledger balance accounts.
//!
//! An account's balance and its entry history live under one mutex, so
//! "balance equals the sum of entries" holds at every observation point.
//! Mutation happens only through [`LedgerStore::apply_journal`], which
//! locks all touched accounts before committing any leg.
//!
//! [`LedgerStore::apply_journal`]: crate::store::LedgerStore::apply_journal

use crate::base::{AccountId, Currency, OwnerId};
use crate::entry::LedgerEntry;
use parking_lot::{Mutex, MutexGuard};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::Deserialize;
use std::fmt;

/// What role an account plays in the money flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// Freely spendable user funds.
    Available,
    /// Funds committed to an in-progress deal, held until release or
    /// arbitration.
    Escrow,
    /// Fees and product revenue accrued by the platform. Ownerless.
    PlatformRevenue,
    /// Float held at the external processor; the counterparty leg for
    /// money entering or leaving the platform. Ownerless, credit-normal,
    /// so its balance runs negative while users hold funds.
    Clearing,
}

impl AccountKind {
    /// Available and escrow balances must never go negative; the
    /// platform-level bookkeeping accounts are allowed to.
    pub fn allows_negative(self) -> bool {
        matches!(self, AccountKind::PlatformRevenue | AccountKind::Clearing)
    }

    /// Platform-level kinds are ownerless by construction.
    pub fn is_platform_level(self) -> bool {
        matches!(self, AccountKind::PlatformRevenue | AccountKind::Clearing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::Available => "available",
            AccountKind::Escrow => "escrow",
            AccountKind::PlatformRevenue => "platform_revenue",
            AccountKind::Clearing => "clearing",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub(crate) struct AccountData {
    pub(crate) balance: i64,
    /// Append-only history; every committed leg lands here.
    pub(crate) entries: Vec<LedgerEntry>,
}

impl AccountData {
    fn new() -> Self {
        Self {
            balance: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn entries_total(&self) -> i64 {
        let total: i128 = self.entries.iter().map(|e| e.amount as i128).sum();
        total as i64
    }

    /// Appends a committed entry and updates the balance.
    ///
    /// Callers must have validated the journal beforehand; this is the
    /// commit half of stage-then-commit and cannot fail.
    pub(crate) fn commit(&mut self, entry: LedgerEntry) {
        self.balance += entry.amount;
        self.entries.push(entry);
        debug_assert_eq!(
            self.balance,
            self.entries_total(),
            "invariant violated: balance diverged from entry sum"
        );
    }
}

/// A ledger balance account: optional owner, kind, currency, and the
/// mutex-guarded balance plus entry history.
#[derive(Debug)]
pub struct LedgerAccount {
    id: AccountId,
    owner: Option<OwnerId>,
    kind: AccountKind,
    currency: Currency,
    inner: Mutex<AccountData>,
}

impl LedgerAccount {
    pub(crate) fn new(
        id: AccountId,
        owner: Option<OwnerId>,
        kind: AccountKind,
        currency: Currency,
    ) -> Self {
        debug_assert!(
            !(kind.is_platform_level() && owner.is_some()),
            "platform-level accounts are ownerless"
        );
        Self {
            id,
            owner,
            kind,
            currency,
            inner: Mutex::new(AccountData::new()),
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn balance(&self) -> i64 {
        self.inner.lock().balance
    }

    /// Snapshot of the account's entry history.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.lock().entries.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AccountData> {
        self.inner.lock()
    }
}

impl Serialize for LedgerAccount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("LedgerAccount", 5)?;
        state.serialize_field("account", &self.id)?;
        state.serialize_field("owner", &self.owner)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("currency", &self.currency)?;
        state.serialize_field("balance", &data.balance)?;
        state.end()
    }
}
