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

//! Durable account storage and the atomic journal apply.
//!
//! The store exposes one mutating primitive: [`LedgerStore::apply_journal`],
//! which commits a balanced set of legs against their accounts
//! all-or-nothing. It also resolves accounts by (owner, kind, currency)
//! with get-or-create semantics that tolerate creation races: the loser of
//! a race observes the winner's account instead of erroring.
//!
//! # Locking
//!
//! Accounts touched by a journal are locked in ascending [`AccountId`]
//! order. Every multi-account code path goes through this method, so the
//! lock graph is acyclic. No external network call ever happens while
//! these locks are held.

use crate::account::{AccountKind, LedgerAccount};
use crate::base::{AccountId, Currency, EntryId, JournalId, OwnerId};
use crate::entry::{LedgerEntry, Leg};
use crate::error::LedgerError;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Resolver key: one account per (owner, kind, currency).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AccountKey {
    owner: Option<OwnerId>,
    kind: AccountKind,
    currency: Currency,
}

/// In-memory account store with per-account locking and an append-only
/// journal registry.
#[derive(Debug, Default)]
pub struct LedgerStore {
    /// Accounts by id; the `Arc` lets `apply_journal` lock accounts
    /// without holding any map shard.
    accounts: DashMap<AccountId, Arc<LedgerAccount>>,
    /// Uniqueness index backing get-or-create.
    index: DashMap<AccountKey, AccountId>,
    /// Committed journals, for reconciliation and audit.
    journals: DashMap<JournalId, Vec<LedgerEntry>>,
    next_account: AtomicU64,
    next_entry: AtomicU64,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the account for (owner, kind, currency), creating it on
    /// first reference.
    ///
    /// Two concurrent first-accesses for the same key serialize on the
    /// index entry; the loser gets the winner's id (conflict-as-success).
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] if an owner is supplied for a
    /// platform-level kind; those accounts are ownerless by construction.
    pub fn get_or_create(
        &self,
        owner: Option<OwnerId>,
        kind: AccountKind,
        currency: &Currency,
    ) -> Result<AccountId, LedgerError> {
        if kind.is_platform_level() && owner.is_some() {
            return Err(LedgerError::Validation(
                "platform-level accounts are ownerless",
            ));
        }

        let key = AccountKey {
            owner,
            kind,
            currency: currency.clone(),
        };
        match self.index.entry(key) {
            Entry::Occupied(existing) => Ok(*existing.get()),
            Entry::Vacant(slot) => {
                let id = AccountId(self.next_account.fetch_add(1, Ordering::Relaxed) + 1);
                let account = Arc::new(LedgerAccount::new(id, owner, kind, currency.clone()));
                // Account must be reachable before the index points at it.
                self.accounts.insert(id, account);
                slot.insert(id);
                Ok(id)
            }
        }
    }

    /// Looks up an account id without creating one.
    pub fn lookup(
        &self,
        owner: Option<OwnerId>,
        kind: AccountKind,
        currency: &Currency,
    ) -> Option<AccountId> {
        let key = AccountKey {
            owner,
            kind,
            currency: currency.clone(),
        };
        self.index.get(&key).map(|id| *id)
    }

    pub fn account(&self, id: AccountId) -> Option<Arc<LedgerAccount>> {
        self.accounts.get(&id).map(|a| Arc::clone(&a))
    }

    /// All accounts, sorted by id for deterministic output.
    pub fn accounts(&self) -> Vec<Arc<LedgerAccount>> {
        let mut out: Vec<_> = self.accounts.iter().map(|a| Arc::clone(&a)).collect();
        out.sort_by_key(|a| a.id());
        out
    }

    /// Entries of a committed journal.
    pub fn journal(&self, id: JournalId) -> Option<Vec<LedgerEntry>> {
        self.journals.get(&id).map(|e| e.clone())
    }

    /// Snapshot of all committed journals, for reconciliation sweeps.
    pub fn journals(&self) -> Vec<(JournalId, Vec<LedgerEntry>)> {
        self.journals
            .iter()
            .map(|j| (*j.key(), j.value().clone()))
            .collect()
    }

    pub fn journal_count(&self) -> usize {
        self.journals.len()
    }

    /// Applies a balanced set of legs as one atomic unit.
    ///
    /// All precondition checks (zero-sum, currency consistency, balance
    /// coverage) happen before any leg is committed; on any error no
    /// entry is written and no balance moves.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ImbalancedJournal`]: legs do not sum to zero.
    ///   The journal engine checks this first; the store re-validates
    ///   defensively.
    /// - [`LedgerError::CurrencyMismatch`]: legs span currencies.
    /// - [`LedgerError::InsufficientBalance`] /
    ///   [`LedgerError::InsufficientEscrow`]: a debit would take an
    ///   available or escrow balance below zero.
    /// - [`LedgerError::AccountNotFound`]: a leg references an unknown
    ///   account.
    pub fn apply_journal(&self, journal_id: JournalId, legs: &[Leg]) -> Result<(), LedgerError> {
        if legs.is_empty() {
            return Err(LedgerError::Validation("journal has no legs"));
        }
        if legs.iter().any(|leg| leg.amount == 0) {
            return Err(LedgerError::Validation("journal leg amount must be non-zero"));
        }
        let sum: i128 = legs.iter().map(|leg| leg.amount as i128).sum();
        if sum != 0 {
            return Err(LedgerError::ImbalancedJournal);
        }

        // Net effect per account; a journal may carry several legs
        // against the same account.
        let mut nets: HashMap<AccountId, i128> = HashMap::new();
        for leg in legs {
            *nets.entry(leg.account_id).or_insert(0) += leg.amount as i128;
        }

        // Resolve accounts up front; Arc clones release the map shards
        // before any mutex is taken.
        let mut touched: Vec<AccountId> = nets.keys().copied().collect();
        touched.sort();
        let mut resolved: Vec<Arc<LedgerAccount>> = Vec::with_capacity(touched.len());
        for id in &touched {
            resolved.push(self.account(*id).ok_or(LedgerError::AccountNotFound)?);
        }
        let currency = resolved[0].currency().clone();
        if resolved.iter().any(|a| *a.currency() != currency) {
            return Err(LedgerError::CurrencyMismatch);
        }

        // Lock in ascending id order, then stage: every balance check
        // passes before the first commit.
        let mut guards: Vec<_> = resolved.iter().map(|a| a.lock()).collect();
        let mut slot_of: HashMap<AccountId, usize> = HashMap::new();
        for (i, account) in resolved.iter().enumerate() {
            slot_of.insert(account.id(), i);
        }
        for (i, account) in resolved.iter().enumerate() {
            let net = nets[&account.id()];
            let next = guards[i].balance as i128 + net;
            if next < i64::MIN as i128 || next > i64::MAX as i128 {
                return Err(LedgerError::Validation("balance overflow"));
            }
            if next < 0 && !account.kind().allows_negative() {
                return Err(match account.kind() {
                    AccountKind::Escrow => LedgerError::InsufficientEscrow,
                    _ => LedgerError::InsufficientBalance,
                });
            }
        }

        // Commit. Nothing below can fail.
        let now = Utc::now();
        let mut committed = Vec::with_capacity(legs.len());
        for leg in legs {
            let entry = LedgerEntry {
                id: EntryId(self.next_entry.fetch_add(1, Ordering::Relaxed) + 1),
                journal_id,
                account_id: leg.account_id,
                amount: leg.amount,
                ref_type: leg.ref_type,
                ref_id: leg.ref_id.clone(),
                external_ref: leg.external_ref.clone(),
                metadata: leg.metadata.clone(),
                created_at: now,
            };
            guards[slot_of[&leg.account_id]].commit(entry.clone());
            committed.push(entry);
        }
        self.journals.insert(journal_id, committed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryRef;

    fn usd() -> Currency {
        Currency::new("usd")
    }

    fn store_with_funded_account(balance: i64) -> (LedgerStore, AccountId, AccountId) {
        let store = LedgerStore::new();
        let available = store
            .get_or_create(Some(OwnerId(1)), AccountKind::Available, &usd())
            .unwrap();
        let clearing = store
            .get_or_create(None, AccountKind::Clearing, &usd())
            .unwrap();
        store
            .apply_journal(
                JournalId(1),
                &[
                    Leg::new(clearing, -balance, EntryRef::Deposit, "pi_seed"),
                    Leg::new(available, balance, EntryRef::Deposit, "pi_seed"),
                ],
            )
            .unwrap();
        (store, available, clearing)
    }

    #[test]
    fn get_or_create_is_stable() {
        let store = LedgerStore::new();
        let a = store
            .get_or_create(Some(OwnerId(1)), AccountKind::Available, &usd())
            .unwrap();
        let b = store
            .get_or_create(Some(OwnerId(1)), AccountKind::Available, &usd())
            .unwrap();
        assert_eq!(a, b);

        let other = store
            .get_or_create(Some(OwnerId(1)), AccountKind::Escrow, &usd())
            .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn platform_accounts_reject_owners() {
        let store = LedgerStore::new();
        let err = store
            .get_or_create(Some(OwnerId(1)), AccountKind::PlatformRevenue, &usd())
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::Validation("platform-level accounts are ownerless")
        );
    }

    #[test]
    fn apply_journal_moves_balances() {
        let (store, available, clearing) = store_with_funded_account(10_000);
        assert_eq!(store.account(available).unwrap().balance(), 10_000);
        assert_eq!(store.account(clearing).unwrap().balance(), -10_000);
        assert_eq!(store.journal_count(), 1);
    }

    #[test]
    fn imbalanced_journal_rejected() {
        let (store, available, clearing) = store_with_funded_account(1_000);
        let err = store
            .apply_journal(
                JournalId(2),
                &[
                    Leg::new(available, -500, EntryRef::Spend, "x"),
                    Leg::new(clearing, 400, EntryRef::Spend, "x"),
                ],
            )
            .unwrap_err();
        assert_eq!(err, LedgerError::ImbalancedJournal);
        assert_eq!(store.account(available).unwrap().balance(), 1_000);
    }

    #[test]
    fn overdraft_leaves_no_trace() {
        let (store, available, clearing) = store_with_funded_account(100);
        let err = store
            .apply_journal(
                JournalId(2),
                &[
                    Leg::new(available, -500, EntryRef::Spend, "x"),
                    Leg::new(clearing, 500, EntryRef::Spend, "x"),
                ],
            )
            .unwrap_err();
        assert_eq!(err, LedgerError::InsufficientBalance);
        assert_eq!(store.account(available).unwrap().balance(), 100);
        assert_eq!(store.account(available).unwrap().entries().len(), 1);
        assert!(store.journal(JournalId(2)).is_none());
    }

    #[test]
    fn escrow_underflow_reports_insufficient_escrow() {
        let store = LedgerStore::new();
        let escrow = store
            .get_or_create(Some(OwnerId(1)), AccountKind::Escrow, &usd())
            .unwrap();
        let available = store
            .get_or_create(Some(OwnerId(2)), AccountKind::Available, &usd())
            .unwrap();
        let err = store
            .apply_journal(
                JournalId(1),
                &[
                    Leg::new(escrow, -500, EntryRef::Release, "deal-1"),
                    Leg::new(available, 500, EntryRef::Release, "deal-1"),
                ],
            )
            .unwrap_err();
        assert_eq!(err, LedgerError::InsufficientEscrow);
    }

    #[test]
    fn mixed_currency_journal_rejected() {
        let store = LedgerStore::new();
        let usd_acct = store
            .get_or_create(Some(OwnerId(1)), AccountKind::Available, &usd())
            .unwrap();
        let eur_acct = store
            .get_or_create(Some(OwnerId(1)), AccountKind::Available, &Currency::new("eur"))
            .unwrap();
        let err = store
            .apply_journal(
                JournalId(1),
                &[
                    Leg::new(usd_acct, -100, EntryRef::Spend, "x"),
                    Leg::new(eur_acct, 100, EntryRef::Spend, "x"),
                ],
            )
            .unwrap_err();
        assert_eq!(err, LedgerError::CurrencyMismatch);
    }

    #[test]
    fn zero_amount_leg_rejected() {
        let (store, available, _) = store_with_funded_account(100);
        let err = store
            .apply_journal(
                JournalId(2),
                &[
                    Leg::new(available, 0, EntryRef::Spend, "x"),
                    Leg::new(available, 0, EntryRef::Spend, "x"),
                ],
            )
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::Validation("journal leg amount must be non-zero")
        );
    }

    #[test]
    fn multiple_legs_same_account_are_netted() {
        let (store, available, clearing) = store_with_funded_account(1_000);
        store
            .apply_journal(
                JournalId(2),
                &[
                    Leg::new(available, -300, EntryRef::Spend, "a"),
                    Leg::new(available, -200, EntryRef::Spend, "b"),
                    Leg::new(clearing, 500, EntryRef::Spend, "a"),
                ],
            )
            .unwrap();
        assert_eq!(store.account(available).unwrap().balance(), 500);
        assert_eq!(store.account(available).unwrap().entries().len(), 3);
    }
}
