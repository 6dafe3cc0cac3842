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

//! Journal posting: zero-sum validation and id allocation.
//!
//! The engine validates that proposed legs balance, allocates a fresh
//! journal id, and delegates the atomic apply to the store. It does not
//! enforce idempotency; callers fed by retryable external sources go
//! through [`IdempotencyGuard`](crate::idempotency::IdempotencyGuard)
//! first.

use crate::base::JournalId;
use crate::entry::Leg;
use crate::error::LedgerError;
use crate::store::LedgerStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Validates and posts balanced journals against a [`LedgerStore`].
#[derive(Debug)]
pub struct JournalEngine {
    store: Arc<LedgerStore>,
    next_journal: AtomicU64,
}

impl JournalEngine {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self {
            store,
            next_journal: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Posts a balanced set of legs as one journal.
    ///
    /// An imbalanced proposal is a programming error in the caller; it is
    /// rejected here and never reaches storage.
    ///
    /// # Errors
    ///
    /// [`LedgerError::ImbalancedJournal`] if the legs do not sum to zero,
    /// plus everything [`LedgerStore::apply_journal`] can raise.
    pub fn post(&self, legs: Vec<Leg>) -> Result<JournalId, LedgerError> {
        if legs.is_empty() {
            return Err(LedgerError::Validation("journal has no legs"));
        }
        let sum: i128 = legs.iter().map(|leg| leg.amount as i128).sum();
        if sum != 0 {
            return Err(LedgerError::ImbalancedJournal);
        }

        let id = JournalId(self.next_journal.fetch_add(1, Ordering::Relaxed) + 1);
        self.store.apply_journal(id, &legs)?;
        Ok(id)
    }
}
