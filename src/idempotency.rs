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

//! At-most-once gating for externally retryable ledger effects.
//!
//! A key ties one business or external reference (payment reference,
//! refund id) to at most one journal. The check-and-record is a single
//! entry-API operation, so concurrent duplicates serialize on the key:
//! a conflict *is* the idempotency signal, not a separately racy
//! read-then-write. Replays are a first-class success carrying the prior
//! journal id.

use crate::base::JournalId;
use crate::entry::EntryRef;
use crate::error::LedgerError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Idempotency key: reference type plus the external/business reference.
///
/// The same payment reference may legitimately drive different effects
/// (a deposit and a later refund), so the reference alone is not unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub ref_type: EntryRef,
    pub reference: String,
}

impl IdempotencyKey {
    pub fn new(ref_type: EntryRef, reference: impl Into<String>) -> Self {
        Self {
            ref_type,
            reference: reference.into(),
        }
    }
}

/// Result of running a guarded journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The journal was applied by this call.
    Applied(JournalId),
    /// The key was already processed; carries the prior journal.
    Replayed(JournalId),
}

impl Outcome {
    pub fn journal_id(&self) -> JournalId {
        match self {
            Outcome::Applied(id) | Outcome::Replayed(id) => *id,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed(_))
    }
}

/// Maps idempotency keys to the journal they produced.
#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    applied: DashMap<IdempotencyKey, JournalId>,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `post` at most once for `key`.
    ///
    /// The key's entry is held while `post` runs, so a concurrent
    /// duplicate blocks and then observes the recorded journal. If
    /// `post` fails nothing is recorded and a later retry may succeed.
    pub fn run<F>(&self, key: IdempotencyKey, post: F) -> Result<Outcome, LedgerError>
    where
        F: FnOnce() -> Result<JournalId, LedgerError>,
    {
        match self.applied.entry(key) {
            Entry::Occupied(prior) => Ok(Outcome::Replayed(*prior.get())),
            Entry::Vacant(slot) => {
                let journal = post()?;
                slot.insert(journal);
                Ok(Outcome::Applied(journal))
            }
        }
    }

    /// The journal previously recorded for a key, if any.
    pub fn lookup(&self, key: &IdempotencyKey) -> Option<JournalId> {
        self.applied.get(key).map(|id| *id)
    }
}
