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

//! Error types for ledger and escrow operations.
//!
//! Every error here is raised strictly before the atomic apply begins;
//! once a journal starts committing it either lands in full or leaves
//! no trace. Idempotent replays are not errors; they surface as
//! [`Outcome::Replayed`](crate::idempotency::Outcome).

use crate::processor::ProcessorError;
use thiserror::Error;

/// Ledger and escrow processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed input rejected before any mutation
    #[error("validation failed: {0}")]
    Validation(&'static str),

    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Actor is not allowed to perform this action
    #[error("actor is not permitted to perform this action")]
    NotPermitted,

    /// Referenced account does not exist
    #[error("account not found")]
    AccountNotFound,

    /// Referenced deal does not exist
    #[error("deal not found")]
    DealNotFound,

    /// Referenced dispute does not exist
    #[error("dispute not found")]
    DisputeNotFound,

    /// Referenced payment reference has no staged deposit
    #[error("unknown payment reference")]
    UnknownPaymentReference,

    /// Journal legs do not sum to zero (programmer error, never stored)
    #[error("journal legs do not sum to zero")]
    ImbalancedJournal,

    /// Journal legs span accounts with different currency tags
    #[error("journal legs mix currencies")]
    CurrencyMismatch,

    /// Debit would take an available balance below zero
    #[error("insufficient available balance")]
    InsufficientBalance,

    /// Escrow does not cover the deal amount
    #[error("insufficient escrow balance")]
    InsufficientEscrow,

    /// Deal must be open for this operation
    #[error("deal is not open")]
    DealNotOpen,

    /// Deal must be in progress for this operation
    #[error("deal is not in progress")]
    DealNotInProgress,

    /// Deal must be disputed for this operation
    #[error("deal is not disputed")]
    DealNotDisputed,

    /// Webhook signature did not verify
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Payment is not eligible for (further) refund
    #[error("payment is not refund-eligible")]
    NotRefundEligible,

    /// External payment processor call failed
    #[error("payment processor error: {0}")]
    Processor(#[from] ProcessorError),
}
