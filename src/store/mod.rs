// SPDX-License-Identifier: LGPL-2.1-or-later
//
// This file is part of printer-locks.
//
// printer-locks is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// printer-locks is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with printer-locks. If not, see <https://www.gnu.org/licenses/>.

//! Printer state store: typed CRUD plus atomic reservation transitions.
//!
//! Every mutating operation is a single atomic step at the backend whose
//! predicate re-checks availability. No implementation may read a row and
//! separately write based on what it saw across two round trips; that
//! check-then-act split is exactly the bug class this trait exists to
//! eliminate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LockResult;
use crate::model::{HolderIdentity, PrinterState};

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
pub mod sql;

/// Outcome of an atomic reserve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The row was available and is now reserved by the caller.
    Reserved,
    /// The row is missing or already reserved; trying again immediately
    /// will not help.
    Unavailable,
    /// A native row lock was held by another in-flight transaction
    /// (`FOR UPDATE NOWAIT` fail-fast). The row may free up momentarily;
    /// only backends with row-level locking ever report this.
    Busy,
}

/// Typed operations over `printer_states` rows.
///
/// ## Guarantees
/// - The availability/reservation consistency rule holds immediately before
///   and after every call, and is never observably violated to a concurrent
///   reader.
/// - Under racing [`try_reserve`](Self::try_reserve) calls for one name,
///   exactly one caller observes [`ReserveOutcome::Reserved`].
/// - Absence is a value, not an error: lookups return `Option`, reserve and
///   release report their outcome in the return value.
#[async_trait]
pub trait PrinterStateStore: Send + Sync {
    /// All available rows, ordered by printer name. Deterministic ordering
    /// makes "first available" selection reproducible across retries and
    /// tests.
    async fn get_available_printers(&self) -> LockResult<Vec<PrinterState>>;

    /// Single row by name; `None` for absence.
    async fn get_printer(&self, name: &str) -> LockResult<Option<PrinterState>>;

    /// Atomic compare-and-swap from available to reserved.
    ///
    /// Succeeds only if the row was available at the moment of the
    /// backend-level atomic operation; never leaves a partial state.
    async fn try_reserve(
        &self,
        name: &str,
        holder: &HolderIdentity,
        reserved_at: DateTime<Utc>,
    ) -> LockResult<ReserveOutcome>;

    /// Atomic reset to available.
    ///
    /// With `Some(holder)` the reset happens only if the row's reservation
    /// fields match the holder; otherwise the call is a no-op returning
    /// `false`. With `None` the reset is unconditional (administrative
    /// force-release).
    async fn release(&self, name: &str, holder: Option<&HolderIdentity>) -> LockResult<bool>;

    /// Bulk transition of every row with `reserved_at < cutoff` back to
    /// available. Returns the number of reclaimed rows. This is the sole
    /// crash-recovery mechanism; staleness is time-based only.
    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> LockResult<u64>;

    /// Insert a fresh available row. Returns `false` without mutation if a
    /// row with that name already exists.
    async fn insert_printer(&self, name: &str) -> LockResult<bool>;

    /// Total row count. Diagnostics and test assertions; the bootstrap
    /// path relies on [`insert_printer`](Self::insert_printer) idempotence
    /// instead of probing for emptiness first.
    async fn count_printers(&self) -> LockResult<u64>;
}
