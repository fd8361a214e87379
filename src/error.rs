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

//! Error types for printer reservation operations.
//!
//! Contention (printer taken, lock not obtained) is **not** an error in this
//! crate: lock-service operations report it through `Option`/`bool` returns.
//! `LockError` covers the exceptional classes only: bad configuration,
//! unreachable backends, missing or malformed schema, and data-integrity
//! violations that the CHECK constraint exists to catch.

use thiserror::Error;

/// Result type for reservation operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during reservation operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Malformed or unresolvable configuration (e.g. unrecognized connection
    /// string scheme).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backing store unreachable or a statement failed (database, network).
    #[error("backend error: {0}")]
    Backend(String),

    /// Schema missing, incomplete, or DDL failure.
    #[error("schema error: {0}")]
    Schema(String),

    /// A loaded row violates the availability/reservation consistency rule.
    /// Must never occur given correct atomic operations; fatal if it does.
    #[error("integrity violation on printer '{printer}': {detail}")]
    IntegrityViolation { printer: String, detail: String },

    /// No lock could be obtained for the named printer. Only raised by the
    /// throwing facade path ([`with_printer_lock`](crate::facade::with_printer_lock));
    /// the lock service itself signals contention via `None`.
    #[error("no lock obtained for printer '{0}'")]
    Unavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Backend(format!("SQL error: {}", err))
    }
}
