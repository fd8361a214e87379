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

//! Configuration for the reservation subsystem.
//!
//! ## Design Principles
//! - **Explicit ownership**: one `LockConfig` per process or per test,
//!   constructed and passed explicitly. There is no global instance.
//! - **Sensible defaults**: the default configuration runs fully in-memory
//!   with the standard two-printer PDF fleet.
//! - **Environment fallback**: when no connection string is given,
//!   [`PRINTER_LOCKS_DATABASE_URL`](DATABASE_URL_ENV) is consulted before
//!   falling back to the in-memory provider.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable consulted when no explicit connection string is set.
pub const DATABASE_URL_ENV: &str = "PRINTER_LOCKS_DATABASE_URL";

/// Default fleet of named PDF virtual printers bootstrapped into an empty
/// store.
pub const DEFAULT_FLEET: [&str; 2] = ["PDF24", "PDFCreator"];

/// Configuration for stores, the lock service, and the schema manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Explicit backend connection string. `None` means: consult
    /// [`DATABASE_URL_ENV`], then default to the in-memory provider.
    pub connection_string: Option<String>,

    /// Per-statement timeout applied to pool acquisition.
    pub command_timeout: Duration,

    /// Retry budget for transient backend failures. Contention is never
    /// retried past this budget either.
    pub max_retry_attempts: u32,

    /// Lease length applied when an acquisition does not specify one.
    pub default_lease: Duration,

    /// Age past which an unreleased reservation is considered stale and
    /// reclaimable by the cleanup sweep.
    pub max_lock_duration: Duration,

    /// Printer names bootstrapped into an empty store.
    pub default_fleet: Vec<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            command_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            default_lease: Duration::from_secs(5 * 60),
            max_lock_duration: Duration::from_secs(10 * 60),
            default_fleet: DEFAULT_FLEET.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl LockConfig {
    /// Configuration pinned to an explicit connection string.
    pub fn with_connection_string(url: impl Into<String>) -> Self {
        Self {
            connection_string: Some(url.into()),
            ..Self::default()
        }
    }

    /// Resolve the effective connection string: explicit value first, then
    /// the environment, else `None` (in-memory).
    pub fn resolve_connection_string(&self) -> Option<String> {
        self.connection_string
            .clone()
            .or_else(|| std::env::var(DATABASE_URL_ENV).ok())
    }
}
