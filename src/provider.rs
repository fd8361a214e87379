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

//! Provider abstraction: a closed set of backend strategies.
//!
//! ## Purpose
//! Wraps one storage technology behind a uniform surface: a connection
//! factory, idempotent DDL for the `printer_states` table, the
//! dialect-correct "reserve under lock" statement, and the
//! [`supports_row_level_locking`](Provider::supports_row_level_locking)
//! capability flag.
//!
//! ## Strategies
//! - **InMemory**: process-wide concurrent map, per-key compare-and-swap.
//! - **Sqlite**: optimistic token, no native row locking. The reserve
//!   statement is a single `UPDATE ... WHERE is_available = 1` whose
//!   affected-row count is the CAS result.
//! - **Postgres**: native row locking with `SELECT ... FOR UPDATE NOWAIT`,
//!   failing fast instead of blocking when another transaction holds the row.
//!
//! Callers never branch on provider identity; the reservation service
//! branches only on the capability flag when choosing its retry policy.

use crate::config::LockConfig;
use crate::error::{LockError, LockResult};

#[cfg(feature = "postgres-backend")]
use sqlx::postgres::PgPoolOptions;
#[cfg(feature = "sqlite-backend")]
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

/// Idempotent DDL for SQLite. Named constraints are inline because SQLite
/// cannot attach table constraints after creation.
const SQLITE_CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS printer_states (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  printer_name TEXT NOT NULL,
  is_available INTEGER NOT NULL DEFAULT 1,
  reserved_by TEXT,
  reserved_at INTEGER,
  process_id INTEGER,
  machine_name TEXT,
  version INTEGER NOT NULL DEFAULT 0,
  CONSTRAINT uq_printer_states_name UNIQUE (printer_name),
  CONSTRAINT ck_printer_states_name_nonempty CHECK (length(printer_name) > 0),
  CONSTRAINT ck_printer_states_reservation_consistent CHECK (
    (is_available = 1 AND reserved_by IS NULL AND reserved_at IS NULL AND process_id IS NULL)
    OR
    (is_available = 0 AND reserved_by IS NOT NULL AND reserved_at IS NOT NULL AND process_id IS NOT NULL)
  )
);
"#;

const POSTGRES_CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS printer_states (
  id BIGSERIAL PRIMARY KEY,
  printer_name TEXT NOT NULL,
  is_available BOOLEAN NOT NULL DEFAULT TRUE,
  reserved_by TEXT,
  reserved_at TIMESTAMPTZ,
  process_id BIGINT,
  machine_name TEXT,
  version BIGINT NOT NULL DEFAULT 0,
  CONSTRAINT uq_printer_states_name UNIQUE (printer_name),
  CONSTRAINT ck_printer_states_name_nonempty CHECK (length(printer_name) > 0),
  CONSTRAINT ck_printer_states_reservation_consistent CHECK (
    (is_available = TRUE AND reserved_by IS NULL AND reserved_at IS NULL AND process_id IS NULL)
    OR
    (is_available = FALSE AND reserved_by IS NOT NULL AND reserved_at IS NOT NULL AND process_id IS NOT NULL)
  )
);
"#;

/// SQLite reserve statement: optimistic compare-and-swap in one statement.
/// Succeeds iff the row was available at execution time.
const SQLITE_RESERVE: &str = r#"
UPDATE printer_states
   SET is_available = 0,
       reserved_by = ?1,
       reserved_at = ?2,
       process_id = ?3,
       machine_name = ?4,
       version = version + 1
 WHERE printer_name = ?5 AND is_available = 1
"#;

/// Postgres reserve pre-selection: takes the row lock, failing fast when
/// another transaction already holds it.
const POSTGRES_RESERVE_SELECT: &str = r#"
SELECT id FROM printer_states
 WHERE printer_name = $1 AND is_available = TRUE
   FOR UPDATE NOWAIT
"#;

/// One configured backend strategy.
///
/// The set is closed by design: each variant carries only the data needed to
/// build its statements, and the reservation service consumes the strategies
/// through the [`PrinterStateStore`](crate::store::PrinterStateStore) trait
/// plus this capability flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// Process-wide concurrent map; per-key compare-and-swap.
    InMemory,
    /// SQLite via sqlx; optimistic token, no native row locking.
    Sqlite {
        /// sqlx SQLite URL, e.g. `sqlite::memory:` or `sqlite://locks.db`.
        url: String,
    },
    /// PostgreSQL via sqlx; `SELECT ... FOR UPDATE NOWAIT` row locking.
    Postgres {
        /// Postgres URL, e.g. `postgres://host/db`.
        url: String,
    },
}

impl Provider {
    /// Build a provider from the configured connection source.
    ///
    /// Resolution order: explicit connection string, then the
    /// [`PRINTER_LOCKS_DATABASE_URL`](crate::config::DATABASE_URL_ENV)
    /// environment variable, then in-memory. An unrecognized scheme is a
    /// configuration error, not a silent fallback.
    pub fn from_config(config: &LockConfig) -> LockResult<Self> {
        let provider = match config.resolve_connection_string() {
            None => Provider::InMemory,
            Some(url) if url.starts_with("sqlite:") => Provider::Sqlite { url },
            Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                Provider::Postgres { url }
            }
            Some(url) => {
                return Err(LockError::Configuration(format!(
                    "unrecognized connection string scheme: {}",
                    url
                )))
            }
        };
        debug!(provider = provider.kind(), "resolved backend provider");
        Ok(provider)
    }

    /// Short name for logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Provider::InMemory => "memory",
            Provider::Sqlite { .. } => "sqlite",
            Provider::Postgres { .. } => "postgres",
        }
    }

    /// Whether the backend serializes reservations with a native row lock.
    ///
    /// When `true`, a failed reserve may mean "row briefly locked by another
    /// transaction" and a short bounded retry is worthwhile; when `false`,
    /// a failed reserve means the printer is genuinely taken.
    pub fn supports_row_level_locking(&self) -> bool {
        matches!(self, Provider::Postgres { .. })
    }

    /// Idempotent `CREATE TABLE IF NOT EXISTS` DDL for this dialect.
    /// The in-memory provider has no schema.
    pub fn create_table_sql(&self) -> Option<&'static str> {
        match self {
            Provider::InMemory => None,
            Provider::Sqlite { .. } => Some(SQLITE_CREATE_TABLE),
            Provider::Postgres { .. } => Some(POSTGRES_CREATE_TABLE),
        }
    }

    /// The dialect-correct "reserve under lock" statement.
    ///
    /// For SQLite this is the complete single-statement CAS UPDATE; for
    /// Postgres it is the `FOR UPDATE NOWAIT` pre-selection run inside the
    /// reserving transaction.
    pub fn reserve_sql(&self) -> Option<&'static str> {
        match self {
            Provider::InMemory => None,
            Provider::Sqlite { .. } => Some(SQLITE_RESERVE),
            Provider::Postgres { .. } => Some(POSTGRES_RESERVE_SELECT),
        }
    }

    /// Connect a SQLite pool for this provider.
    ///
    /// In-memory SQLite URLs are pinned to a single connection: every pool
    /// connection would otherwise open its own private database.
    #[cfg(feature = "sqlite-backend")]
    pub async fn connect_sqlite(&self, config: &LockConfig) -> LockResult<sqlx::SqlitePool> {
        let url = match self {
            Provider::Sqlite { url } => url,
            other => {
                return Err(LockError::Configuration(format!(
                    "connect_sqlite called on {} provider",
                    other.kind()
                )))
            }
        };
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(config.command_timeout)
            .connect(url)
            .await
            .map_err(|e| LockError::Backend(format!("failed to connect SQLite: {e}")))
    }

    /// Connect a Postgres pool for this provider.
    #[cfg(feature = "postgres-backend")]
    pub async fn connect_postgres(&self, config: &LockConfig) -> LockResult<sqlx::PgPool> {
        let url = match self {
            Provider::Postgres { url } => url,
            other => {
                return Err(LockError::Configuration(format!(
                    "connect_postgres called on {} provider",
                    other.kind()
                )))
            }
        };
        PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(config.command_timeout)
            .connect(url)
            .await
            .map_err(|e| LockError::Backend(format!("failed to connect Postgres: {e}")))
    }
}
