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

//! SQL-backed printer state stores (SQLite and PostgreSQL).
//!
//! Both backends keep the reservation transition a single backend-atomic
//! step, but with different locking primitives:
//!
//! - **SQLite** ([`SqliteStateStore`]): optimistic token. The reserve is one
//!   `UPDATE ... WHERE is_available = 1`; the affected-row count is the
//!   compare-and-swap result. No transaction spans a read and a write.
//! - **PostgreSQL** ([`PgStateStore`]): native row locking. The reserve runs
//!   `SELECT ... FOR UPDATE NOWAIT` and the flip in one transaction; a held
//!   row lock fails fast (`55P03`) and is reported as
//!   [`ReserveOutcome::Busy`] rather than blocking the pool.
//!
//! `reserved_at` is stored as UNIX epoch seconds in SQLite (integer column)
//! and as `TIMESTAMPTZ` in Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::config::LockConfig;
use crate::error::{LockError, LockResult};
use crate::model::{HolderIdentity, PrinterState};
use crate::provider::Provider;
use crate::store::{PrinterStateStore, ReserveOutcome};

#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
use sqlx::Row;

fn integrity_check(state: PrinterState) -> LockResult<PrinterState> {
    if state.invariant_holds() {
        Ok(state)
    } else {
        Err(LockError::IntegrityViolation {
            printer: state.printer_name.clone(),
            detail: "availability flag disagrees with reservation fields".to_string(),
        })
    }
}

/// SQLite-backed store using the optimistic-token strategy.
#[cfg(feature = "sqlite-backend")]
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: sqlx::SqlitePool,
    reserve_sql: &'static str,
}

#[cfg(feature = "sqlite-backend")]
impl SqliteStateStore {
    /// Wrap an existing pool. The schema must already exist; see
    /// [`SchemaManager`](crate::schema::SqliteSchemaManager).
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        let provider = Provider::Sqlite { url: String::new() };
        Self {
            pool,
            // The closed provider set guarantees this statement exists.
            reserve_sql: provider.reserve_sql().unwrap_or_default(),
        }
    }

    /// Connect a pool for `provider` and wrap it.
    pub async fn connect(provider: &Provider, config: &LockConfig) -> LockResult<Self> {
        let pool = provider.connect_sqlite(config).await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool, for schema management and diagnostics.
    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    fn state_from_row(row: &sqlx::sqlite::SqliteRow) -> LockResult<PrinterState> {
        let reserved_at: Option<i64> = row.get("reserved_at");
        let reserved_at = reserved_at
            .map(|secs| {
                DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                    LockError::Backend(format!("invalid reserved_at timestamp: {secs}"))
                })
            })
            .transpose()?;
        let is_available: i64 = row.get("is_available");
        integrity_check(PrinterState {
            id: row.get("id"),
            printer_name: row.get("printer_name"),
            is_available: is_available != 0,
            reserved_by: row.get("reserved_by"),
            reserved_at,
            process_id: row.get("process_id"),
            machine_name: row.get("machine_name"),
            version: row.get("version"),
        })
    }
}

#[cfg(feature = "sqlite-backend")]
#[async_trait]
impl PrinterStateStore for SqliteStateStore {
    async fn get_available_printers(&self) -> LockResult<Vec<PrinterState>> {
        let rows = sqlx::query(
            r#"SELECT id, printer_name, is_available, reserved_by, reserved_at,
                      process_id, machine_name, version
               FROM printer_states
               WHERE is_available = 1
               ORDER BY printer_name"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("select available printers: {e}")))?;

        rows.iter().map(Self::state_from_row).collect()
    }

    async fn get_printer(&self, name: &str) -> LockResult<Option<PrinterState>> {
        let row = sqlx::query(
            r#"SELECT id, printer_name, is_available, reserved_by, reserved_at,
                      process_id, machine_name, version
               FROM printer_states WHERE printer_name = ?1"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("select printer: {e}")))?;

        row.as_ref().map(Self::state_from_row).transpose()
    }

    #[instrument(skip(self, holder), fields(printer = %name, holder = %holder.reserved_by))]
    async fn try_reserve(
        &self,
        name: &str,
        holder: &HolderIdentity,
        reserved_at: DateTime<Utc>,
    ) -> LockResult<ReserveOutcome> {
        let result = sqlx::query(self.reserve_sql)
            .bind(&holder.reserved_by)
            .bind(reserved_at.timestamp())
            .bind(holder.process_id)
            .bind(&holder.machine_name)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Backend(format!("reserve printer: {e}")))?;

        if result.rows_affected() == 1 {
            debug!("reserved printer");
            Ok(ReserveOutcome::Reserved)
        } else {
            Ok(ReserveOutcome::Unavailable)
        }
    }

    #[instrument(skip(self, holder), fields(printer = %name, force = holder.is_none()))]
    async fn release(&self, name: &str, holder: Option<&HolderIdentity>) -> LockResult<bool> {
        let result = match holder {
            Some(holder) => sqlx::query(
                r#"UPDATE printer_states
                   SET is_available = 1, reserved_by = NULL, reserved_at = NULL,
                       process_id = NULL, machine_name = NULL, version = version + 1
                   WHERE printer_name = ?1 AND is_available = 0
                     AND reserved_by = ?2 AND process_id = ?3 AND machine_name = ?4"#,
            )
            .bind(name)
            .bind(&holder.reserved_by)
            .bind(holder.process_id)
            .bind(&holder.machine_name)
            .execute(&self.pool)
            .await,
            None => sqlx::query(
                r#"UPDATE printer_states
                   SET is_available = 1, reserved_by = NULL, reserved_at = NULL,
                       process_id = NULL, machine_name = NULL, version = version + 1
                   WHERE printer_name = ?1 AND is_available = 0"#,
            )
            .bind(name)
            .execute(&self.pool)
            .await,
        }
        .map_err(|e| LockError::Backend(format!("release printer: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> LockResult<u64> {
        let result = sqlx::query(
            r#"UPDATE printer_states
               SET is_available = 1, reserved_by = NULL, reserved_at = NULL,
                   process_id = NULL, machine_name = NULL, version = version + 1
               WHERE is_available = 0 AND reserved_at < ?1"#,
        )
        .bind(cutoff.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("cleanup expired reservations: {e}")))?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed stale reservations");
        }
        Ok(reclaimed)
    }

    async fn insert_printer(&self, name: &str) -> LockResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO printer_states (printer_name) VALUES (?1)
               ON CONFLICT(printer_name) DO NOTHING"#,
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("insert printer: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_printers(&self) -> LockResult<u64> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS cnt FROM printer_states"#)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LockError::Backend(format!("count printers: {e}")))?;
        let count: i64 = row.get("cnt");
        Ok(count as u64)
    }
}

/// PostgreSQL-backed store using `FOR UPDATE NOWAIT` row locking.
#[cfg(feature = "postgres-backend")]
#[derive(Clone)]
pub struct PgStateStore {
    pool: sqlx::PgPool,
    reserve_select_sql: &'static str,
}

#[cfg(feature = "postgres-backend")]
impl PgStateStore {
    /// Wrap an existing pool. The schema must already exist; see
    /// [`SchemaManager`](crate::schema::PgSchemaManager).
    pub fn new(pool: sqlx::PgPool) -> Self {
        let provider = Provider::Postgres { url: String::new() };
        Self {
            pool,
            reserve_select_sql: provider.reserve_sql().unwrap_or_default(),
        }
    }

    /// Connect a pool for `provider` and wrap it.
    pub async fn connect(provider: &Provider, config: &LockConfig) -> LockResult<Self> {
        let pool = provider.connect_postgres(config).await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool, for schema management and diagnostics.
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    fn state_from_row(row: &sqlx::postgres::PgRow) -> LockResult<PrinterState> {
        integrity_check(PrinterState {
            id: row.get("id"),
            printer_name: row.get("printer_name"),
            is_available: row.get("is_available"),
            reserved_by: row.get("reserved_by"),
            reserved_at: row.get("reserved_at"),
            process_id: row.get("process_id"),
            machine_name: row.get("machine_name"),
            version: row.get("version"),
        })
    }

    /// `55P03 lock_not_available`: the NOWAIT fail-fast signal.
    fn is_lock_not_available(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("55P03")
        )
    }
}

#[cfg(feature = "postgres-backend")]
#[async_trait]
impl PrinterStateStore for PgStateStore {
    async fn get_available_printers(&self) -> LockResult<Vec<PrinterState>> {
        let rows = sqlx::query(
            r#"SELECT id, printer_name, is_available, reserved_by, reserved_at,
                      process_id, machine_name, version
               FROM printer_states
               WHERE is_available = TRUE
               ORDER BY printer_name"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("select available printers: {e}")))?;

        rows.iter().map(Self::state_from_row).collect()
    }

    async fn get_printer(&self, name: &str) -> LockResult<Option<PrinterState>> {
        let row = sqlx::query(
            r#"SELECT id, printer_name, is_available, reserved_by, reserved_at,
                      process_id, machine_name, version
               FROM printer_states WHERE printer_name = $1"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("select printer: {e}")))?;

        row.as_ref().map(Self::state_from_row).transpose()
    }

    #[instrument(skip(self, holder), fields(printer = %name, holder = %holder.reserved_by))]
    async fn try_reserve(
        &self,
        name: &str,
        holder: &HolderIdentity,
        reserved_at: DateTime<Utc>,
    ) -> LockResult<ReserveOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::Backend(format!("begin tx: {e}")))?;

        // Take the row lock, failing fast if another transaction holds it.
        let locked_row = match sqlx::query(self.reserve_select_sql)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row,
            Err(e) if Self::is_lock_not_available(&e) => {
                debug!("row lock held by another transaction");
                return Ok(ReserveOutcome::Busy);
            }
            Err(e) => return Err(LockError::Backend(format!("select for update: {e}"))),
        };

        let id: i64 = match locked_row {
            Some(row) => row.get("id"),
            None => return Ok(ReserveOutcome::Unavailable),
        };

        let result = sqlx::query(
            r#"UPDATE printer_states
               SET is_available = FALSE, reserved_by = $1, reserved_at = $2,
                   process_id = $3, machine_name = $4, version = version + 1
               WHERE id = $5 AND is_available = TRUE"#,
        )
        .bind(&holder.reserved_by)
        .bind(reserved_at)
        .bind(holder.process_id)
        .bind(&holder.machine_name)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::Backend(format!("reserve printer: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| LockError::Backend(format!("commit tx: {e}")))?;

        if result.rows_affected() == 1 {
            debug!("reserved printer");
            Ok(ReserveOutcome::Reserved)
        } else {
            Ok(ReserveOutcome::Unavailable)
        }
    }

    #[instrument(skip(self, holder), fields(printer = %name, force = holder.is_none()))]
    async fn release(&self, name: &str, holder: Option<&HolderIdentity>) -> LockResult<bool> {
        let result = match holder {
            Some(holder) => sqlx::query(
                r#"UPDATE printer_states
                   SET is_available = TRUE, reserved_by = NULL, reserved_at = NULL,
                       process_id = NULL, machine_name = NULL, version = version + 1
                   WHERE printer_name = $1 AND is_available = FALSE
                     AND reserved_by = $2 AND process_id = $3 AND machine_name = $4"#,
            )
            .bind(name)
            .bind(&holder.reserved_by)
            .bind(holder.process_id)
            .bind(&holder.machine_name)
            .execute(&self.pool)
            .await,
            None => sqlx::query(
                r#"UPDATE printer_states
                   SET is_available = TRUE, reserved_by = NULL, reserved_at = NULL,
                       process_id = NULL, machine_name = NULL, version = version + 1
                   WHERE printer_name = $1 AND is_available = FALSE"#,
            )
            .bind(name)
            .execute(&self.pool)
            .await,
        }
        .map_err(|e| LockError::Backend(format!("release printer: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> LockResult<u64> {
        let result = sqlx::query(
            r#"UPDATE printer_states
               SET is_available = TRUE, reserved_by = NULL, reserved_at = NULL,
                   process_id = NULL, machine_name = NULL, version = version + 1
               WHERE is_available = FALSE AND reserved_at < $1"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("cleanup expired reservations: {e}")))?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed stale reservations");
        }
        Ok(reclaimed)
    }

    async fn insert_printer(&self, name: &str) -> LockResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO printer_states (printer_name) VALUES ($1)
               ON CONFLICT (printer_name) DO NOTHING"#,
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("insert printer: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_printers(&self) -> LockResult<u64> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS cnt FROM printer_states"#)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LockError::Backend(format!("count printers: {e}")))?;
        let count: i64 = row.get("cnt");
        Ok(count as u64)
    }
}
