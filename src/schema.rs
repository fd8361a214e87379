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

//! Schema management: administrator-invoked DDL, separate from the runtime
//! query path.
//!
//! `create_printer_management_schema` runs every DDL statement inside one
//! transaction; on any failure the transaction rolls back and no partial
//! schema is left behind. Every statement is `IF NOT EXISTS`-idempotent, so
//! a concurrent first run cannot fail the race. `validate_schema` is
//! read-only and safe to call repeatedly and concurrently.
//!
//! Schema operations are allowed to return errors to the operator; they are
//! never on the automated reservation hot path.

#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
use tracing::{info, instrument};

#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
use crate::error::{LockError, LockResult};
#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
use crate::provider::Provider;

/// Columns `validate_schema` requires on `printer_states`.
pub const REQUIRED_COLUMNS: [&str; 8] = [
    "id",
    "printer_name",
    "is_available",
    "reserved_by",
    "reserved_at",
    "process_id",
    "machine_name",
    "version",
];

/// Result of a read-only schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    /// Whether the `printer_states` table exists.
    pub table_exists: bool,
    /// Required columns absent from the table. Empty when the table is
    /// missing entirely.
    pub missing_columns: Vec<String>,
}

impl SchemaReport {
    /// Pass/fail verdict.
    pub fn is_valid(&self) -> bool {
        self.table_exists && self.missing_columns.is_empty()
    }

    /// Build a report from the column names found on an existing table.
    pub fn from_columns(found: &[String]) -> Self {
        let missing_columns = REQUIRED_COLUMNS
            .iter()
            .filter(|col| !found.iter().any(|f| f == *col))
            .map(|col| col.to_string())
            .collect();
        Self {
            table_exists: true,
            missing_columns,
        }
    }
}

/// SQLite schema manager.
#[cfg(feature = "sqlite-backend")]
pub struct SqliteSchemaManager {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "sqlite-backend")]
impl SqliteSchemaManager {
    /// Bind to an existing pool.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `printer_states` table, constraints, and indexes.
    ///
    /// Integrity constraints (unique name, non-empty name,
    /// reservation-consistency CHECK) are named inline in the CREATE TABLE
    /// because SQLite cannot attach them afterwards; the stale-scan index is
    /// a separate statement in the same transaction.
    #[instrument(skip(self))]
    pub async fn create_printer_management_schema(&self) -> LockResult<()> {
        let provider = Provider::Sqlite { url: String::new() };
        let create_table = provider
            .create_table_sql()
            .ok_or_else(|| LockError::Schema("no DDL for sqlite provider".to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::Schema(format!("begin DDL tx: {e}")))?;

        sqlx::query(create_table)
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Schema(format!("create printer_states table: {e}")))?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_printer_states_stale
               ON printer_states (reserved_at)
               WHERE is_available = 0"#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::Schema(format!("create stale-scan index: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| LockError::Schema(format!("commit DDL tx: {e}")))?;

        info!("printer management schema ready");
        Ok(())
    }

    /// Read-only check: table present, required columns present.
    pub async fn validate_schema(&self) -> LockResult<SchemaReport> {
        use sqlx::Row;

        let table = sqlx::query(
            r#"SELECT name FROM sqlite_master
               WHERE type = 'table' AND name = 'printer_states'"#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::Schema(format!("probe table existence: {e}")))?;

        if table.is_none() {
            return Ok(SchemaReport {
                table_exists: false,
                missing_columns: Vec::new(),
            });
        }

        let columns: Vec<String> =
            sqlx::query(r#"SELECT name FROM pragma_table_info('printer_states')"#)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| LockError::Schema(format!("probe table columns: {e}")))?
                .iter()
                .map(|row| row.get::<String, _>("name"))
                .collect();

        Ok(SchemaReport::from_columns(&columns))
    }
}

/// PostgreSQL schema manager.
#[cfg(feature = "postgres-backend")]
pub struct PgSchemaManager {
    pool: sqlx::PgPool,
}

#[cfg(feature = "postgres-backend")]
impl PgSchemaManager {
    /// Bind to an existing pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Create the `printer_states` table, constraints, and indexes.
    #[instrument(skip(self))]
    pub async fn create_printer_management_schema(&self) -> LockResult<()> {
        let provider = Provider::Postgres { url: String::new() };
        let create_table = provider
            .create_table_sql()
            .ok_or_else(|| LockError::Schema("no DDL for postgres provider".to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::Schema(format!("begin DDL tx: {e}")))?;

        sqlx::query(create_table)
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Schema(format!("create printer_states table: {e}")))?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_printer_states_stale
               ON printer_states (reserved_at)
               WHERE is_available = FALSE"#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::Schema(format!("create stale-scan index: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| LockError::Schema(format!("commit DDL tx: {e}")))?;

        info!("printer management schema ready");
        Ok(())
    }

    /// Read-only check: table present, required columns present.
    pub async fn validate_schema(&self) -> LockResult<SchemaReport> {
        use sqlx::Row;

        let columns: Vec<String> = sqlx::query(
            r#"SELECT column_name FROM information_schema.columns
               WHERE table_name = 'printer_states'"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LockError::Schema(format!("probe table columns: {e}")))?
        .iter()
        .map(|row| row.get::<String, _>("column_name"))
        .collect();

        if columns.is_empty() {
            return Ok(SchemaReport {
                table_exists: false,
                missing_columns: Vec::new(),
            });
        }

        Ok(SchemaReport::from_columns(&columns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_flags_missing_columns() {
        let found: Vec<String> = ["id", "printer_name", "is_available"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = SchemaReport::from_columns(&found);
        assert!(report.table_exists);
        assert!(!report.is_valid());
        assert!(report.missing_columns.contains(&"version".to_string()));
    }

    #[test]
    fn report_passes_complete_schema() {
        let found: Vec<String> = REQUIRED_COLUMNS.iter().map(|s| s.to_string()).collect();
        assert!(SchemaReport::from_columns(&found).is_valid());
    }
}
