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

//! Convenience layer: scoped acquisition, reservation ids, fleet bootstrap.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};
use ulid::Ulid;

use crate::error::{LockError, LockResult};
use crate::model::{HolderIdentity, PrinterReservation, ReservationState};
use crate::service::PrinterLockService;
use crate::store::PrinterStateStore;

/// Scoped acquisition: acquire `printer_name`, run `action` with it, and
/// release on every exit path before returning or propagating the error.
///
/// Fails with [`LockError::Unavailable`] when no lock can be obtained; use
/// [`try_with_printer_lock`] to treat contention as a value instead.
pub async fn with_printer_lock<F, Fut, T>(
    service: &PrinterLockService,
    printer_name: &str,
    duration: Option<Duration>,
    action: F,
) -> LockResult<T>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = LockResult<T>>,
{
    let lock = service
        .try_acquire_lock(printer_name, duration)
        .await?
        .ok_or_else(|| LockError::Unavailable(printer_name.to_string()))?;

    let result = action(lock.printer_name.clone()).await;
    // Release regardless of the action's outcome; release never fails.
    service.release_lock(&lock.lock_id).await;
    result
}

/// Non-throwing variant of [`with_printer_lock`]: returns `Ok(None)` when
/// the lock cannot be obtained, `Ok(Some(value))` when the action ran.
/// Errors from the action itself still propagate, after release.
pub async fn try_with_printer_lock<F, Fut, T>(
    service: &PrinterLockService,
    printer_name: &str,
    duration: Option<Duration>,
    action: F,
) -> LockResult<Option<T>>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = LockResult<T>>,
{
    let Some(lock) = service.try_acquire_lock(printer_name, duration).await? else {
        return Ok(None);
    };

    let result = action(lock.printer_name.clone()).await;
    service.release_lock(&lock.lock_id).await;
    result.map(Some)
}

/// Generate a reservation id unique across machines without central
/// coordination: host identity, process identity, and a Ulid (millisecond
/// timestamp plus randomness).
pub fn generate_reservation_id() -> String {
    let identity = HolderIdentity::current("");
    format!(
        "{}-{}-{}",
        identity.machine_name,
        identity.process_id,
        Ulid::new()
    )
}

/// Bootstrap the default fleet: insert any of `names` not already present.
/// Idempotent; existing rows (and their reservation state) are untouched.
/// Returns the number of rows created.
#[instrument(skip(store, names))]
pub async fn ensure_default_fleet(
    store: &dyn PrinterStateStore,
    names: &[String],
) -> LockResult<u64> {
    let mut created = 0u64;
    for name in names {
        if store.insert_printer(name).await? {
            created += 1;
        }
    }
    if created > 0 {
        debug!(created, "bootstrapped printer fleet");
    }
    Ok(created)
}

/// Open a saga record for a multi-step workflow against a reserved printer.
pub fn begin_reservation(
    reservation_id: impl Into<String>,
    session_id: impl Into<String>,
    printer_name: impl Into<String>,
) -> PrinterReservation {
    PrinterReservation {
        reservation_id: reservation_id.into(),
        session_id: session_id.into(),
        printer_name: printer_name.into(),
        process_id: std::process::id() as i64,
        state: ReservationState::Reserved,
        created_at: Utc::now(),
    }
}
