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

//! Reservation/lock service: the per-printer state machine.
//!
//! ## State machine
//! From the caller's perspective each printer moves
//! **Free → Reserved → Free**, either by explicit release or by the expiry
//! sweep when the holder never releases (crash, forgotten release). No
//! other states are reachable.
//!
//! ## Contracts
//! - Contention is a normal return value (`Ok(None)`), never an error.
//! - Under racing acquisitions for one printer, exactly one caller wins;
//!   the losers observe failure without having mutated anything. The
//!   backend's atomic compare-and-set is the sole serialization point.
//! - [`release_lock`](PrinterLockService::release_lock) never fails:
//!   releasing an unknown, already-released, or expired lock is a no-op, so
//!   callers can release unconditionally on every exit path.
//! - Backend errors are retried up to the configured budget, then surfaced
//!   as `Err`, distinguishable from contention.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};
use ulid::Ulid;

use crate::config::LockConfig;
use crate::error::{LockError, LockResult};
use crate::model::{HolderIdentity, PrinterLock};
use crate::provider::Provider;
use crate::store::{PrinterStateStore, ReserveOutcome};

/// Base delay between retries of a busy row lock or a transient backend
/// failure; scaled linearly by attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

struct IssuedLock {
    lock: PrinterLock,
    holder: HolderIdentity,
}

/// Lock service over a printer state store.
///
/// The service keeps a process-local registry of the locks it issued, keyed
/// by lock id; that registry is what makes release-by-id idempotent. Locks
/// issued by other processes are reclaimed exclusively through
/// [`cleanup_expired_reservations`](Self::cleanup_expired_reservations).
pub struct PrinterLockService {
    store: Arc<dyn PrinterStateStore>,
    config: LockConfig,
    holder: HolderIdentity,
    /// Provider capability: when the backend serializes with a native row
    /// lock, a busy row may free up momentarily and is worth a short
    /// bounded retry. Optimistic backends never report busy.
    row_level_locking: bool,
    issued: Mutex<HashMap<String, IssuedLock>>,
}

impl PrinterLockService {
    /// Build a service over `store`, taking the retry-vs-fail-fast policy
    /// from the provider's locking capability.
    pub fn new(store: Arc<dyn PrinterStateStore>, provider: &Provider, config: LockConfig) -> Self {
        Self {
            row_level_locking: provider.supports_row_level_locking(),
            store,
            config,
            holder: HolderIdentity::current("printer-locks"),
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the default holder identity (the tag recorded in reserved
    /// rows).
    pub fn with_holder(mut self, holder: HolderIdentity) -> Self {
        self.holder = holder;
        self
    }

    /// The store this service operates on.
    pub fn store(&self) -> Arc<dyn PrinterStateStore> {
        Arc::clone(&self.store)
    }

    /// The active configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// The identity recorded as holder for direct acquisitions.
    pub fn holder(&self) -> &HolderIdentity {
        &self.holder
    }

    fn issued(&self) -> MutexGuard<'_, HashMap<String, IssuedLock>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Caller-supplied durations can exceed what `chrono` represents;
    /// clamp rather than panic. The paired datetime arithmetic clamps too.
    fn lease_duration(&self, duration: Option<Duration>) -> chrono::Duration {
        let lease = duration.unwrap_or(self.config.default_lease);
        chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
    }

    /// Attempt the Free→Reserved transition for one named printer.
    ///
    /// Returns the lock with `expires_at = now + duration` on success and
    /// `Ok(None)` when the printer is unavailable. `duration` defaults to
    /// the configured lease.
    #[instrument(skip(self, duration), fields(printer = %printer_name))]
    pub async fn try_acquire_lock(
        &self,
        printer_name: &str,
        duration: Option<Duration>,
    ) -> LockResult<Option<PrinterLock>> {
        let holder = self.holder.clone();
        self.acquire_as(&holder, printer_name, duration).await
    }

    async fn acquire_as(
        &self,
        holder: &HolderIdentity,
        printer_name: &str,
        duration: Option<Duration>,
    ) -> LockResult<Option<PrinterLock>> {
        let lease = self.lease_duration(duration);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let now = Utc::now();
            match self.store.try_reserve(printer_name, holder, now).await {
                Ok(ReserveOutcome::Reserved) => {
                    let lock = PrinterLock {
                        printer_name: printer_name.to_string(),
                        lock_id: Ulid::new().to_string(),
                        reserved_by: holder.reserved_by.clone(),
                        reserved_at: now,
                        expires_at: now
                            .checked_add_signed(lease)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                        machine_name: holder.machine_name.clone(),
                    };
                    self.issued().insert(
                        lock.lock_id.clone(),
                        IssuedLock {
                            lock: lock.clone(),
                            holder: holder.clone(),
                        },
                    );
                    debug!(lock_id = %lock.lock_id, "acquired printer lock");
                    return Ok(Some(lock));
                }
                Ok(ReserveOutcome::Unavailable) => return Ok(None),
                Ok(ReserveOutcome::Busy) => {
                    if self.row_level_locking && attempt <= self.config.max_retry_attempts {
                        sleep(RETRY_BACKOFF * attempt).await;
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) if Self::is_transient(&e) && attempt <= self.config.max_retry_attempts => {
                    warn!(error = %e, attempt, "transient backend failure, retrying");
                    sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_transient(err: &LockError) -> bool {
        matches!(err, LockError::Backend(_))
    }

    /// Reserve the first obtainable printer: the preferred names in the
    /// given order first, then every available printer in the store's
    /// deterministic name order.
    ///
    /// This ordered-preference-then-fallback policy lets callers express
    /// "try the fast printer first, then anything". The reservation id is
    /// recorded as the holder tag on the reserved row.
    #[instrument(skip(self, preferred), fields(reservation = %reservation_id))]
    pub async fn try_reserve_any_available_printer<S: AsRef<str>>(
        &self,
        reservation_id: &str,
        preferred: &[S],
    ) -> LockResult<Option<PrinterLock>> {
        let holder = self.holder.retagged(reservation_id);

        for name in preferred {
            if let Some(lock) = self.acquire_as(&holder, name.as_ref(), None).await? {
                return Ok(Some(lock));
            }
        }

        // Fallback: anything currently available, in deterministic order.
        // Each candidate is still taken through the atomic reserve; the
        // listing is advisory only.
        for state in self.store.get_available_printers().await? {
            if let Some(lock) = self.acquire_as(&holder, &state.printer_name, None).await? {
                return Ok(Some(lock));
            }
        }

        debug!("no printer available");
        Ok(None)
    }

    /// Release a previously issued lock.
    ///
    /// Idempotent and infallible: unknown lock ids, repeated releases, and
    /// locks already reclaimed by expiry are all no-op successes. Backend
    /// failures are logged and swallowed; the expiry sweep will reclaim the
    /// row. Returns whether a row transition actually happened.
    #[instrument(skip(self), fields(lock_id = %lock_id))]
    pub async fn release_lock(&self, lock_id: &str) -> bool {
        let entry = self.issued().remove(lock_id);
        let Some(IssuedLock { lock, holder }) = entry else {
            debug!("unknown or already released lock id");
            return false;
        };

        if !lock.is_active_now() {
            // Expired locks follow the Reserved→Free-via-expiry transition;
            // the row may already belong to someone else. Leave it to the
            // cleanup sweep.
            debug!(printer = %lock.printer_name, "lock expired before release");
            return false;
        }

        match self.store.release(&lock.printer_name, Some(&holder)).await {
            Ok(true) => {
                debug!(printer = %lock.printer_name, "released printer lock");
                true
            }
            Ok(false) => {
                // Row already reclaimed or re-acquired by someone else.
                debug!(printer = %lock.printer_name, "lock already expired or superseded");
                false
            }
            Err(e) => {
                warn!(
                    error = %e,
                    printer = %lock.printer_name,
                    "release failed; the expiry sweep will reclaim the printer"
                );
                false
            }
        }
    }

    /// Reclaim every reservation older than the configured maximum lock
    /// duration, regardless of whether its holder is still alive. Returns
    /// the number of reclaimed printers.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_reservations(&self) -> LockResult<u64> {
        let cutoff = Utc::now()
            .checked_sub_signed(self.lease_duration(Some(self.config.max_lock_duration)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reclaimed = self.store.cleanup_expired(cutoff).await?;

        let now = Utc::now();
        self.issued().retain(|_, issued| issued.lock.is_active(now));
        Ok(reclaimed)
    }

    /// Locks issued by this process that have not been released and have
    /// not yet expired. Diagnostics only.
    pub fn active_locks(&self) -> Vec<PrinterLock> {
        let now = Utc::now();
        self.issued()
            .values()
            .filter(|issued| issued.lock.is_active(now))
            .map(|issued| issued.lock.clone())
            .collect()
    }

    /// Administrative force-release of a printer, ignoring holder identity.
    /// Operator intervention only; ordinary callers go through
    /// [`release_lock`](Self::release_lock).
    #[instrument(skip(self), fields(printer = %printer_name))]
    pub async fn force_release_printer(&self, printer_name: &str) -> LockResult<bool> {
        self.store.release(printer_name, None).await
    }
}

impl std::fmt::Debug for PrinterLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterLockService")
            .field("holder", &self.holder)
            .field("row_level_locking", &self.row_level_locking)
            .finish_non_exhaustive()
    }
}
