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

//! Lock service tests over the in-memory backend.
//!
//! These verify the service-level properties:
//! - Mutual exclusion under concurrent acquisition
//! - Idempotent, no-fail release
//! - Ordered-preference-then-fallback reservation
//! - Expiry-driven reclamation of abandoned locks
//! - Consistency of every row after arbitrary operation sequences

#[cfg(feature = "memory-backend")]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use printer_locks::{
        config::LockConfig,
        facade,
        model::{HolderIdentity, PrinterState},
        provider::Provider,
        service::PrinterLockService,
        store::{memory::MemoryStateStore, PrinterStateStore, ReserveOutcome},
        LockError, LockResult,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn service_with_fleet(fleet: &[&str]) -> PrinterLockService {
        let config = LockConfig {
            connection_string: None,
            default_fleet: fleet.iter().map(|s| s.to_string()).collect(),
            ..LockConfig::default()
        };
        let store = Arc::new(MemoryStateStore::new());
        facade::ensure_default_fleet(store.as_ref(), &config.default_fleet)
            .await
            .unwrap();
        PrinterLockService::new(store, &Provider::InMemory, config)
    }

    #[tokio::test]
    async fn acquire_and_release_round_trip() {
        let service = service_with_fleet(&["PDF24", "PDFCreator"]).await;

        let lock = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();
        assert_eq!(lock.printer_name, "PDF24");
        assert!(lock.is_active_now());
        assert_eq!(service.active_locks().len(), 1);

        assert!(service.release_lock(&lock.lock_id).await);
        assert!(service.active_locks().is_empty());

        let row = service.store().get_printer("PDF24").await.unwrap().unwrap();
        assert!(row.is_available);
        assert!(row.invariant_holds());
    }

    #[tokio::test]
    async fn contention_is_a_value_not_an_error() {
        let service = service_with_fleet(&["PDF24"]).await;
        let _held = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();

        let second = service.try_acquire_lock("PDF24", None).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let service = service_with_fleet(&["PDF24"]).await;
        let lock = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();

        assert!(service.release_lock(&lock.lock_id).await);
        // Second release of the same id: no-op, no panic, no error.
        assert!(!service.release_lock(&lock.lock_id).await);
        // Unknown id: same.
        assert!(!service.release_lock("no-such-lock").await);
    }

    #[tokio::test]
    async fn release_of_expired_lock_is_a_noop() {
        let mut config = LockConfig::default();
        config.max_lock_duration = Duration::from_secs(1);
        let store = Arc::new(MemoryStateStore::new());
        facade::ensure_default_fleet(store.as_ref(), &["PDF24".to_string()])
            .await
            .unwrap();
        let service = PrinterLockService::new(store, &Provider::InMemory, config);

        let lock = service
            .try_acquire_lock("PDF24", Some(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();

        sleep(Duration::from_secs(2)).await;
        service.cleanup_expired_reservations().await.unwrap();

        // The printer was reclaimed and could belong to someone else now;
        // releasing the stale lock must not fail or steal it back.
        let other = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();
        assert!(!service.release_lock(&lock.lock_id).await);

        let row = service.store().get_printer("PDF24").await.unwrap().unwrap();
        assert!(!row.is_available);
        assert_eq!(row.reserved_by.as_deref(), Some(other.reserved_by.as_str()));
    }

    #[tokio::test]
    async fn oversized_lease_clamps_instead_of_panicking() {
        let service = service_with_fleet(&["PDF24"]).await;

        let lock = service
            .try_acquire_lock("PDF24", Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(lock.is_active_now());

        // Still releasable like any other lock; the row is not leaked.
        assert!(service.release_lock(&lock.lock_id).await);
        let row = service.store().get_printer("PDF24").await.unwrap().unwrap();
        assert!(row.is_available);
    }

    #[tokio::test]
    async fn oversized_max_lock_duration_reclaims_nothing() {
        let mut config = LockConfig::default();
        config.max_lock_duration = Duration::from_secs(u64::MAX);
        let store = Arc::new(MemoryStateStore::new());
        facade::ensure_default_fleet(store.as_ref(), &["PDF24".to_string()])
            .await
            .unwrap();
        let service = PrinterLockService::new(store, &Provider::InMemory, config);

        let _held = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();
        assert_eq!(service.cleanup_expired_reservations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mutual_exclusion_under_concurrent_acquisition() {
        let service = Arc::new(service_with_fleet(&["PDF24"]).await);
        let mut handles = vec![];
        for _ in 0..20 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.try_acquire_lock("PDF24", None).await.unwrap()
            }));
        }

        let mut winners = vec![];
        for handle in handles {
            if let Some(lock) = handle.await.unwrap() {
                winners.push(lock);
            }
        }
        assert_eq!(winners.len(), 1);

        // After release, the printer is acquirable again.
        service.release_lock(&winners[0].lock_id).await;
        assert!(service.try_acquire_lock("PDF24", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ordered_preference_is_honored() {
        let service = service_with_fleet(&["A", "B"]).await;

        // Both available: the first preferred name wins.
        let lock = service
            .try_reserve_any_available_printer("r1", &["B", "A"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.printer_name, "B");
        service.release_lock(&lock.lock_id).await;

        // Only "A" available: falls through to it.
        let _b = service.try_acquire_lock("B", None).await.unwrap().unwrap();
        let lock = service
            .try_reserve_any_available_printer("r2", &["B", "A"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.printer_name, "A");
        service.release_lock(&lock.lock_id).await;

        // None available: failure, not an error.
        let _a = service.try_acquire_lock("A", None).await.unwrap().unwrap();
        let none = service
            .try_reserve_any_available_printer("r3", &["B", "A"])
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn fallback_covers_printers_outside_the_preferred_list() {
        let service = service_with_fleet(&["PDF24", "PDFCreator", "Archive"]).await;
        let _p1 = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();
        let _p2 = service.try_acquire_lock("PDFCreator", None).await.unwrap().unwrap();

        let lock = service
            .try_reserve_any_available_printer("r1", &["PDF24", "PDFCreator"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.printer_name, "Archive");
        assert_eq!(lock.reserved_by, "r1");
    }

    /// Two callers share the fleet; a release frees the printer for a third.
    #[tokio::test]
    async fn two_caller_fleet_scenario() {
        let service = service_with_fleet(&["PDF24", "PDFCreator"]).await;

        // Caller 1 reserves PDF24.
        let l1 = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();

        // Caller 2 asks for any of the fleet and must get PDFCreator.
        let l2 = service
            .try_reserve_any_available_printer("caller-2", &["PDF24", "PDFCreator"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(l2.printer_name, "PDFCreator");

        // Caller 1 releases; PDF24 is available again for a third caller.
        service.release_lock(&l1.lock_id).await;
        let l3 = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();
        assert_eq!(l3.printer_name, "PDF24");
    }

    /// A holder that never releases (crash, kill) loses its reservation to
    /// the cleanup sweep once the maximum lock duration has passed.
    #[tokio::test]
    async fn crashed_holder_is_reclaimed_by_cleanup() {
        let mut config = LockConfig::default();
        config.max_lock_duration = Duration::from_secs(1);
        let store = Arc::new(MemoryStateStore::new());
        facade::ensure_default_fleet(store.as_ref(), &["PDF24".to_string()])
            .await
            .unwrap();
        let service = PrinterLockService::new(store, &Provider::InMemory, config);

        let lock = service
            .try_acquire_lock("PDF24", Some(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();

        sleep(Duration::from_secs(2)).await;
        assert!(!lock.is_active_now());

        let reclaimed = service.cleanup_expired_reservations().await.unwrap();
        assert_eq!(reclaimed, 1);

        let row = service.store().get_printer("PDF24").await.unwrap().unwrap();
        assert!(row.is_available);
        assert!(row.invariant_holds());
        assert!(service.try_acquire_lock("PDF24", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_leaves_fresh_reservations_alone() {
        let service = service_with_fleet(&["PDF24", "PDFCreator"]).await;
        let _held = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();

        // Default max lock duration is minutes; nothing is stale yet.
        assert_eq!(service.cleanup_expired_reservations().await.unwrap(), 0);
        let row = service.store().get_printer("PDF24").await.unwrap().unwrap();
        assert!(!row.is_available);
    }

    #[tokio::test]
    async fn every_row_satisfies_invariant_after_mixed_operations() {
        let service = service_with_fleet(&["A", "B", "C"]).await;

        let a = service.try_acquire_lock("A", None).await.unwrap().unwrap();
        let _b = service.try_acquire_lock("B", None).await.unwrap().unwrap();
        service.release_lock(&a.lock_id).await;
        service.force_release_printer("B").await.unwrap();
        service.cleanup_expired_reservations().await.unwrap();
        let _c = service.try_acquire_lock("C", None).await.unwrap().unwrap();

        for name in ["A", "B", "C"] {
            let row: PrinterState =
                service.store().get_printer(name).await.unwrap().unwrap();
            assert!(row.invariant_holds(), "invariant broken for {}", name);
        }
    }

    #[tokio::test]
    async fn with_printer_lock_releases_on_success_and_failure() {
        let service = service_with_fleet(&["PDF24"]).await;

        let printed = facade::with_printer_lock(&service, "PDF24", None, |printer| async move {
            Ok(format!("printed via {}", printer))
        })
        .await
        .unwrap();
        assert_eq!(printed, "printed via PDF24");

        // Action failure still releases the printer before propagating.
        let result: LockResult<()> =
            facade::with_printer_lock(&service, "PDF24", None, |_printer| async move {
                Err(LockError::Backend("export pipeline crashed".to_string()))
            })
            .await;
        assert!(matches!(result, Err(LockError::Backend(_))));

        let row = service.store().get_printer("PDF24").await.unwrap().unwrap();
        assert!(row.is_available);
    }

    #[tokio::test]
    async fn with_printer_lock_signals_unavailable() {
        let service = service_with_fleet(&["PDF24"]).await;
        let _held = service.try_acquire_lock("PDF24", None).await.unwrap().unwrap();

        let result =
            facade::with_printer_lock(&service, "PDF24", None, |_p| async move { Ok(()) }).await;
        assert!(matches!(result, Err(LockError::Unavailable(_))));

        let ran = facade::try_with_printer_lock(&service, "PDF24", None, |_p| async move {
            Ok(())
        })
        .await
        .unwrap();
        assert!(ran.is_none());
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let store = Arc::new(MemoryStateStore::new());
        let fleet: Vec<String> = vec!["PDF24".to_string(), "PDFCreator".to_string()];
        assert_eq!(facade::ensure_default_fleet(store.as_ref(), &fleet).await.unwrap(), 2);
        assert_eq!(facade::ensure_default_fleet(store.as_ref(), &fleet).await.unwrap(), 0);
        assert_eq!(store.count_printers().await.unwrap(), 2);
    }

    /// A store whose backend is unreachable: every operation fails. Used to
    /// verify that connectivity problems surface as errors, distinct from
    /// contention, after the retry budget is spent.
    struct UnreachableStore;

    #[async_trait]
    impl PrinterStateStore for UnreachableStore {
        async fn get_available_printers(&self) -> LockResult<Vec<PrinterState>> {
            Err(LockError::Backend("connection refused".to_string()))
        }
        async fn get_printer(&self, _name: &str) -> LockResult<Option<PrinterState>> {
            Err(LockError::Backend("connection refused".to_string()))
        }
        async fn try_reserve(
            &self,
            _name: &str,
            _holder: &HolderIdentity,
            _reserved_at: DateTime<Utc>,
        ) -> LockResult<ReserveOutcome> {
            Err(LockError::Backend("connection refused".to_string()))
        }
        async fn release(
            &self,
            _name: &str,
            _holder: Option<&HolderIdentity>,
        ) -> LockResult<bool> {
            Err(LockError::Backend("connection refused".to_string()))
        }
        async fn cleanup_expired(&self, _cutoff: DateTime<Utc>) -> LockResult<u64> {
            Err(LockError::Backend("connection refused".to_string()))
        }
        async fn insert_printer(&self, _name: &str) -> LockResult<bool> {
            Err(LockError::Backend("connection refused".to_string()))
        }
        async fn count_printers(&self) -> LockResult<u64> {
            Err(LockError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn connectivity_failure_is_an_error_not_contention() {
        let mut config = LockConfig::default();
        config.max_retry_attempts = 1;
        let service =
            PrinterLockService::new(Arc::new(UnreachableStore), &Provider::InMemory, config);

        let result = service.try_acquire_lock("PDF24", None).await;
        assert!(matches!(result, Err(LockError::Backend(_))));

        // Release still never fails, even with the backend down.
        assert!(!service.release_lock("some-lock").await);
    }
}
