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

//! In-memory printer state store.
//!
//! ## Purpose
//! Single-process backend for tests and standalone runs. Backed by a
//! concurrent map whose per-key entry guards provide the compare-and-swap
//! primitive; reservations on distinct printer names never serialize
//! against each other through a global lock.
//!
//! ## Limitations
//! - Not persistent (state lost on restart)
//! - Not distributed (single process only)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::error::LockResult;
use crate::model::{HolderIdentity, PrinterState};
use crate::store::{PrinterStateStore, ReserveOutcome};

/// DashMap-backed store; per-key atomic read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    rows: DashMap<String, PrinterState>,
    next_id: AtomicI64,
}

impl MemoryStateStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    fn holder_matches(row: &PrinterState, holder: &HolderIdentity) -> bool {
        row.reserved_by.as_deref() == Some(holder.reserved_by.as_str())
            && row.process_id == Some(holder.process_id)
            && row.machine_name.as_deref() == Some(holder.machine_name.as_str())
    }

    fn reset_to_available(row: &mut PrinterState) {
        row.is_available = true;
        row.reserved_by = None;
        row.reserved_at = None;
        row.process_id = None;
        row.machine_name = None;
        row.version += 1;
        debug_assert!(row.invariant_holds());
    }
}

#[async_trait]
impl PrinterStateStore for MemoryStateStore {
    async fn get_available_printers(&self) -> LockResult<Vec<PrinterState>> {
        let mut available: Vec<PrinterState> = self
            .rows
            .iter()
            .filter(|entry| entry.value().is_available)
            .map(|entry| entry.value().clone())
            .collect();
        available.sort_by(|a, b| a.printer_name.cmp(&b.printer_name));
        Ok(available)
    }

    async fn get_printer(&self, name: &str) -> LockResult<Option<PrinterState>> {
        Ok(self.rows.get(name).map(|entry| entry.value().clone()))
    }

    async fn try_reserve(
        &self,
        name: &str,
        holder: &HolderIdentity,
        reserved_at: DateTime<Utc>,
    ) -> LockResult<ReserveOutcome> {
        // The entry guard serializes this read-modify-write per key.
        match self.rows.get_mut(name) {
            Some(mut entry) if entry.is_available => {
                let row = entry.value_mut();
                row.is_available = false;
                row.reserved_by = Some(holder.reserved_by.clone());
                row.reserved_at = Some(reserved_at);
                row.process_id = Some(holder.process_id);
                row.machine_name = Some(holder.machine_name.clone());
                row.version += 1;
                debug_assert!(row.invariant_holds());
                debug!(printer = name, holder = %holder.reserved_by, "reserved printer");
                Ok(ReserveOutcome::Reserved)
            }
            _ => Ok(ReserveOutcome::Unavailable),
        }
    }

    async fn release(&self, name: &str, holder: Option<&HolderIdentity>) -> LockResult<bool> {
        match self.rows.get_mut(name) {
            Some(mut entry) if !entry.is_available => {
                let row = entry.value_mut();
                if let Some(holder) = holder {
                    if !Self::holder_matches(row, holder) {
                        return Ok(false);
                    }
                }
                Self::reset_to_available(row);
                debug!(printer = name, "released printer");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> LockResult<u64> {
        let mut reclaimed = 0u64;
        for mut entry in self.rows.iter_mut() {
            let row = entry.value_mut();
            if !row.is_available && row.reserved_at.map(|at| at < cutoff).unwrap_or(false) {
                Self::reset_to_available(row);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed stale reservations");
        }
        Ok(reclaimed)
    }

    async fn insert_printer(&self, name: &str) -> LockResult<bool> {
        match self.rows.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                vacant.insert(PrinterState::new_available(id, name));
                Ok(true)
            }
        }
    }

    async fn count_printers(&self) -> LockResult<u64> {
        Ok(self.rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn holder(tag: &str) -> HolderIdentity {
        HolderIdentity {
            reserved_by: tag.to_string(),
            process_id: 1234,
            machine_name: "ws-01".to_string(),
        }
    }

    async fn seeded() -> MemoryStateStore {
        let store = MemoryStateStore::new();
        store.insert_printer("PDF24").await.unwrap();
        store.insert_printer("PDFCreator").await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_name() {
        let store = seeded().await;
        assert!(!store.insert_printer("PDF24").await.unwrap());
        assert_eq!(store.count_printers().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn available_printers_are_ordered_by_name() {
        let store = MemoryStateStore::new();
        store.insert_printer("PDFCreator").await.unwrap();
        store.insert_printer("PDF24").await.unwrap();
        let names: Vec<String> = store
            .get_available_printers()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.printer_name)
            .collect();
        assert_eq!(names, vec!["PDF24", "PDFCreator"]);
    }

    #[tokio::test]
    async fn reserve_flips_row_and_second_attempt_fails() {
        let store = seeded().await;
        let now = Utc::now();
        assert_eq!(
            store.try_reserve("PDF24", &holder("job-1"), now).await.unwrap(),
            ReserveOutcome::Reserved
        );
        assert_eq!(
            store.try_reserve("PDF24", &holder("job-2"), now).await.unwrap(),
            ReserveOutcome::Unavailable
        );
        let row = store.get_printer("PDF24").await.unwrap().unwrap();
        assert!(!row.is_available);
        assert!(row.invariant_holds());
        assert_eq!(row.reserved_by.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn reserve_unknown_printer_is_unavailable() {
        let store = seeded().await;
        assert_eq!(
            store
                .try_reserve("Ghostwriter", &holder("job-1"), Utc::now())
                .await
                .unwrap(),
            ReserveOutcome::Unavailable
        );
    }

    #[tokio::test]
    async fn release_requires_matching_holder() {
        let store = seeded().await;
        store
            .try_reserve("PDF24", &holder("job-1"), Utc::now())
            .await
            .unwrap();

        assert!(!store.release("PDF24", Some(&holder("job-2"))).await.unwrap());
        assert!(store.release("PDF24", Some(&holder("job-1"))).await.unwrap());

        let row = store.get_printer("PDF24").await.unwrap().unwrap();
        assert!(row.is_available);
        assert!(row.invariant_holds());
    }

    #[tokio::test]
    async fn force_release_ignores_holder() {
        let store = seeded().await;
        store
            .try_reserve("PDF24", &holder("job-1"), Utc::now())
            .await
            .unwrap();
        assert!(store.release("PDF24", None).await.unwrap());
        // Releasing an already-free row is a no-op.
        assert!(!store.release("PDF24", None).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_reclaims_only_stale_rows() {
        let store = seeded().await;
        let stale = Utc::now() - chrono::Duration::minutes(30);
        let fresh = Utc::now();
        store.try_reserve("PDF24", &holder("job-1"), stale).await.unwrap();
        store.try_reserve("PDFCreator", &holder("job-2"), fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        assert_eq!(store.cleanup_expired(cutoff).await.unwrap(), 1);

        assert!(store.get_printer("PDF24").await.unwrap().unwrap().is_available);
        assert!(!store.get_printer("PDFCreator").await.unwrap().unwrap().is_available);
    }

    #[tokio::test]
    async fn every_mutation_bumps_version() {
        let store = seeded().await;
        let v0 = store.get_printer("PDF24").await.unwrap().unwrap().version;
        store.try_reserve("PDF24", &holder("job-1"), Utc::now()).await.unwrap();
        let v1 = store.get_printer("PDF24").await.unwrap().unwrap().version;
        store.release("PDF24", None).await.unwrap();
        let v2 = store.get_printer("PDF24").await.unwrap().unwrap().version;
        assert!(v1 > v0);
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn concurrent_reserve_has_exactly_one_winner() {
        let store = Arc::new(seeded().await);
        let mut handles = vec![];
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_reserve("PDF24", &holder(&format!("job-{}", i)), Utc::now())
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() == ReserveOutcome::Reserved {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
