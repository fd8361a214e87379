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

//! # Printer Locks
//!
//! ## Purpose
//! Distributed reservation and locking for a small pool of named PDF
//! virtual printers shared by multiple concurrent processes across multiple
//! machines. Guarantees at-most-one-owner-per-printer under concurrent
//! access, recovers from crashed holders through time-based staleness, and
//! supports pluggable backing stores.
//!
//! ## Design Decisions
//! - **Optimistic concurrency**: every row carries a version token changed
//!   by every mutation; the reservation transition is a single atomic
//!   backend operation, never a read-then-write in application code.
//! - **Time-based crash recovery**: no heartbeat; a reservation older than
//!   the configured maximum duration is stale and reclaimable by anyone.
//! - **Contention is not an error**: failed acquisition is an `Ok(None)`
//!   return; exceptions are reserved for connectivity, configuration, and
//!   schema faults.
//! - **Closed provider set**: backends are a small enum of strategies, each
//!   amounting to query templates plus one capability flag.
//!
//! ## Backend Support
//! - **InMemory**: concurrent map with per-key compare-and-swap (default,
//!   feature `memory-backend`)
//! - **SQLite**: optimistic token, no native row locking (feature
//!   `sqlite-backend`)
//! - **PostgreSQL**: `SELECT ... FOR UPDATE NOWAIT` row locking (feature
//!   `postgres-backend`)
//!
//! ## Examples
//!
//! ```rust,no_run
//! use printer_locks::{
//!     config::LockConfig,
//!     facade,
//!     provider::Provider,
//!     service::PrinterLockService,
//!     store::memory::MemoryStateStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LockConfig::default();
//! let store = Arc::new(MemoryStateStore::new());
//! facade::ensure_default_fleet(store.as_ref(), &config.default_fleet).await?;
//!
//! let service = PrinterLockService::new(store, &Provider::InMemory, config);
//!
//! // Prefer the fast printer, fall back to anything available.
//! let reservation_id = facade::generate_reservation_id();
//! if let Some(lock) = service
//!     .try_reserve_any_available_printer(&reservation_id, &["PDF24", "PDFCreator"])
//!     .await?
//! {
//!     // ... print through lock.printer_name ...
//!     service.release_lock(&lock.lock_id).await;
//! }
//!
//! // Periodic sweep reclaims reservations abandoned by crashed processes.
//! service.cleanup_expired_reservations().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod model;
pub mod provider;
pub mod schema;
pub mod service;
pub mod store;

pub use config::LockConfig;
pub use error::{LockError, LockResult};
pub use model::{HolderIdentity, PrinterLock, PrinterReservation, PrinterState, ReservationState};
pub use provider::Provider;
pub use schema::SchemaReport;
pub use service::PrinterLockService;
pub use store::{PrinterStateStore, ReserveOutcome};
