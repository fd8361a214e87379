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

//! Core data model: printer rows, lock handles, holder identity, and the
//! optional reservation saga record.
//!
//! ## Consistency rule
//! A `printer_states` row is either fully free (`is_available` with all
//! reservation fields null) or fully reserved (`is_available == false` with
//! all reservation fields set). [`PrinterState::invariant_holds`] is the
//! application-level assertion; the schema carries the matching CHECK
//! constraint as a backstop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per physical/virtual printer.
///
/// Rows are created once at bootstrap and never deleted during normal
/// operation; they only transition between free and reserved. `version` is a
/// monotonic counter bumped by every mutation and used as the optimistic
/// concurrency token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterState {
    /// Surrogate key, assigned at creation, immutable.
    pub id: i64,
    /// Globally unique natural key.
    pub printer_name: String,
    /// Free/reserved flag. See the consistency rule above.
    pub is_available: bool,
    /// Identity tag of the current holder; `None` when free.
    pub reserved_by: Option<String>,
    /// Reservation timestamp; `None` when free. Drives staleness detection.
    pub reserved_at: Option<DateTime<Utc>>,
    /// Holder's OS process id, for crash-cleanup heuristics.
    pub process_id: Option<i64>,
    /// Holder's host name.
    pub machine_name: Option<String>,
    /// Optimistic concurrency token; changes on every mutation.
    pub version: i64,
}

impl PrinterState {
    /// A fresh, unreserved row.
    pub fn new_available(id: i64, printer_name: impl Into<String>) -> Self {
        Self {
            id,
            printer_name: printer_name.into(),
            is_available: true,
            reserved_by: None,
            reserved_at: None,
            process_id: None,
            machine_name: None,
            version: 0,
        }
    }

    /// Whether the availability flag and the reservation fields agree.
    pub fn invariant_holds(&self) -> bool {
        if self.is_available {
            self.reserved_by.is_none() && self.reserved_at.is_none() && self.process_id.is_none()
        } else {
            self.reserved_by.is_some() && self.reserved_at.is_some() && self.process_id.is_some()
        }
    }
}

/// Identity of a caller holding (or requesting) a reservation.
///
/// Populated from the current process and host so that operators can map a
/// stale row back to the machine that abandoned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderIdentity {
    /// Caller name, file path, or session tag.
    pub reserved_by: String,
    /// OS process id of the holder.
    pub process_id: i64,
    /// Host name of the holder.
    pub machine_name: String,
}

impl HolderIdentity {
    /// Identity for the current process, tagged with `reserved_by`.
    pub fn current(reserved_by: impl Into<String>) -> Self {
        Self {
            reserved_by: reserved_by.into(),
            process_id: std::process::id() as i64,
            machine_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    /// Same process and host, different tag.
    pub fn retagged(&self, reserved_by: impl Into<String>) -> Self {
        Self {
            reserved_by: reserved_by.into(),
            process_id: self.process_id,
            machine_name: self.machine_name.clone(),
        }
    }
}

/// Ephemeral lock handle returned to the caller on successful acquisition.
///
/// Owned exclusively by the acquiring caller; released explicitly through
/// the lock service or reclaimed by the expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterLock {
    /// Printer this lock covers.
    pub printer_name: String,
    /// Unique per acquisition (Ulid).
    pub lock_id: String,
    /// Holder tag recorded in the row.
    pub reserved_by: String,
    /// When the reservation was taken.
    pub reserved_at: DateTime<Utc>,
    /// Absolute expiry; after this instant the cleanup sweep may reclaim the
    /// printer regardless of the holder.
    pub expires_at: DateTime<Utc>,
    /// Host that acquired the lock.
    pub machine_name: String,
}

impl PrinterLock {
    /// Whether the lock is still live at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether the lock is still live.
    pub fn is_active_now(&self) -> bool {
        self.is_active(Utc::now())
    }
}

/// Lifecycle state of a multi-step reservation (saga).
///
/// A reservation must eventually reach a terminal state or be reclaimed by
/// the expiry sweep. Only forward transitions are valid; terminal states
/// absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    /// Printer reserved, work not started.
    Reserved,
    /// Work running against the reserved printer.
    InProgress,
    /// Work finished; printer released normally.
    Completed,
    /// Work failed; printer released, no compensation needed.
    Failed,
    /// Work failed after side effects; compensation ran.
    Compensated,
}

impl ReservationState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Compensated)
    }

    /// Whether `next` is a valid successor of `self`.
    pub fn can_transition_to(&self, next: ReservationState) -> bool {
        match self {
            Self::Reserved => matches!(next, Self::InProgress | Self::Failed),
            Self::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

/// Higher-level reservation record for multi-step workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterReservation {
    /// Unique per process+timestamp; see
    /// [`generate_reservation_id`](crate::facade::generate_reservation_id).
    pub reservation_id: String,
    /// Caller-supplied session tag.
    pub session_id: String,
    /// Printer the reservation covers.
    pub printer_name: String,
    /// OS process id of the reserving process.
    pub process_id: i64,
    /// Current saga state.
    pub state: ReservationState,
    /// When the reservation was created.
    pub created_at: DateTime<Utc>,
}

impl PrinterReservation {
    /// Advance the saga to `next`. Returns `false` (no mutation) for
    /// invalid transitions.
    pub fn advance(&mut self, next: ReservationState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}
