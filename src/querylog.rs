//! # Query Log
//!
//! Fixed-capacity table of the queries currently going through admission. The slots are
//! allocated once, when the shared schedule state is initialized, and never grow: running out of
//! slots is a sizing error of the deployment, reported as [`AdmissionError::QueryLogFull`].
//!
//! The log itself is not synchronized. It lives inside the mutex-guarded [`ScheduleState`], so
//! every read or write of an entry's status or membership happens under that mutex.
//!
//! [`ScheduleState`]: crate::schedule::ScheduleState

use itertools::Itertools;

use crate::{
    core::{Footprint, TxnId},
    errors::{AdmissionError, AdmissionResult},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// Logged and waiting for the scheduler.
    #[display("pending")]
    Pending,
    /// Promoted by the scheduler; counted in `running_query`.
    #[display("available")]
    Available,
    /// The owner failed to take its locks and waits to be promoted again.
    #[display("give-up")]
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct QueryEntry {
    id: TxnId,
    status: QueryStatus,
    affected_tables: Footprint,
    /// Arrival order of this entry, unique across the lifetime of the log.
    arrival: u64,
    /// How often the scheduler held this entry back.
    skip_count: u32,
    /// Given up and sleeping off its backoff; invisible to the scheduler until resumed.
    backing_off: bool,
}

impl QueryEntry {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub fn affected_tables(&self) -> &Footprint {
        &self.affected_tables
    }

    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub fn skip_count(&self) -> u32 {
        self.skip_count
    }

    pub fn is_backing_off(&self) -> bool {
        self.backing_off
    }

    pub(crate) fn set_status(&mut self, status: QueryStatus) {
        self.status = status;
    }

    pub(crate) fn set_backing_off(&mut self, backing_off: bool) {
        self.backing_off = backing_off;
    }

    pub(crate) fn bump_skip_count(&mut self) {
        self.skip_count = self.skip_count.saturating_add(1);
    }
}

/// Refers to one logged entry. A handle outlives its entry safely: once the entry was removed,
/// every lookup through the handle misses, even if the slot got reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    slot: usize,
    arrival: u64,
    id: TxnId,
}

impl EntryHandle {
    pub fn id(&self) -> TxnId {
        self.id
    }
}

#[derive(Debug)]
pub struct QueryLog {
    slots: Vec<Option<QueryEntry>>,
    len: usize,
    next_arrival: u64,
}

impl QueryLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            len: 0,
            next_arrival: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Logs a new pending entry for `id`.
    pub fn register(&mut self, id: TxnId, affected_tables: Footprint) -> AdmissionResult<EntryHandle> {
        if self.iter().any(|entry| entry.id == id) {
            return Err(AdmissionError::AlreadyLogged(id));
        }
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            return Err(AdmissionError::QueryLogFull {
                capacity: self.capacity(),
            });
        };

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.slots[slot] = Some(QueryEntry {
            id,
            status: QueryStatus::Pending,
            affected_tables,
            arrival,
            skip_count: 0,
            backing_off: false,
        });
        self.len += 1;
        Ok(EntryHandle { slot, arrival, id })
    }

    /// Removes the entry behind `handle`. Removing an already removed entry does nothing.
    pub fn remove(&mut self, handle: EntryHandle) -> Option<QueryEntry> {
        self.get(handle)?;
        let entry = self.slots[handle.slot].take();
        self.len -= 1;
        entry
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&QueryEntry> {
        self.slots
            .get(handle.slot)?
            .as_ref()
            .filter(|entry| entry.arrival == handle.arrival)
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut QueryEntry> {
        self.slots
            .get_mut(handle.slot)?
            .as_mut()
            .filter(|entry| entry.arrival == handle.arrival)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryEntry> {
        self.slots.iter().flatten()
    }

    /// Slots of all logged entries, oldest arrival first.
    pub(crate) fn arrival_order(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|e| (slot, e.arrival)))
            .sorted_by_key(|(_, arrival)| *arrival)
            .map(|(slot, _)| slot)
            .collect()
    }

    pub(crate) fn slot(&self, slot: usize) -> Option<&QueryEntry> {
        self.slots.get(slot)?.as_ref()
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> Option<&mut QueryEntry> {
        self.slots.get_mut(slot)?.as_mut()
    }
}
