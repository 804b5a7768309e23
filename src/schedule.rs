//! # Schedule State
//!
//! The shared state every backend coordinates through: the [`QueryLog`] and the count of
//! currently admitted (available) queries, guarded by a single mutex.
//!
//! ## Scheduling
//!
//! [`ScheduleState::reschedule`] promotes waiting entries (pending or given up) to available,
//! oldest arrival first, as long as
//!
//! - no available entry shares an affected table with the candidate, and
//! - fewer than `max_concurrent_query` entries are available.
//!
//! The set of available entries is therefore always pairwise disjoint.
//!
//! ## Barriers
//!
//! A candidate that keeps conflicting may be overtaken by later, non-conflicting arrivals. Once it
//! was skipped `max_skip_tolerance` times, it reserves its tables for the rest of the pass:
//! later arrivals overlapping those tables are held back until it was promoted. Arrivals that are
//! disjoint from it still go ahead.
//!
//! ## Backoff
//!
//! An entry that gave up stays out of every pass until its owner resumes it after the backoff,
//! so it neither occupies a concurrency slot nor blocks overlapping waiters while it sleeps.
//!
//! ## Locking
//!
//! [`ScheduleHandle`] owns the mutex. It is held for a single decision at a time and never across
//! an `.await` or a table-lock attempt.

use std::{collections::HashSet, sync::Arc};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{Notify, futures::Notified};

use crate::{
    config::SchedulerConfig,
    core::{Footprint, RelId, TxnId},
    errors::{AdmissionError, AdmissionResult},
    querylog::{EntryHandle, QueryLog, QueryStatus},
};

#[derive(Debug)]
pub struct ScheduleState {
    /// Number of available entries. Always within `0..=max_concurrent_query`.
    running_query: usize,
    log: QueryLog,
    max_concurrent_query: usize,
    max_skip_tolerance: u32,
}

impl ScheduleState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            running_query: 0,
            log: QueryLog::with_capacity(config.max_query_num),
            max_concurrent_query: config.max_concurrent_query,
            max_skip_tolerance: config.max_skip_tolerance,
        }
    }

    #[inline]
    pub fn running_query(&self) -> usize {
        self.running_query
    }

    pub fn log(&self) -> &QueryLog {
        &self.log
    }

    pub fn status(&self, handle: EntryHandle) -> Option<QueryStatus> {
        self.log.get(handle).map(|entry| entry.status())
    }

    pub fn register(&mut self, id: TxnId, footprint: Footprint) -> AdmissionResult<EntryHandle> {
        self.log.register(id, footprint)
    }

    /// Marks an available entry as given up and frees its concurrency slot. The entry is not
    /// promoted again before its owner calls [`resume`](Self::resume).
    pub fn give_up(&mut self, handle: EntryHandle) -> AdmissionResult<()> {
        let Some(entry) = self.log.get_mut(handle) else {
            return Err(AdmissionError::EntryVanished(handle.id()));
        };
        if entry.status() != QueryStatus::Available {
            return Err(AdmissionError::InvariantViolation(format!(
                "transaction {} gave up while {}",
                handle.id(),
                entry.status()
            )));
        }
        entry.set_status(QueryStatus::GiveUp);
        entry.set_backing_off(true);
        self.decrement_running()
    }

    /// Makes a given-up entry eligible for promotion again once its backoff is over.
    pub fn resume(&mut self, handle: EntryHandle) -> AdmissionResult<()> {
        let Some(entry) = self.log.get_mut(handle) else {
            return Err(AdmissionError::EntryVanished(handle.id()));
        };
        entry.set_backing_off(false);
        Ok(())
    }

    /// Removes the entry behind `handle`, freeing its concurrency slot if it was available.
    /// Returns `false` if the entry was already removed.
    pub fn remove(&mut self, handle: EntryHandle) -> AdmissionResult<bool> {
        let Some(entry) = self.log.remove(handle) else {
            return Ok(false);
        };
        if entry.status() == QueryStatus::Available {
            self.decrement_running()?;
        }
        Ok(true)
    }

    fn decrement_running(&mut self) -> AdmissionResult<()> {
        self.running_query = self.running_query.checked_sub(1).ok_or_else(|| {
            AdmissionError::InvariantViolation("running query count dropped below zero".into())
        })?;
        Ok(())
    }

    /// Promotes every waiting entry that may run now. Returns the number of promoted entries.
    ///
    /// Deterministic for a given log and bounded by `entries * footprint size`; never waits.
    pub fn reschedule(&mut self) -> usize {
        let order = self.log.arrival_order();

        // tables of all available entries
        let mut busy: HashSet<RelId> = self
            .log
            .iter()
            .filter(|entry| entry.status() == QueryStatus::Available)
            .flat_map(|entry| entry.affected_tables().iter())
            .collect();
        // tables reserved by entries that exceeded the skip tolerance
        let mut reserved: HashSet<RelId> = HashSet::new();

        let mut promoted = 0;
        for slot in order {
            if self.running_query >= self.max_concurrent_query {
                break;
            }
            let Some(entry) = self.log.slot_mut(slot) else {
                continue;
            };
            if entry.status() == QueryStatus::Available || entry.is_backing_off() {
                continue;
            }

            let tables = entry.affected_tables();
            let conflicts_running = tables.iter().any(|t| busy.contains(&t));
            let conflicts_barrier = tables.iter().any(|t| reserved.contains(&t));

            if conflicts_running || conflicts_barrier {
                if entry.skip_count() >= self.max_skip_tolerance {
                    reserved.extend(tables.iter());
                } else {
                    entry.bump_skip_count();
                }
                continue;
            }

            busy.extend(tables.iter());
            entry.set_status(QueryStatus::Available);
            self.running_query += 1;
            promoted += 1;
            trace!(txn = %entry.id(), tables = %entry.affected_tables(), "promoted query");
        }
        promoted
    }

    /// Verifies the counter against the log.
    pub fn check_invariants(&self) -> AdmissionResult<()> {
        if self.running_query > self.max_concurrent_query {
            return Err(AdmissionError::InvariantViolation(format!(
                "{} running queries exceed the limit of {}",
                self.running_query, self.max_concurrent_query
            )));
        }
        let available = self
            .log
            .iter()
            .filter(|entry| entry.status() == QueryStatus::Available)
            .count();
        if available != self.running_query {
            return Err(AdmissionError::InvariantViolation(format!(
                "running query count is {}, but {} entries are available",
                self.running_query, available
            )));
        }
        Ok(())
    }
}

/// A point-in-time copy of one logged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: TxnId,
    pub status: QueryStatus,
    pub affected_tables: Vec<RelId>,
}

/// A point-in-time copy of the schedule state, oldest arrival first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSnapshot {
    pub running_query: usize,
    pub entries: Vec<EntrySnapshot>,
}

impl ScheduleSnapshot {
    pub fn status_of(&self, id: TxnId) -> Option<QueryStatus> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.status)
    }
}

#[derive(Debug)]
struct SharedSchedule {
    state: Mutex<ScheduleState>,
    /// Signalled whenever an entry may have been promoted.
    wakeup: Notify,
}

/// Handle to the process-wide schedule state. Cheap to clone; all clones share one state.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    shared: Arc<SharedSchedule>,
}

impl ScheduleHandle {
    /// Allocates the shared state, including all query log slots, once.
    pub fn init(config: &SchedulerConfig) -> AdmissionResult<Self> {
        config.validate()?;
        info!(
            slots = config.max_query_num,
            max_concurrent = config.max_concurrent_query,
            "initializing shared schedule state"
        );
        Ok(Self {
            shared: Arc::new(SharedSchedule {
                state: Mutex::new(ScheduleState::new(config)),
                wakeup: Notify::new(),
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ScheduleState> {
        self.shared.state.lock()
    }

    /// A future that completes on the next wakeup. Must be created (and enabled) before the
    /// state is inspected, so no wakeup in between is lost.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.shared.wakeup.notified()
    }

    fn wake_waiters(&self) {
        self.shared.wakeup.notify_waiters();
    }

    /// Logs a query and runs the scheduler once.
    pub(crate) fn register(&self, id: TxnId, footprint: Footprint) -> AdmissionResult<EntryHandle> {
        let handle = {
            let mut state = self.lock();
            let handle = state.register(id, footprint)?;
            state.reschedule();
            state.check_invariants()?;
            handle
        };
        self.wake_waiters();
        Ok(handle)
    }

    /// Returns the entry's status and the number of running queries, as one consistent read.
    pub(crate) fn poll(&self, handle: EntryHandle) -> Option<(QueryStatus, usize)> {
        let state = self.lock();
        state
            .status(handle)
            .map(|status| (status, state.running_query()))
    }

    /// Runs the scheduler on behalf of a waiter and returns the waiter's new status.
    pub(crate) fn heal(&self, handle: EntryHandle) -> AdmissionResult<Option<QueryStatus>> {
        let (status, promoted) = {
            let mut state = self.lock();
            let promoted = state.reschedule();
            state.check_invariants()?;
            (state.status(handle), promoted)
        };
        if promoted > 0 {
            self.wake_waiters();
        }
        Ok(status)
    }

    pub(crate) fn give_up(&self, handle: EntryHandle) -> AdmissionResult<()> {
        {
            let mut state = self.lock();
            state.give_up(handle)?;
            state.reschedule();
            state.check_invariants()?;
        }
        self.wake_waiters();
        Ok(())
    }

    /// Puts a given-up query back into scheduling after its backoff.
    pub(crate) fn resume(&self, handle: EntryHandle) -> AdmissionResult<()> {
        {
            let mut state = self.lock();
            state.resume(handle)?;
            state.reschedule();
            state.check_invariants()?;
        }
        self.wake_waiters();
        Ok(())
    }

    /// Removes a logged query and runs the scheduler so waiters can advance. Idempotent.
    pub(crate) fn remove(&self, handle: EntryHandle) -> AdmissionResult<bool> {
        let removed = {
            let mut state = self.lock();
            let removed = state.remove(handle)?;
            if removed {
                state.reschedule();
            }
            state.check_invariants()?;
            removed
        };
        if removed {
            self.wake_waiters();
        }
        Ok(removed)
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        let state = self.lock();
        let entries = state
            .log
            .arrival_order()
            .into_iter()
            .filter_map(|slot| state.log.slot(slot))
            .map(|entry| EntrySnapshot {
                id: entry.id(),
                status: entry.status(),
                affected_tables: entry.affected_tables().as_slice().to_vec(),
            })
            .collect();
        ScheduleSnapshot {
            running_query: state.running_query(),
            entries,
        }
    }
}
