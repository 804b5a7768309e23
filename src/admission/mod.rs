//! # Admission
//!
//! Every coordinated query passes the same gate before it may execute:
//!
//! 1. **Registering:** its footprint is logged as pending and the scheduler runs once.
//! 2. **Waiting:** it waits until the scheduler made it available. Waiters are woken whenever an
//!    entry may have been promoted and poll at `poll_interval` in any case. A waiter that sees no
//!    running query while it is still not available runs the scheduler itself, so a lost wakeup
//!    can never stall the log.
//! 3. **Locking:** it takes exclusive locks on every base table of every IMMV reachable through its
//!    footprint, without waiting. This is all-or-nothing: on the first conflict all locks taken in
//!    this attempt are released and the entry gives up its slot. It is not promoted again before
//!    its backoff is over; then it goes back to waiting with the same footprint.
//! 4. **Running:** the caller holds an [`Admission`]. The entry stays logged, so queries that
//!    overlap with it keep waiting.
//! 5. **Done:** releasing or dropping the [`Admission`] removes the entry and reschedules.
//!
//! Table locks are only ever attempted while the schedule mutex is released.

use std::{fmt, sync::Arc, time::Duration};

use itertools::Itertools;
use tracing::instrument;

use crate::{
    catalog::{AffectedTableMap, ImmvRegistry, lock_closure},
    config::{BackoffConfig, SchedulerConfig},
    core::{Footprint, RelId, TxnId},
    errors::{AdmissionError, AdmissionResult, CatalogError},
    locks::{LockManager, try_lock_all},
    querylog::{EntryHandle, QueryStatus},
    schedule::ScheduleHandle,
};


/// Permission for one query to execute. Its log entry is removed once this is released or
/// dropped, on every exit path.
#[derive(Debug)]
#[must_use = "dropping an `Admission` releases it immediately"]
pub struct Admission {
    txn: TxnId,
    /// `None` for queries without footprint, and after release.
    entry: Option<EntryHandle>,
    /// Lock attempts it took to get admitted.
    attempts: u32,
    footprint: Footprint,
    schedule: ScheduleHandle,
}

impl Admission {
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// Whether this admission occupies a slot in the query log.
    pub fn is_logged(&self) -> bool {
        self.entry.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The affected tables this admission covers.
    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    /// Removes the log entry and lets waiting queries advance.
    pub fn release(mut self) -> AdmissionResult<()> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> AdmissionResult<()> {
        let Some(handle) = self.entry.take() else {
            return Ok(());
        };
        let removed = self.schedule.remove(handle)?;
        debug!(txn = %self.txn, removed, "released admission");
        Ok(())
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            error!(txn = %self.txn, "could not release admission: {}", e);
        }
    }
}

/// IMMVs whose relation a transaction holds an exclusive lock on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeldLocks(Vec<RelId>);

impl HeldLocks {
    pub fn relations(&self) -> &[RelId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for HeldLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join(" "))
    }
}

/// Exponentially growing sleep between give-up and the next attempt.
struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: u32,
}

impl Backoff {
    fn new(config: &BackoffConfig) -> Self {
        Self {
            next: config.initial,
            max: config.max,
            multiplier: config.multiplier,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(self.multiplier).min(self.max);
        delay
    }
}

/// The admission gate shared by all sessions of a process.
pub struct Coordinator {
    schedule: ScheduleHandle,
    affected: Arc<dyn AffectedTableMap>,
    registry: Arc<dyn ImmvRegistry>,
    locks: Arc<dyn LockManager>,
    config: SchedulerConfig,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("schedule", &self.schedule)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Initializes the shared schedule state and wires up the host collaborators.
    pub fn init(
        config: SchedulerConfig,
        affected: Arc<dyn AffectedTableMap>,
        registry: Arc<dyn ImmvRegistry>,
        locks: Arc<dyn LockManager>,
    ) -> AdmissionResult<Self> {
        let schedule = ScheduleHandle::init(&config)?;
        Ok(Self {
            schedule,
            affected,
            registry,
            locks,
            config,
        })
    }

    pub fn schedule(&self) -> &ScheduleHandle {
        &self.schedule
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The affected tables among the relations a query plan references.
    pub fn footprint_of(&self, relations: &[RelId]) -> AdmissionResult<Footprint> {
        Footprint::new(
            relations
                .iter()
                .copied()
                .filter(|rel| self.affected.is_affected(*rel)),
            self.config.max_affected_tables,
        )
    }

    /// Runs the admission protocol for one query of `txn`.
    ///
    /// Queries without footprint are admitted right away and never logged. Otherwise this returns
    /// once the query is available and holds all its locks. Lock conflicts are retried silently,
    /// without limit. Dropping the returned future cleans up the log entry.
    #[instrument(skip_all, level = "debug", fields(txn = %txn))]
    pub async fn admit(&self, txn: TxnId, footprint: Footprint) -> AdmissionResult<Admission> {
        let mut admission = Admission {
            txn,
            entry: None,
            attempts: 0,
            footprint: footprint.clone(),
            schedule: self.schedule.clone(),
        };
        if footprint.is_empty() {
            trace!("no affected tables, skipping coordination");
            return Ok(admission);
        }

        // -- Registering --
        debug!(tables = %footprint, "logging query");
        let handle = self.schedule.register(txn, footprint.clone())?;
        admission.entry = Some(handle);

        let mut backoff = Backoff::new(&self.config.backoff);
        loop {
            // -- Waiting --
            self.wait_until_available(handle).await?;

            // -- Locking --
            admission.attempts += 1;
            let closure = lock_closure(self.affected.as_ref(), &footprint);
            match try_lock_all(self.locks.as_ref(), txn, closure) {
                Ok(newly_locked) => {
                    debug!(
                        attempts = admission.attempts,
                        newly_locked = newly_locked.len(),
                        "got all necessary locks"
                    );
                    self.log_held_locks(txn);
                    return Ok(admission);
                }
                Err(conflict) => {
                    self.schedule.give_up(handle)?;
                    let delay = backoff.next_delay();
                    debug!(
                        rel = %conflict.rel,
                        rolled_back = conflict.rolled_back,
                        attempt = admission.attempts,
                        ?delay,
                        "lock conflict, giving up"
                    );
                    self.log_held_locks(txn);
                    // -- Retrying --
                    tokio::time::sleep(delay).await;
                    self.schedule.resume(handle)?;
                }
            }
        }
    }

    /// Extends `admission` to also cover `footprint`.
    ///
    /// Returns `admission` unchanged if it covers `footprint` already. Otherwise its entry is
    /// replaced by one for the union of both footprints, which goes through the whole protocol
    /// again. Locks taken for the old footprint stay with the transaction.
    pub async fn widen(
        &self,
        admission: Admission,
        footprint: Footprint,
    ) -> AdmissionResult<Admission> {
        if footprint.iter().all(|table| admission.footprint.contains(table)) {
            return Ok(admission);
        }
        let txn = admission.txn;
        let combined = Footprint::new(
            admission.footprint.iter().chain(footprint.iter()),
            self.config.max_affected_tables,
        )?;
        debug!(%txn, from = %admission.footprint, to = %combined, "widening admission");
        admission.release()?;
        self.admit(txn, combined).await
    }

    async fn wait_until_available(&self, handle: EntryHandle) -> AdmissionResult<()> {
        let vanished = || AdmissionError::EntryVanished(handle.id());
        loop {
            let notified = self.schedule.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (mut status, running) = self.schedule.poll(handle).ok_or_else(vanished)?;
            // nobody is running who could wake us up, so reschedule ourselves
            if running == 0 && status != QueryStatus::Available {
                status = self.schedule.heal(handle)?.ok_or_else(vanished)?;
            }
            if status == QueryStatus::Available {
                return Ok(());
            }

            trace!(%status, running, "waiting for admission");
            let _ = tokio::time::timeout(self.config.poll_interval, notified).await;
        }
    }

    /// The IMMVs `txn` currently holds exclusively. For diagnostics only.
    pub fn held_locks_snapshot(&self, txn: TxnId) -> Result<HeldLocks, CatalogError> {
        let immvs = self.registry.immvs()?;
        Ok(HeldLocks(
            immvs
                .into_iter()
                .filter(|immv| self.locks.held_by_me(txn, *immv))
                .collect(),
        ))
    }

    fn log_held_locks(&self, txn: TxnId) {
        match self.held_locks_snapshot(txn) {
            Ok(held) => debug!(%txn, holding = %held, "held IMMV locks"),
            Err(e) => warn!(%txn, "could not report held IMMV locks: {}", e),
        }
    }
}
