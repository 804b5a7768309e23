//! # Session
//!
//! Glue between the host's executor hooks and the [`Coordinator`]. One [`Session`] exists per
//! backend (client connection) and carries what is specific to it: the current transaction, the
//! executor nesting depth and whether a utility command is running.
//!
//! ## Enforcement
//!
//! Admission is only enforced for the outermost execution of a plain query. It is skipped for
//!
//! - queries with empty source text and explain-only queries,
//! - parallel workers (their leader was admitted already),
//! - nested executions (e.g. a function body run by an outer query),
//! - anything run inside a utility command (DDL).
//!
//! ## Cleanup
//!
//! The admission of a query is released when its executor run finishes, no matter how:
//! [`ExecutorRun::complete`], [`ExecutorRun::fail`], dropping the run while unwinding from an
//! error, or a transaction/subtransaction abort.

use std::{
    mem,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use crate::{
    admission::{Admission, Coordinator},
    core::{RelId, TxnId},
    errors::{AdmissionError, AdmissionResult},
};

/// What the host hands over when a query starts executing.
#[derive(Debug, Clone, Copy)]
pub struct QueryDesc<'a> {
    pub source_text: &'a str,
    /// Every relation the plan references.
    pub relations: &'a [RelId],
    /// Only explained, never executed.
    pub explain_only: bool,
}

impl<'a> QueryDesc<'a> {
    pub fn new(source_text: &'a str, relations: &'a [RelId]) -> Self {
        Self {
            source_text,
            relations,
            explain_only: false,
        }
    }

    pub fn explain_only(mut self) -> Self {
        self.explain_only = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Failed,
}

#[derive(Debug)]
pub struct Session {
    coordinator: Arc<Coordinator>,
    txn: TxnId,
    nesting_level: u32,
    is_utility: bool,
    is_parallel_worker: bool,
    /// The admission of the running outermost query.
    admission: Option<Admission>,
    /// Executor runs at depth 0 that still share `admission`.
    pending_runs: u32,
}

impl Session {
    pub fn new(coordinator: Arc<Coordinator>, txn: TxnId) -> Self {
        Self {
            coordinator,
            txn,
            nesting_level: 0,
            is_utility: false,
            is_parallel_worker: false,
            admission: None,
            pending_runs: 0,
        }
    }

    /// A session of a parallel worker, which never takes part in admission.
    pub fn parallel_worker(coordinator: Arc<Coordinator>, txn: TxnId) -> Self {
        Self {
            is_parallel_worker: true,
            ..Self::new(coordinator, txn)
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn nesting_level(&self) -> u32 {
        self.nesting_level
    }

    pub fn is_utility(&self) -> bool {
        self.is_utility
    }

    /// Whether the current outermost query holds a logged admission.
    pub fn is_admitted(&self) -> bool {
        self.admission.is_some()
    }

    /// Switches to a new transaction. Anything left over from the previous one is released.
    pub fn begin_transaction(&mut self, txn: TxnId) -> AdmissionResult<()> {
        self.release_admission()?;
        self.txn = txn;
        Ok(())
    }

    #[inline]
    fn enforcement_enabled(&self) -> bool {
        !self.is_parallel_worker && self.nesting_level == 0 && !self.is_utility
    }

    /// Executor start hook: admits the query, waiting as long as it takes.
    ///
    /// A repeated top-level start while the session is admitted shares that admission, widened to
    /// the new query's tables where needed.
    pub async fn on_executor_start(&mut self, query: &QueryDesc<'_>) -> AdmissionResult<()> {
        if query.source_text.is_empty() || query.explain_only || !self.enforcement_enabled() {
            trace!(
                txn = %self.txn,
                nesting_level = self.nesting_level,
                is_utility = self.is_utility,
                "skipping admission"
            );
            return Ok(());
        }
        let footprint = self.coordinator.footprint_of(query.relations)?;
        if let Some(admitted) = self.admission.take() {
            // another top-level run sharing the admission, which must cover its tables too
            let pending_runs = mem::take(&mut self.pending_runs);
            let admission = self.coordinator.widen(admitted, footprint).await?;
            self.admission = Some(admission);
            self.pending_runs = pending_runs + 1;
            return Ok(());
        }

        let admission = self.coordinator.admit(self.txn, footprint).await?;
        if admission.is_logged() {
            self.admission = Some(admission);
            self.pending_runs = 1;
        }
        Ok(())
    }

    /// Executor run hook: enters one nesting level until the returned run is finished.
    pub fn executor_run(&mut self) -> ExecutorRun<'_> {
        self.nesting_level += 1;
        ExecutorRun {
            session: self,
            is_finished: false,
        }
    }

    fn finish_run(&mut self, outcome: RunOutcome) -> AdmissionResult<()> {
        self.nesting_level = self.nesting_level.checked_sub(1).ok_or_else(|| {
            AdmissionError::InvariantViolation("executor nesting level dropped below zero".into())
        })?;
        if !self.enforcement_enabled() || self.pending_runs == 0 {
            return Ok(());
        }

        self.pending_runs -= 1;
        if self.pending_runs > 0 {
            return Ok(());
        }
        if outcome == RunOutcome::Failed {
            debug!(txn = %self.txn, "query failed, releasing its admission");
        }
        self.release_admission()
    }

    /// Utility hook: enforcement is off until the returned scope is dropped.
    pub fn utility(&mut self) -> UtilityScope<'_> {
        let was_utility = mem::replace(&mut self.is_utility, true);
        UtilityScope {
            session: self,
            was_utility,
        }
    }

    /// Transaction abort hook.
    pub fn on_transaction_abort(&mut self) -> AdmissionResult<()> {
        debug!(txn = %self.txn, "transaction aborted");
        self.at_abort()
    }

    /// Subtransaction abort hook.
    pub fn on_subtransaction_abort(&mut self) -> AdmissionResult<()> {
        debug!(txn = %self.txn, "subtransaction aborted");
        self.at_abort()
    }

    fn at_abort(&mut self) -> AdmissionResult<()> {
        self.release_admission()
    }

    fn release_admission(&mut self) -> AdmissionResult<()> {
        self.pending_runs = 0;
        match self.admission.take() {
            Some(admission) => admission.release(),
            None => Ok(()),
        }
    }
}

/// One executor run. Finishing it (or dropping it unfinished, as a failure) leaves its nesting
/// level and releases the admission once the outermost run is done.
#[must_use = "dropping an `ExecutorRun` finishes it as failed"]
pub struct ExecutorRun<'s> {
    session: &'s mut Session,
    is_finished: bool,
}

impl ExecutorRun<'_> {
    pub fn complete(mut self) -> AdmissionResult<()> {
        self.finish(RunOutcome::Completed)
    }

    pub fn fail(mut self) -> AdmissionResult<()> {
        self.finish(RunOutcome::Failed)
    }

    fn finish(&mut self, outcome: RunOutcome) -> AdmissionResult<()> {
        self.is_finished = true;
        self.session.finish_run(outcome)
    }
}

impl Deref for ExecutorRun<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for ExecutorRun<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for ExecutorRun<'_> {
    fn drop(&mut self) {
        if self.is_finished {
            return;
        }
        if let Err(e) = self.finish(RunOutcome::Failed) {
            error!(txn = %self.session.txn, "could not finish executor run: {}", e);
        }
    }
}

/// A running utility command. Restores the previous utility flag when dropped.
pub struct UtilityScope<'s> {
    session: &'s mut Session,
    was_utility: bool,
}

impl Deref for UtilityScope<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for UtilityScope<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for UtilityScope<'_> {
    fn drop(&mut self) {
        self.session.is_utility = self.was_utility;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        catalog::DependencyCatalog,
        config::SchedulerConfig,
        locks::{InMemoryLockManager, LockManager},
        querylog::QueryStatus,
        tests::setup_tracing,
    };

    const SQL: &str = "UPDATE t SET x = x + 1";

    fn rel(raw: u32) -> RelId {
        RelId::new(raw)
    }

    fn coordinator() -> (Arc<Coordinator>, Arc<InMemoryLockManager>) {
        let catalog = Arc::new(DependencyCatalog::new());
        catalog.create_immv(rel(100), [rel(1), rel(2)]).unwrap();
        catalog.create_immv(rel(101), [rel(3)]).unwrap();
        let locks = Arc::new(InMemoryLockManager::new());
        let coordinator = Coordinator::init(
            SchedulerConfig::for_testing(),
            catalog.clone(),
            catalog,
            locks.clone(),
        )
        .unwrap();
        (Arc::new(coordinator), locks)
    }

    fn logged(session: &Session) -> usize {
        session.coordinator().schedule().snapshot().entries.len()
    }

    #[tokio::test]
    async fn test_outermost_query_is_admitted_and_released() {
        setup_tracing();
        let (coordinator, locks) = coordinator();
        let mut session = Session::new(coordinator, TxnId::new(1));

        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(1)]))
            .await
            .unwrap();
        assert!(session.is_admitted());
        assert!(locks.held_by_me(TxnId::new(1), rel(1)));
        assert!(locks.held_by_me(TxnId::new(1), rel(2)));
        let snapshot = session.coordinator().schedule().snapshot();
        assert_eq!(snapshot.status_of(TxnId::new(1)), Some(QueryStatus::Available));

        let run = session.executor_run();
        assert_eq!(run.nesting_level(), 1);
        run.complete().unwrap();

        assert!(!session.is_admitted());
        assert_eq!(session.nesting_level(), 0);
        assert_eq!(logged(&session), 0);
        assert_eq!(session.coordinator().schedule().snapshot().running_query, 0);
    }

    #[tokio::test]
    async fn test_nested_execution_is_passthrough() {
        let (coordinator, _locks) = coordinator();
        let mut session = Session::new(coordinator, TxnId::new(1));

        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(1)]))
            .await
            .unwrap();
        let mut outer = session.executor_run();
        // a function called by the outer query runs its own statement on t3
        outer
            .on_executor_start(&QueryDesc::new("SELECT * FROM t3", &[rel(3)]))
            .await
            .unwrap();
        assert_eq!(logged(&outer), 1, "nested start must not log");

        let inner = outer.executor_run();
        assert_eq!(inner.nesting_level(), 2);
        inner.complete().unwrap();
        assert_eq!(logged(&outer), 1, "nested run must not clean up");

        outer.complete().unwrap();
        assert_eq!(logged(&session), 0);
    }

    #[tokio::test]
    async fn test_failed_run_releases_admission() {
        let (coordinator, _locks) = coordinator();
        let mut session = Session::new(coordinator, TxnId::new(1));

        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(1)]))
            .await
            .unwrap();
        {
            let _run = session.executor_run();
            // unwinding out of the executor drops the run unfinished
        }
        assert!(!session.is_admitted());
        assert_eq!(session.nesting_level(), 0);
        assert_eq!(logged(&session), 0);

        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(3)]))
            .await
            .unwrap();
        session.executor_run().fail().unwrap();
        assert_eq!(logged(&session), 0);
    }

    #[tokio::test]
    async fn test_skipped_queries_are_not_logged() {
        let (coordinator, _locks) = coordinator();
        let mut session = Session::new(coordinator.clone(), TxnId::new(1));

        // empty source text
        session
            .on_executor_start(&QueryDesc::new("", &[rel(1)]))
            .await
            .unwrap();
        // explain only
        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(1)]).explain_only())
            .await
            .unwrap();
        // no table feeding an IMMV
        session
            .on_executor_start(&QueryDesc::new("SELECT 1 FROM t9", &[rel(9)]))
            .await
            .unwrap();
        assert!(!session.is_admitted());
        assert_eq!(logged(&session), 0);

        // parallel workers rely on their leader
        let mut worker = Session::parallel_worker(coordinator, TxnId::new(2));
        worker
            .on_executor_start(&QueryDesc::new(SQL, &[rel(1)]))
            .await
            .unwrap();
        assert!(!worker.is_admitted());
        assert_eq!(logged(&worker), 0);
        worker.executor_run().complete().unwrap();
    }

    #[tokio::test]
    async fn test_utility_commands_are_exempt() {
        let (coordinator, _locks) = coordinator();
        let mut session = Session::new(coordinator, TxnId::new(1));
        {
            let mut utility = session.utility();
            assert!(utility.is_utility());
            utility
                .on_executor_start(&QueryDesc::new("CREATE TABLE t4 AS SELECT * FROM t1", &[rel(1)]))
                .await
                .unwrap();
            assert!(!utility.is_admitted());
        }
        assert!(!session.is_utility(), "flag is restored when the utility ends");

        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(1)]))
            .await
            .unwrap();
        assert!(session.is_admitted());
    }

    #[tokio::test]
    async fn test_repeated_starts_share_admission() {
        let (coordinator, _locks) = coordinator();
        let mut session = Session::new(coordinator, TxnId::new(1));
        let rels = [rel(1)];
        let query = QueryDesc::new(SQL, &rels);

        session.on_executor_start(&query).await.unwrap();
        session.on_executor_start(&query).await.unwrap();
        assert_eq!(logged(&session), 1);

        session.executor_run().complete().unwrap();
        assert!(session.is_admitted(), "one run is still outstanding");
        session.executor_run().complete().unwrap();
        assert!(!session.is_admitted());
        assert_eq!(logged(&session), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repeated_start_on_new_table_is_coordinated() {
        setup_tracing();
        let (coordinator, locks) = coordinator();
        let (me, outsider) = (TxnId::new(1), TxnId::new(99));
        // a transaction outside of coordination holds t3
        assert!(locks.try_exclusive_lock(outsider, rel(3)));

        let mut session = Session::new(coordinator.clone(), me);
        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(1)]))
            .await
            .unwrap();

        let mut second = tokio::spawn(async move {
            let rels = [rel(3)];
            session
                .on_executor_start(&QueryDesc::new("UPDATE t3 SET y = 0", &rels))
                .await
                .map(|_| session)
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut second)
                .await
                .is_err(),
            "second start ran without the lock on t3"
        );
        assert!(!locks.held_by_me(me, rel(3)));

        locks.release_lock(outsider, rel(3));
        let mut session = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("second start should be admitted once t3 is free")
            .unwrap()
            .unwrap();
        assert!(locks.held_by_me(me, rel(3)));
        assert!(locks.held_by_me(me, rel(1)), "locks of the first start are kept");

        let snapshot = coordinator.schedule().snapshot();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].affected_tables, vec![rel(1), rel(3)]);
        assert_eq!(snapshot.status_of(me), Some(QueryStatus::Available));

        session.executor_run().complete().unwrap();
        assert!(session.is_admitted(), "one run is still outstanding");
        session.executor_run().complete().unwrap();
        assert_eq!(logged(&session), 0);
        assert_eq!(coordinator.schedule().snapshot().running_query, 0);
    }

    #[tokio::test]
    async fn test_abort_releases_admission_once() {
        let (coordinator, locks) = coordinator();
        let mut session = Session::new(coordinator, TxnId::new(1));

        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(3)]))
            .await
            .unwrap();
        session.on_transaction_abort().unwrap();
        assert_eq!(logged(&session), 0);
        // the host drops the aborted transaction's locks
        locks.release_all(TxnId::new(1));

        // repeated abort notifications are harmless
        session.on_subtransaction_abort().unwrap();
        session.on_transaction_abort().unwrap();
        assert_eq!(session.coordinator().schedule().snapshot().running_query, 0);

        session.begin_transaction(TxnId::new(2)).unwrap();
        session
            .on_executor_start(&QueryDesc::new(SQL, &[rel(3)]))
            .await
            .unwrap();
        assert_eq!(
            session
                .coordinator()
                .schedule()
                .snapshot()
                .status_of(TxnId::new(2)),
            Some(QueryStatus::Available)
        );
        // the abort hook fires while the run is still on the stack
        let mut run = session.executor_run();
        run.on_subtransaction_abort().unwrap();
        assert_eq!(logged(&run), 0);
        drop(run);
        assert_eq!(session.nesting_level(), 0);
    }
}
