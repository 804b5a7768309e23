use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use immv_admission::{
    AdmissionResult, Coordinator, DependencyCatalog, InMemoryLockManager, QueryDesc, RelId,
    SchedulerConfig, Session, TxnId,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ORDERS: RelId = RelId::new(1);
const CUSTOMERS: RelId = RelId::new(2);
const EVENTS: RelId = RelId::new(3);
const ORDER_TOTALS: RelId = RelId::new(100);
const EVENT_COUNTS: RelId = RelId::new(101);

/// One client session running a single write statement in its own transaction.
async fn run_session(
    coordinator: Arc<Coordinator>,
    locks: Arc<InMemoryLockManager>,
    txn: TxnId,
    sql: &'static str,
    relations: &'static [RelId],
) -> AdmissionResult<()> {
    let mut session = Session::new(coordinator, txn);
    session
        .on_executor_start(&QueryDesc::new(sql, relations))
        .await?;
    let run = session.executor_run();
    // pretend to apply the statement and maintain the views
    tokio::time::sleep(Duration::from_millis(5)).await;
    run.complete()?;

    // commit
    let released = locks.release_all(txn);
    info!(%txn, released, "committed");
    Ok(())
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let catalog = Arc::new(DependencyCatalog::new());
    // order_totals = orders JOIN customers, event_counts = events
    if let Err(e) = catalog
        .create_immv(ORDER_TOTALS, [ORDERS, CUSTOMERS])
        .and_then(|_| catalog.create_immv(EVENT_COUNTS, [EVENTS]))
    {
        error!("could not set up the catalog: {}", e);
        return;
    }
    let locks = Arc::new(InMemoryLockManager::new());
    let coordinator = match Coordinator::init(
        SchedulerConfig::default(),
        catalog.clone(),
        catalog,
        locks.clone(),
    ) {
        Ok(coordinator) => Arc::new(coordinator),
        Err(e) => {
            error!("could not initialize the coordinator: {}", e);
            return;
        }
    };

    let statements: [(&'static str, &'static [RelId]); 4] = [
        ("INSERT INTO orders VALUES (1, 7, 30)", &[ORDERS]),
        ("UPDATE customers SET name = 'b' WHERE id = 7", &[CUSTOMERS]),
        ("INSERT INTO events VALUES ('login')", &[EVENTS]),
        ("DELETE FROM orders WHERE customer = 7", &[ORDERS, CUSTOMERS]),
    ];
    let sessions = statements.into_iter().enumerate().map(|(i, (sql, relations))| {
        tokio::spawn(run_session(
            coordinator.clone(),
            locks.clone(),
            TxnId::new(i as u64 + 1),
            sql,
            relations,
        ))
    });

    for result in join_all(sessions).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("session failed: {}", e),
            Err(e) => error!("session panicked: {}", e),
        }
    }
    let snapshot = coordinator.schedule().snapshot();
    info!(
        running = snapshot.running_query,
        logged = snapshot.entries.len(),
        "all sessions done"
    );
}
