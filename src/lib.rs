//! Admission scheduling for incrementally maintained materialized views (IMMVs).
//!
//! A write to a base table of an IMMV must update the view in the same transaction. Two
//! concurrent writers whose views share base tables could otherwise see each other's half-applied
//! deltas, so every such query goes through a gate first:
//!
//! - the [`schedule`] decides which logged queries may proceed, so that no two proceeding queries
//!   share an affected table,
//! - the [`admission`] protocol then takes exclusive locks on the whole lock closure of the query,
//!   all or nothing, and retries after a backoff on conflict,
//! - the [`session`] hooks decide which executions are coordinated at all and release the
//!   admission again on every exit path.
//!
//! The host database is reached through three traits: [`AffectedTableMap`] and [`ImmvRegistry`]
//! for the catalog, [`LockManager`] for relation locks. [`DependencyCatalog`] and
//! [`InMemoryLockManager`] implement them in memory.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod admission;
pub mod catalog;
pub mod config;
pub mod core;
pub mod errors;
pub mod locks;
pub mod querylog;
pub mod schedule;
pub mod session;

pub use admission::{Admission, Coordinator, HeldLocks};
pub use catalog::{AffectedTableMap, DependencyCatalog, ImmvRegistry, RefedImmv};
pub use config::{BackoffConfig, SchedulerConfig};
pub use crate::core::{Footprint, RelId, TxnId};
pub use errors::{AdmissionError, AdmissionResult, CatalogError};
pub use locks::{InMemoryLockManager, LockManager};
pub use querylog::QueryStatus;
pub use session::{QueryDesc, Session};
