//! # IMMV Dependency Catalog
//!
//! The scheduler never resolves view definitions itself. It consumes two read-only views of the
//! host catalog:
//!
//! - [`AffectedTableMap`]: for a base table, the IMMVs depending on it and each IMMV's full
//!   closure of base tables.
//! - [`ImmvRegistry`]: the set of all known IMMVs, used for held-lock diagnostics only.
//!
//! [`DependencyCatalog`] is an in-memory implementation of both, kept up to date by the catalog
//! layer when views are created or dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;
use parking_lot::RwLock;

use crate::{
    core::{Footprint, RelId},
    errors::CatalogError,
};

/// An IMMV referenced through some base table, with every base table that IMMV depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefedImmv {
    pub immv: RelId,
    pub refed_tables: Vec<RelId>,
}

pub trait AffectedTableMap: Send + Sync {
    /// Returns every IMMV that depends on `table`. Empty when `table` feeds no IMMV.
    fn lookup(&self, table: RelId) -> Vec<RefedImmv>;

    fn is_affected(&self, table: RelId) -> bool {
        !self.lookup(table).is_empty()
    }
}

pub trait ImmvRegistry: Send + Sync {
    fn immvs(&self) -> Result<Vec<RelId>, CatalogError>;
}

/// Collects the base tables that must be locked for a footprint: the union of the closures of
/// every IMMV referenced through any table of the footprint, in discovery order.
pub fn lock_closure(map: &dyn AffectedTableMap, footprint: &Footprint) -> Vec<RelId> {
    footprint
        .iter()
        .flat_map(|table| map.lookup(table))
        .flat_map(|refed| refed.refed_tables)
        .unique()
        .collect_vec()
}

#[derive(Debug, Default)]
struct CatalogState {
    /// `immv` -> its base tables
    immvs: BTreeMap<RelId, Vec<RelId>>,
    /// `base table` -> IMMVs depending on it
    dependents: HashMap<RelId, BTreeSet<RelId>>,
}

/// In-memory IMMV dependency catalog.
#[derive(Debug, Default)]
pub struct DependencyCatalog {
    inner: RwLock<CatalogState>,
}

impl DependencyCatalog {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `immv` as depending on `base_tables`.
    pub fn create_immv(
        &self,
        immv: RelId,
        base_tables: impl IntoIterator<Item = RelId>,
    ) -> Result<(), CatalogError> {
        if !immv.is_valid() {
            return Err(CatalogError::InvalidRelation);
        }
        let base_tables = base_tables.into_iter().unique().collect_vec();
        if base_tables.is_empty() {
            return Err(CatalogError::EmptyDefinition(immv));
        }
        if base_tables.iter().any(|t| !t.is_valid()) {
            return Err(CatalogError::InvalidRelation);
        }
        if base_tables.contains(&immv) {
            return Err(CatalogError::SelfReference(immv));
        }

        let mut state = self.inner.write();
        if state.immvs.contains_key(&immv) {
            return Err(CatalogError::ImmvAlreadyExists(immv));
        }
        for table in &base_tables {
            state.dependents.entry(*table).or_default().insert(immv);
        }
        debug!(%immv, tables = %base_tables.iter().join(" "), "registered IMMV");
        state.immvs.insert(immv, base_tables);
        Ok(())
    }

    /// Forgets `immv`, e.g. when its relation is dropped. Returns `false` if it was not an IMMV.
    pub fn drop_immv(&self, immv: RelId) -> bool {
        let mut state = self.inner.write();
        let Some(base_tables) = state.immvs.remove(&immv) else {
            return false;
        };
        for table in base_tables {
            if let Some(dependents) = state.dependents.get_mut(&table) {
                dependents.remove(&immv);
                if dependents.is_empty() {
                    state.dependents.remove(&table);
                }
            }
        }
        debug!(%immv, "dropped IMMV");
        true
    }

    pub fn is_immv(&self, rel: RelId) -> bool {
        self.inner.read().immvs.contains_key(&rel)
    }
}

impl AffectedTableMap for DependencyCatalog {
    fn lookup(&self, table: RelId) -> Vec<RefedImmv> {
        let state = self.inner.read();
        let Some(dependents) = state.dependents.get(&table) else {
            return Vec::new();
        };
        dependents
            .iter()
            .filter_map(|immv| {
                state.immvs.get(immv).map(|tables| RefedImmv {
                    immv: *immv,
                    refed_tables: tables.clone(),
                })
            })
            .collect()
    }
}

impl ImmvRegistry for DependencyCatalog {
    fn immvs(&self) -> Result<Vec<RelId>, CatalogError> {
        Ok(self.inner.read().immvs.keys().copied().collect())
    }
}
