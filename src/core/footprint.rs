use std::fmt;

use itertools::Itertools;

use crate::{
    core::RelId,
    errors::{AdmissionError, AdmissionResult},
};

/// The affected tables of a query: every relation in its plan that feeds at least one IMMV.
///
/// Kept in plan order without duplicates and bounded by the configured `max_affected_tables`.
/// An empty footprint means the query needs no coordination at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    tables: Vec<RelId>,
}

impl Footprint {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a footprint from the given tables, dropping duplicates and invalid ids.
    pub fn new(tables: impl IntoIterator<Item = RelId>, max: usize) -> AdmissionResult<Self> {
        let tables = tables
            .into_iter()
            .filter(RelId::is_valid)
            .unique()
            .collect_vec();
        if tables.len() > max {
            return Err(AdmissionError::FootprintOverflow {
                len: tables.len(),
                max,
            });
        }
        Ok(Self { tables })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = RelId> + '_ {
        self.tables.iter().copied()
    }

    pub fn contains(&self, table: RelId) -> bool {
        self.tables.contains(&table)
    }

    /// Table-level overlap is the unit of conflict between two queries.
    pub fn intersects(&self, other: &Footprint) -> bool {
        self.tables.iter().any(|t| other.contains(*t))
    }

    pub fn as_slice(&self) -> &[RelId] {
        &self.tables
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.tables.iter().join(", "))
    }
}
