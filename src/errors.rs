use crate::core::{RelId, TxnId};

#[derive(Debug, Display, Error)]
pub enum AdmissionError {
    // -- Sizing Errors --
    #[display(
        "Query log is full: all {} slots are in use, raise `max_query_num` to admit more concurrent queries.",
        capacity
    )]
    QueryLogFull { capacity: usize },
    #[display(
        "Footprint overflow: query touches {} affected tables, but at most {} are supported.",
        len, max
    )]
    FootprintOverflow { len: usize, max: usize },

    // -- Protocol Errors --
    #[display("Transaction {} already owns a logged query.", _0)]
    AlreadyLogged(#[error(not(source))] TxnId),
    #[display("Logged query of transaction {} vanished while waiting for admission.", _0)]
    EntryVanished(#[error(not(source))] TxnId),
    #[display("Scheduler invariant violated: {}", _0)]
    InvariantViolation(#[error(not(source))] String),

    // -- Configuration Errors --
    #[display("Invalid scheduler configuration: {}", _0)]
    InvalidConfig(#[error(not(source))] &'static str),
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[display("Relation {} is already registered as an IMMV.", _0)]
    ImmvAlreadyExists(#[error(not(source))] RelId),
    #[display("IMMV {} must depend on at least one base table.", _0)]
    EmptyDefinition(#[error(not(source))] RelId),
    #[display("IMMV {} cannot depend on itself.", _0)]
    SelfReference(#[error(not(source))] RelId),
    #[display("Invalid relation id: 0 is reserved.")]
    InvalidRelation,
}
