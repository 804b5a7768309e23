use serde::{Deserialize, Serialize};

/// Identifier of a relation known to the host catalog: base tables and IMMVs share this space.
///
/// `0` is reserved as the invalid relation id, mirroring how the host never hands out id zero.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    From,
    Into,
    Serialize,
    Deserialize,
)]
pub struct RelId(u32);

impl RelId {
    pub const INVALID: Self = Self(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Identifier of the transaction that owns a coordinated query. Stable for the lifetime of the
/// query, and the key of its entry in the query log.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    From,
    Into,
    Serialize,
    Deserialize,
)]
pub struct TxnId(u64);

impl TxnId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}
