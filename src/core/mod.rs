pub mod footprint;
pub mod primitives;

pub use footprint::Footprint;
pub use primitives::{RelId, TxnId};
