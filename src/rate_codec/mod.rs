//! Compact on-chain rate representation
//!
//! Rates live on-chain as a full-precision base rate per token plus a signed
//! one-byte delta in 0.1% steps. Deltas are packed 14 to a word, at the slot
//! the conversion-rates contract assigned to each token.

pub mod bulk;
pub mod compact;
pub mod errors;
pub mod plan;
pub mod token_index;

pub use bulk::{build_compact_bulk, BulkWord, CompactBulk, SLOTS_PER_BULK};
pub use compact::{from_compact, to_compact, CompactRate, COMPACT_RESOLUTION};
pub use errors::CodecError;
pub use plan::{RateTarget, SetRatePlan};
pub use token_index::{TokenIndexTable, TokenSlot};
