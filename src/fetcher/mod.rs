//! Fetch orchestrator
//!
//! One periodic task per domain, each persisting an immutable snapshot per
//! cycle. A failing source marks its part of the snapshot invalid instead
//! of aborting the cycle.

pub mod block_state;
pub mod errors;
pub mod orchestrator;

pub use block_state::BlockState;
pub use errors::FetchError;
pub use orchestrator::Fetcher;
