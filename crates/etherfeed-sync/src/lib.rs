//! # etherfeed-sync
//!
//! Core of the etherfeed pipeline: ingests blocks from a running EVM node,
//! enriches each one with derived state (balance deltas, touched accounts,
//! token-standard classification of newly-created contracts), serializes the
//! result into a compact binary buffer, and delivers it to a pluggable sink
//! with resumable, reorg-safe semantics.
//!
//! The adapter traits in [`traits`] decouple the pipeline from the concrete
//! node and sink implementations; [`sync::SyncTracker`] is the per-stream
//! control loop that ties everything together.

pub mod assemble;
pub mod classify;
pub mod encode;
pub mod error;
pub mod genesis;
pub mod sync;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use assemble::*;
pub use classify::*;
pub use encode::*;
pub use error::*;
pub use genesis::*;
pub use sync::*;
pub use traits::*;
pub use types::*;
