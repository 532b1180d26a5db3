//! # Adapter Traits for the Ingestion Pipeline
//!
//! The pipeline is modular around two async adapter traits plus one
//! synchronous read surface:
//!
//! - [`ChainNodeAdapter`] abstracts the upstream node: headers, bodies,
//!   receipts, traces, historical account state, and the canonical chain
//!   tip. The node is the source of truth for canonical chain state; the
//!   pipeline never validates consensus itself.
//! - [`BlockSink`] abstracts durable delivery of encoded blocks. A sink owns
//!   the [`SyncState`] checkpoint for its stream and only advances it after a
//!   payload is fully committed. The message-topic and relational variants
//!   both conform to this contract.
//! - [`StateView`] is the synchronous, immutable snapshot the token
//!   classification engine probes against. A probe's execution frame is
//!   layered copy-on-write on top of a `StateView`; nothing a probe does can
//!   leak back into it.
//!
//! All async traits use `async_trait` and are `Send + Sync` so a tracker
//! task can share the node connection read-only across streams while each
//! sink remains exclusively owned by its stream.

use crate::{
    AccountState, BlockBody, BlockHeader, BlockRef, BlockTrace, ChainTip, EncodedBlock,
    ReceiptRecord, SyncResult, SyncState,
};
use alloy_primitives::{Address, Bytes, U256};
use async_trait::async_trait;

/// Read-only access to a running chain node.
///
/// Implementations should surface [`SyncError::NodeUnavailable`] for
/// transient connectivity or data-availability failures; the tracker retries
/// those with backoff.
///
/// [`SyncError::NodeUnavailable`]: crate::SyncError::NodeUnavailable
#[async_trait]
pub trait ChainNodeAdapter: Send + Sync {
    /// Current canonical chain head.
    async fn chain_tip(&self) -> SyncResult<ChainTip>;

    /// Canonical header at a height. `None` when the height is beyond the
    /// node's chain. Used by the safe-sync check and the mid-stream reorg
    /// guard.
    async fn header_by_number(&self, number: u64) -> SyncResult<Option<BlockHeader>>;

    /// Header and body at a height.
    async fn block_by_number(&self, number: u64) -> SyncResult<Option<(BlockHeader, BlockBody)>>;

    /// Receipts for the block at a height, aligned 1:1 with its
    /// transactions.
    async fn receipts(&self, number: u64) -> SyncResult<Vec<ReceiptRecord>>;

    /// Execution trace for the block at a height. `Ok(None)` means the node
    /// cannot serve trace data; the assembler degrades gracefully instead of
    /// failing the block.
    async fn trace(&self, number: u64) -> SyncResult<Option<BlockTrace>>;

    /// Account state (balance, nonce, code) as of the given block height.
    /// Accounts that do not exist at that height resolve to the default
    /// (zero) state.
    async fn account_at(&self, address: Address, number: u64) -> SyncResult<AccountState>;

    /// Cumulative difficulty at a height, when the node tracks it.
    async fn total_difficulty(&self, number: u64) -> SyncResult<Option<U256>>;

    /// Lightweight connectivity check. Never errors.
    async fn is_connected(&self) -> bool;
}

/// Durable, resumable delivery target for encoded blocks.
///
/// One sink instance serves exactly one logical stream. The checkpoint is
/// owned by the sink: `write` advances it atomically with the payload,
/// `truncate_from` rewinds it, and nothing else mutates it.
#[async_trait]
pub trait BlockSink: Send + Sync {
    /// Persist one encoded block and advance the checkpoint. On partial
    /// failure the checkpoint must still describe the last block that was
    /// fully committed.
    async fn write(
        &mut self,
        block: &EncodedBlock,
        number: u64,
        hash: alloy_primitives::B256,
    ) -> SyncResult<SyncState>;

    /// Last committed checkpoint, or `None` if the stream has never been
    /// written to.
    async fn current_head(&self) -> SyncResult<Option<SyncState>>;

    /// Remove (or mark superseded) every record at or above `number` and
    /// rewind the checkpoint accordingly. Safe to call on an empty stream.
    async fn truncate_from(&mut self, number: u64) -> SyncResult<()>;

    /// Up to `limit` most recently persisted (number, hash) pairs, newest
    /// first. Feeds the safe-sync window.
    async fn recent_blocks(&self, limit: usize) -> SyncResult<Vec<BlockRef>>;
}

/// Basic account data as seen by a classification probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeAccount {
    pub balance: U256,
    pub nonce: u64,
    pub code: Bytes,
}

/// Immutable state snapshot for probe execution. Reads only; the probe's
/// copy-on-write frame absorbs all writes.
pub trait StateView: Send + Sync {
    fn basic(&self, address: Address) -> Option<ProbeAccount>;

    /// Storage slot value; snapshots that carry no storage resolve to zero.
    fn storage(&self, address: Address, slot: U256) -> U256;
}
