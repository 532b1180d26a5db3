//! Common types for the etherfeed ingestion pipeline

use std::collections::BTreeSet;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Canonical block header fields retained for enrichment and delivery.
/// Immutable once retrieved from the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: u64,
    pub timestamp: u64,
    pub beneficiary: Address,
    pub difficulty: U256,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee_per_gas: Option<u64>,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
}

/// A transaction as carried in a block body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: B256,
    pub from: Address,
    /// `None` for contract-creation transactions.
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: U256,
    pub nonce: u64,
    pub input: Bytes,
}

/// Ommer (uncle) header reference carried in a block body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmmerHeader {
    pub hash: B256,
    pub number: u64,
    pub beneficiary: Address,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<TransactionRecord>,
    pub ommers: Vec<OmmerHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Execution receipt, aligned 1:1 with the body's transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub status: bool,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    /// Set when the transaction created a contract.
    pub contract_address: Option<Address>,
    pub logs: Vec<LogRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RewardKind {
    Block,
    Ommer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub beneficiary: Address,
    pub amount: U256,
    pub kind: RewardKind,
}

/// A value-bearing internal (message) call reported by the node's trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalCall {
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfDestructRecord {
    pub contract: Address,
    pub refund_address: Address,
    pub balance: U256,
}

/// Per-block execution trace. May be empty for a block with no recorded
/// events; absence of the trace altogether is modeled as `Option<BlockTrace>`
/// on [`EnrichedBlock`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTrace {
    pub rewards: Vec<RewardRecord>,
    pub internal_calls: Vec<InternalCall>,
    pub created_contracts: Vec<Address>,
    pub self_destructs: Vec<SelfDestructRecord>,
}

impl BlockTrace {
    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
            && self.internal_calls.is_empty()
            && self.created_contracts.is_empty()
            && self.self_destructs.is_empty()
    }
}

/// Post-block snapshot of an account whose state changed in this block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub address: Address,
    pub balance: U256,
    pub nonce: u64,
    pub code: Bytes,
    pub code_hash: B256,
    /// Whether this address was created as a contract by this block.
    pub created_contract: bool,
}

/// Why a balance changed. Ordered so delta emission is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BalanceChangeCause {
    /// Genesis pre-fund from the allocation list.
    Allocation,
    ValueTransfer,
    GasFee,
    Reward,
    SelfDestructRefund,
}

/// One (account, old balance, new balance, cause) record. An account appears
/// once per independent cause; a net-zero change is still recorded with equal
/// balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub address: Address,
    pub old_balance: U256,
    pub new_balance: U256,
    pub cause: BalanceChangeCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenInterface {
    Erc20,
    Erc165,
    Erc721,
    Erc777,
    Erc1155,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Erc20Metadata {
    pub decimals: Option<u8>,
}

/// Interfaces a newly-created contract was observed to implement. Overlapping
/// matches are preserved as a set; the set may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClassification {
    pub address: Address,
    pub interfaces: BTreeSet<TokenInterface>,
    pub erc20: Option<Erc20Metadata>,
}

/// The unit of work and of delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedBlock {
    pub header: BlockHeader,
    pub body: BlockBody,
    pub receipts: Vec<ReceiptRecord>,
    /// Cumulative chain weight; absent for blocks computed outside a live
    /// chain context.
    pub total_difficulty: Option<U256>,
    /// `None` when the node could not serve trace data for this block.
    pub trace: Option<BlockTrace>,
    /// Ordered by address.
    pub touched_accounts: Vec<AccountSnapshot>,
    pub balance_deltas: Vec<BalanceDelta>,
    pub token_classifications: Vec<TokenClassification>,
}

/// Per-stream checkpoint: the last block durably delivered to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub block_number: u64,
    pub block_hash: B256,
}

/// Current chain tip as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub number: u64,
    pub hash: B256,
}

/// A (number, hash) pair; the element of the safe-sync window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: B256,
}

/// Read-only account state served by the node as of a historical block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: U256,
    pub nonce: u64,
    pub code: Bytes,
}

/// Configuration for one sync stream. Treated as an immutable snapshot for
/// the lifetime of the tracker.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Resumption point when the sink has never been written to.
    pub start_block: u64,
    /// Optional exit block height (exclusive upper bound on processing).
    pub exit_at: Option<u64>,
    /// Number of persisted blocks re-verified against the node at startup.
    pub safe_sync_window: usize,
    /// How many times the safe-sync check may truncate and re-check before
    /// the stream surfaces a fatal reorg error.
    pub safe_sync_retries: u32,
    /// How far the resumption point is rolled back when a mid-stream parent
    /// hash mismatch is detected.
    pub reorg_rewind: u64,
    /// Sleep between chain tip polls while waiting at the live tip.
    pub poll_interval: Duration,
    /// Initial backoff after a transient node failure; doubled up to the cap.
    pub node_retry_base: Duration,
    pub node_retry_cap: Duration,
    /// Bounded retries for a failed sink write; exhaustion is fatal for the
    /// stream.
    pub sink_write_retries: u32,
    /// How long `stop()` waits for an in-flight block cycle to finish.
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            exit_at: None,
            safe_sync_window: 256,
            safe_sync_retries: 8,
            reorg_rewind: 64,
            poll_interval: Duration::from_secs(3),
            node_retry_base: Duration::from_millis(500),
            node_retry_cap: Duration::from_secs(8),
            sink_write_retries: 5,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Tracker lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    Idle,
    SafeSyncChecking,
    /// Historical catch-up: behind the node's chain head.
    Syncing,
    /// At the live tip, waiting for new blocks.
    Following,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TrackerStatus {
    pub phase: TrackerPhase,
    pub last_persisted: Option<SyncState>,
    pub tip_number: Option<u64>,
    pub blocks_behind: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_operational_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.start_block, 0);
        assert_eq!(config.safe_sync_window, 256);
        assert_eq!(config.sink_write_retries, 5);
        assert!(config.exit_at.is_none());
    }

    #[test]
    fn cause_ordering_is_stable() {
        let mut causes = BTreeSet::new();
        causes.insert(BalanceChangeCause::Reward);
        causes.insert(BalanceChangeCause::ValueTransfer);
        causes.insert(BalanceChangeCause::GasFee);
        let ordered: Vec<_> = causes.into_iter().collect();
        assert_eq!(
            ordered,
            vec![
                BalanceChangeCause::ValueTransfer,
                BalanceChangeCause::GasFee,
                BalanceChangeCause::Reward,
            ]
        );
    }

    #[test]
    fn empty_trace_is_empty() {
        assert!(BlockTrace::default().is_empty());
    }
}
