//! Mock implementations for testing

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    AccountState, BlockBody, BlockHeader, BlockRef, BlockSink, BlockTrace, ChainNodeAdapter,
    ChainTip, EncodedBlock, ReceiptRecord, SyncError, SyncResult, SyncState,
};

/// One block of the mock chain, carrying everything the node adapter can be
/// asked for, including the full account state after the block.
#[derive(Debug, Clone)]
pub struct MockBlock {
    pub header: BlockHeader,
    pub body: BlockBody,
    pub receipts: Vec<ReceiptRecord>,
    pub trace: Option<BlockTrace>,
    pub state: BTreeMap<Address, AccountState>,
    pub total_difficulty: U256,
}

#[derive(Debug, Default)]
struct MockChainState {
    blocks: BTreeMap<u64, MockBlock>,
    connected: bool,
    trace_available: bool,
    fail_requests: u32,
}

/// Mock chain node adapter for testing. Programmable: blocks can be pushed,
/// replaced wholesale to simulate a reorg, and requests can be made to fail.
#[derive(Debug, Clone)]
pub struct MockChainNode {
    state: Arc<RwLock<MockChainState>>,
}

impl Default for MockChainNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainNode {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockChainState {
                blocks: BTreeMap::new(),
                connected: true,
                trace_available: true,
                fail_requests: 0,
            })),
        }
    }

    pub fn push_block(&self, block: MockBlock) {
        let mut state = self.state.write().unwrap();
        state.blocks.insert(block.header.number, block);
    }

    /// Replace every block at or above `from` with the given chain suffix.
    pub fn simulate_reorg(&self, from: u64, replacements: Vec<MockBlock>) {
        let mut state = self.state.write().unwrap();
        state.blocks.retain(|number, _| *number < from);
        for block in replacements {
            state.blocks.insert(block.header.number, block);
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.write().unwrap().connected = connected;
    }

    /// When false, `trace()` answers `Ok(None)` for every block.
    pub fn set_trace_available(&self, available: bool) {
        self.state.write().unwrap().trace_available = available;
    }

    /// Make the next `n` data requests fail with `NodeUnavailable`.
    pub fn fail_next_requests(&self, n: u32) {
        self.state.write().unwrap().fail_requests = n;
    }

    pub fn tip_number(&self) -> Option<u64> {
        self.state.read().unwrap().blocks.keys().next_back().copied()
    }

    pub fn block_hash(&self, number: u64) -> Option<B256> {
        self.state
            .read()
            .unwrap()
            .blocks
            .get(&number)
            .map(|b| b.header.hash)
    }

    pub fn with_block_mut(&self, number: u64, f: impl FnOnce(&mut MockBlock)) {
        let mut state = self.state.write().unwrap();
        if let Some(block) = state.blocks.get_mut(&number) {
            f(block);
        }
    }

    fn check_available(&self) -> SyncResult<()> {
        let mut state = self.state.write().unwrap();
        if !state.connected {
            return Err(SyncError::NodeUnavailable("node not connected".to_string()));
        }
        if state.fail_requests > 0 {
            state.fail_requests -= 1;
            return Err(SyncError::NodeUnavailable(
                "simulated transient failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainNodeAdapter for MockChainNode {
    async fn chain_tip(&self) -> SyncResult<ChainTip> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        let (number, block) = state
            .blocks
            .iter()
            .next_back()
            .ok_or_else(|| SyncError::NodeUnavailable("empty mock chain".to_string()))?;
        Ok(ChainTip {
            number: *number,
            hash: block.header.hash,
        })
    }

    async fn header_by_number(&self, number: u64) -> SyncResult<Option<BlockHeader>> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        Ok(state.blocks.get(&number).map(|b| b.header.clone()))
    }

    async fn block_by_number(&self, number: u64) -> SyncResult<Option<(BlockHeader, BlockBody)>> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        Ok(state
            .blocks
            .get(&number)
            .map(|b| (b.header.clone(), b.body.clone())))
    }

    async fn receipts(&self, number: u64) -> SyncResult<Vec<ReceiptRecord>> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        state
            .blocks
            .get(&number)
            .map(|b| b.receipts.clone())
            .ok_or_else(|| SyncError::NodeUnavailable(format!("block {} not found", number)))
    }

    async fn trace(&self, number: u64) -> SyncResult<Option<BlockTrace>> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        if !state.trace_available {
            return Ok(None);
        }
        Ok(state.blocks.get(&number).and_then(|b| b.trace.clone()))
    }

    async fn account_at(&self, address: Address, number: u64) -> SyncResult<AccountState> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        // Each mock block carries the full state after it; the nearest block
        // at or below the queried height answers.
        Ok(state
            .blocks
            .range(..=number)
            .next_back()
            .and_then(|(_, block)| block.state.get(&address).cloned())
            .unwrap_or_default())
    }

    async fn total_difficulty(&self, number: u64) -> SyncResult<Option<U256>> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        Ok(state.blocks.get(&number).map(|b| b.total_difficulty))
    }

    async fn is_connected(&self) -> bool {
        self.state.read().unwrap().connected
    }
}

#[derive(Debug, Default)]
struct MockSinkState {
    records: BTreeMap<u64, (B256, Vec<u8>)>,
    head: Option<SyncState>,
    write_counts: BTreeMap<u64, u32>,
    fail_writes: u32,
}

/// Mock sink for testing: an in-memory conforming [`BlockSink`] that also
/// counts writes per height so tests can assert exactly-once delivery.
#[derive(Debug, Clone)]
pub struct MockSink {
    state: Arc<Mutex<MockSinkState>>,
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockSinkState::default())),
        }
    }

    /// Make the next `n` writes fail with `SinkWrite`.
    pub async fn fail_next_writes(&self, n: u32) {
        self.state.lock().await.fail_writes = n;
    }

    /// Seed a persisted record directly, bypassing `write` accounting. Used
    /// to model state left behind by an earlier run.
    pub async fn seed_record(&self, number: u64, hash: B256, payload: Vec<u8>) {
        let mut state = self.state.lock().await;
        state.records.insert(number, (hash, payload));
        state.head = Some(SyncState {
            block_number: number,
            block_hash: hash,
        });
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn write_count(&self, number: u64) -> u32 {
        self.state
            .lock()
            .await
            .write_counts
            .get(&number)
            .copied()
            .unwrap_or(0)
    }

    pub async fn record_hash(&self, number: u64) -> Option<B256> {
        self.state
            .lock()
            .await
            .records
            .get(&number)
            .map(|(hash, _)| *hash)
    }

    pub async fn payload(&self, number: u64) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .records
            .get(&number)
            .map(|(_, payload)| payload.clone())
    }

    pub async fn persisted_numbers(&self) -> Vec<u64> {
        self.state.lock().await.records.keys().copied().collect()
    }
}

#[async_trait]
impl BlockSink for MockSink {
    async fn write(
        &mut self,
        block: &EncodedBlock,
        number: u64,
        hash: B256,
    ) -> SyncResult<SyncState> {
        let mut state = self.state.lock().await;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(SyncError::SinkWrite(
                "simulated sink write failure".to_string(),
            ));
        }
        state.records.insert(number, (hash, block.as_bytes().to_vec()));
        *state.write_counts.entry(number).or_insert(0) += 1;
        let head = SyncState {
            block_number: number,
            block_hash: hash,
        };
        state.head = Some(head);
        Ok(head)
    }

    async fn current_head(&self) -> SyncResult<Option<SyncState>> {
        Ok(self.state.lock().await.head)
    }

    async fn truncate_from(&mut self, number: u64) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state.records.retain(|n, _| *n < number);
        state.head = state
            .records
            .iter()
            .next_back()
            .map(|(n, (hash, _))| SyncState {
                block_number: *n,
                block_hash: *hash,
            });
        Ok(())
    }

    async fn recent_blocks(&self, limit: usize) -> SyncResult<Vec<BlockRef>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .rev()
            .take(limit)
            .map(|(number, (hash, _))| BlockRef {
                number: *number,
                hash: *hash,
            })
            .collect())
    }
}
