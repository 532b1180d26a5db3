//! # Synchronization Tracker
//!
//! The control loop of the pipeline. One [`SyncTracker`] drives one sink
//! stream from its resumption point to the node's chain head and then keeps
//! following the live tip, delivering every block exactly once under normal
//! operation:
//!
//! 1. On `start()`, the tracker reads the sink's checkpoint. If one exists
//!    it runs the **safe-sync check**: the last `safe_sync_window` persisted
//!    (number, hash) pairs are compared against the node's canonical headers,
//!    and on any mismatch the sink is truncated to just below the lowest
//!    mismatching height before the check repeats (bounded by
//!    `safe_sync_retries`). With no checkpoint, syncing starts from the
//!    configured start block.
//! 2. In steady state the next block is always `last persisted + 1`. Before
//!    assembling it, the fetched header's parent hash is validated against
//!    the last persisted hash; a mismatch is a mid-stream reorg, handled by
//!    rewinding a fixed safety margin and re-running the safe-sync logic.
//! 3. Assembly and delivery for a given height are strictly sequential; the
//!    checkpoint only advances once the sink reports the payload durable.
//!
//! `stop()` is cooperative: it is observed between block cycles and while
//! waiting at the tip, and an in-flight sink write is allowed to finish
//! (bounded by the shutdown timeout) rather than being aborted with an
//! ambiguous checkpoint.
//!
//! Multiple streams run as independent [`PipelineRegistry`] tasks sharing
//! only the read-only node connection; a fatal error on one stream never
//! stops another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::sleep;

use async_trait::async_trait;

use crate::{
    encode_block, BlockAssembler, BlockSink, ChainNodeAdapter, ChainTip, GenesisAlloc,
    SyncConfig, SyncError, SyncResult, SyncState, TokenClassifier, TrackerPhase, TrackerStatus,
};

/// Drives one sink stream against one node connection.
pub struct SyncTracker<N, S>
where
    N: ChainNodeAdapter,
    S: BlockSink,
{
    node: Arc<N>,
    sink: Arc<RwLock<S>>,
    assembler: Arc<BlockAssembler<N>>,
    config: SyncConfig,
    is_running: Arc<AtomicBool>,
    phase: Arc<RwLock<TrackerPhase>>,
    last_persisted: Arc<RwLock<Option<SyncState>>>,
    stop_notify: Arc<Notify>,
    /// Held for the duration of one assemble/encode/write cycle so `stop()`
    /// can wait for in-flight work.
    cycle_lock: Arc<Mutex<()>>,
}

impl<N, S> SyncTracker<N, S>
where
    N: ChainNodeAdapter + 'static,
    S: BlockSink + 'static,
{
    pub fn new(node: N, sink: S, config: SyncConfig) -> Self {
        let node = Arc::new(node);
        let assembler = Arc::new(BlockAssembler::new(node.clone()));
        Self {
            node,
            sink: Arc::new(RwLock::new(sink)),
            assembler,
            config,
            is_running: Arc::new(AtomicBool::new(false)),
            phase: Arc::new(RwLock::new(TrackerPhase::Idle)),
            last_persisted: Arc::new(RwLock::new(None)),
            stop_notify: Arc::new(Notify::new()),
            cycle_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Configure the genesis allocation used to synthesize block 0.
    pub fn with_genesis_alloc(mut self, alloc: GenesisAlloc) -> Self {
        let assembler = BlockAssembler::new(self.node.clone()).with_genesis_alloc(alloc);
        self.assembler = Arc::new(assembler);
        self
    }

    pub fn with_classifier(mut self, classifier: TokenClassifier) -> Self {
        let assembler = BlockAssembler::new(self.node.clone()).with_classifier(classifier);
        self.assembler = Arc::new(assembler);
        self
    }

    pub fn node(&self) -> &Arc<N> {
        &self.node
    }

    pub fn sink(&self) -> &Arc<RwLock<S>> {
        &self.sink
    }

    /// Run the stream to completion: until `exit_at`, a fatal error, or
    /// `stop()`.
    pub async fn start(&self) -> SyncResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Config("tracker is already running".to_string()));
        }
        self.set_phase(TrackerPhase::SafeSyncChecking).await;
        info!("starting sync tracker");

        let result = self.run().await;

        self.is_running.store(false, Ordering::SeqCst);
        self.set_phase(TrackerPhase::Stopped).await;
        if let Err(e) = &result {
            error!("sync tracker halted: {}", e);
        } else {
            info!("sync tracker finished");
        }
        result
    }

    /// Signal cooperative cancellation and wait for any in-flight cycle to
    /// finish, up to the shutdown timeout.
    pub async fn stop(&self) -> SyncResult<()> {
        info!("stopping sync tracker");
        self.set_phase(TrackerPhase::Stopping).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        match tokio::time::timeout(self.config.shutdown_timeout, self.cycle_lock.lock()).await {
            Ok(_guard) => {}
            Err(_) => warn!(
                "in-flight block cycle did not finish within {:?}",
                self.config.shutdown_timeout
            ),
        }
        self.set_phase(TrackerPhase::Stopped).await;
        Ok(())
    }

    pub async fn status(&self) -> TrackerStatus {
        let phase = *self.phase.read().await;
        let last_persisted = *self.last_persisted.read().await;
        let tip_number = self.node.chain_tip().await.ok().map(|tip| tip.number);
        let blocks_behind = match (tip_number, last_persisted) {
            (Some(tip), Some(last)) => tip.saturating_sub(last.block_number),
            (Some(tip), None) => tip.saturating_sub(self.config.start_block) + 1,
            _ => 0,
        };
        TrackerStatus {
            phase,
            last_persisted,
            tip_number,
            blocks_behind,
        }
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    async fn set_phase(&self, phase: TrackerPhase) {
        *self.phase.write().await = phase;
    }

    async fn mirror_last(&self, last: Option<SyncState>) {
        *self.last_persisted.write().await = last;
    }

    async fn run(&self) -> SyncResult<()> {
        if !self.node.is_connected().await {
            return Err(SyncError::NodeUnavailable(
                "node is not connected".to_string(),
            ));
        }

        let mut last = self.safe_sync().await?;
        self.mirror_last(last).await;
        match last {
            Some(state) => info!(
                "resuming from checkpoint at block {} ({})",
                state.block_number, state.block_hash
            ),
            None => info!("empty stream; starting from block {}", self.config.start_block),
        }

        loop {
            if !self.is_running() {
                break;
            }

            let next = last
                .map(|state| state.block_number + 1)
                .unwrap_or(self.config.start_block);

            if let Some(exit_at) = self.config.exit_at {
                if next >= exit_at {
                    info!("reached exit height {}", exit_at);
                    break;
                }
            }

            let tip = match self.fetch_tip().await {
                Ok(tip) => tip,
                Err(_) if !self.is_running() => break,
                Err(e) => return Err(e),
            };

            if next > tip.number {
                self.set_phase(TrackerPhase::Following).await;
                debug!("at tip {}; waiting for new blocks", tip.number);
                self.sleep_or_stop(self.config.poll_interval).await;
                continue;
            }
            self.set_phase(if tip.number > next {
                TrackerPhase::Syncing
            } else {
                TrackerPhase::Following
            })
            .await;

            let header = match self.fetch_header(next).await {
                Ok(Some(header)) => header,
                Ok(None) => {
                    // Tip said the block exists but the node no longer
                    // serves it; likely a reorg shrank the chain. Re-check.
                    warn!("block {} vanished between tip and fetch", next);
                    self.sleep_or_stop(self.config.node_retry_base).await;
                    continue;
                }
                Err(_) if !self.is_running() => break,
                Err(e) => return Err(e),
            };

            // Mid-stream reorg guard: the incoming block must build on what
            // we last persisted.
            if let Some(prev) = last {
                if header.parent_hash != prev.block_hash {
                    warn!(
                        "parent hash mismatch at block {}: expected {}, node reports {}; rewinding",
                        next, prev.block_hash, header.parent_hash
                    );
                    let floor = prev.block_number.saturating_sub(self.config.reorg_rewind);
                    {
                        let mut sink = self.sink.write().await;
                        sink.truncate_from(floor + 1).await?;
                    }
                    self.set_phase(TrackerPhase::SafeSyncChecking).await;
                    last = self.safe_sync().await?;
                    self.mirror_last(last).await;
                    continue;
                }
            }

            let cycle = self.cycle_lock.lock().await;

            let block = match self.assembler.assemble(next).await {
                Ok(block) => block,
                Err(e) if e.is_transient() => {
                    drop(cycle);
                    warn!("assembly of block {} deferred: {}", next, e);
                    self.sleep_or_stop(self.config.node_retry_base).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let encoded = encode_block(&block)?;

            let mut attempt = 0u32;
            let state = loop {
                let written = {
                    let mut sink = self.sink.write().await;
                    sink.write(&encoded, next, header.hash).await
                };
                match written {
                    Ok(state) => break state,
                    Err(e) if attempt < self.config.sink_write_retries => {
                        attempt += 1;
                        warn!(
                            "sink write for block {} failed (attempt {}): {}",
                            next, attempt, e
                        );
                        sleep(self.backoff(attempt)).await;
                    }
                    Err(e) => {
                        error!("sink write retries exhausted at block {}", next);
                        return Err(e);
                    }
                }
            };
            drop(cycle);

            last = Some(state);
            self.mirror_last(last).await;
            info!("delivered block {} ({})", next, header.hash);
        }

        Ok(())
    }

    /// Compare the persisted window against the canonical chain, truncating
    /// below the lowest mismatch until the window verifies. Returns the
    /// checkpoint to resume from, or `None` for an empty stream.
    async fn safe_sync(&self) -> SyncResult<Option<SyncState>> {
        for _ in 0..=self.config.safe_sync_retries {
            let head = { self.sink.read().await.current_head().await? };
            let Some(head) = head else {
                return Ok(None);
            };
            let window = {
                self.sink
                    .read()
                    .await
                    .recent_blocks(self.config.safe_sync_window)
                    .await?
            };

            let mut lowest_mismatch: Option<u64> = None;
            for stored in &window {
                let canonical = match self.fetch_header(stored.number).await {
                    Ok(header) => header,
                    Err(e) => return Err(e),
                };
                let matches = canonical
                    .map(|header| header.hash == stored.hash)
                    .unwrap_or(false);
                if !matches {
                    lowest_mismatch =
                        Some(lowest_mismatch.map_or(stored.number, |m| m.min(stored.number)));
                }
            }

            match lowest_mismatch {
                None => {
                    debug!(
                        "safe-sync window verified ({} blocks up to {})",
                        window.len(),
                        head.block_number
                    );
                    return Ok(Some(head));
                }
                Some(lowest) => {
                    warn!(
                        "reorg detected while offline: persisted hash at {} no longer canonical; truncating",
                        lowest
                    );
                    let mut sink = self.sink.write().await;
                    sink.truncate_from(lowest).await?;
                }
            }
        }
        Err(SyncError::Reorg(
            "safe-sync check kept finding mismatches; giving up".to_string(),
        ))
    }

    async fn fetch_tip(&self) -> SyncResult<ChainTip> {
        let mut attempt = 0u32;
        loop {
            if !self.is_running() {
                return Err(SyncError::NodeUnavailable("tracker stopping".to_string()));
            }
            match self.node.chain_tip().await {
                Ok(tip) => return Ok(tip),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    warn!("chain tip fetch failed (attempt {}): {}", attempt, e);
                    self.sleep_or_stop(self.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_header(&self, number: u64) -> SyncResult<Option<crate::BlockHeader>> {
        let mut attempt = 0u32;
        loop {
            if !self.is_running() {
                return Err(SyncError::NodeUnavailable("tracker stopping".to_string()));
            }
            match self.node.header_by_number(number).await {
                Ok(header) => return Ok(header),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    warn!("header {} fetch failed (attempt {}): {}", number, attempt, e);
                    self.sleep_or_stop(self.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(10);
        self.config
            .node_retry_base
            .saturating_mul(1u32 << shift)
            .min(self.config.node_retry_cap)
    }

    async fn sleep_or_stop(&self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.stop_notify.notified() => {}
        }
    }
}

/// Object-safe view of a tracker, so streams over different sink types can
/// live in one registry.
#[async_trait]
pub trait StreamTracker: Send + Sync {
    async fn start(&self) -> SyncResult<()>;
    async fn stop(&self) -> SyncResult<()>;
    async fn status(&self) -> TrackerStatus;
}

#[async_trait]
impl<N, S> StreamTracker for SyncTracker<N, S>
where
    N: ChainNodeAdapter + 'static,
    S: BlockSink + 'static,
{
    async fn start(&self) -> SyncResult<()> {
        SyncTracker::start(self).await
    }

    async fn stop(&self) -> SyncResult<()> {
        SyncTracker::stop(self).await
    }

    async fn status(&self) -> TrackerStatus {
        SyncTracker::status(self).await
    }
}

struct StreamEntry {
    name: String,
    tracker: Arc<dyn StreamTracker>,
    handle: tokio::task::JoinHandle<SyncResult<()>>,
}

/// Explicit registry of running stream tasks, owned by the composition root.
/// Streams are isolated: a fatal error stops only its own task, and shutdown
/// stops every stream cooperatively.
#[derive(Default)]
pub struct PipelineRegistry {
    streams: Vec<StreamEntry>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Spawn a stream task for `tracker` under `name`.
    pub fn spawn(&mut self, name: impl Into<String>, tracker: Arc<dyn StreamTracker>) {
        let name = name.into();
        let task_name = name.clone();
        let task_tracker = tracker.clone();
        let handle = tokio::spawn(async move {
            let result = task_tracker.start().await;
            if let Err(e) = &result {
                error!("stream '{}' halted: {}", task_name, e);
            }
            result
        });
        self.streams.push(StreamEntry {
            name,
            tracker,
            handle,
        });
    }

    pub async fn statuses(&self) -> Vec<(String, TrackerStatus)> {
        let mut out = Vec::with_capacity(self.streams.len());
        for entry in &self.streams {
            out.push((entry.name.clone(), entry.tracker.status().await));
        }
        out
    }

    /// Wait for every stream task to finish on its own (exit heights or
    /// fatal errors).
    pub async fn join_all(self) -> Vec<(String, SyncResult<()>)> {
        let mut results = Vec::with_capacity(self.streams.len());
        for entry in self.streams {
            let result = entry
                .handle
                .await
                .unwrap_or_else(|e| Err(SyncError::Config(format!("stream task failed: {}", e))));
            results.push((entry.name, result));
        }
        results
    }

    /// Stop every stream cooperatively and collect their results.
    pub async fn stop_all(self) -> Vec<(String, SyncResult<()>)> {
        for entry in &self.streams {
            if let Err(e) = entry.tracker.stop().await {
                warn!("stopping stream '{}' failed: {}", entry.name, e);
            }
        }
        self.join_all().await
    }
}
