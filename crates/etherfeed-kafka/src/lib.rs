//! # etherfeed-kafka
//!
//! Message-topic sink: delivers encoded blocks to a log-compacted Kafka
//! topic keyed by block number, with a second compacted topic carrying the
//! per-stream checkpoint. One record key per height means compaction retains
//! only the latest record per block — a shallow reorg that replaces a height
//! truncates itself on overwrite.
//!
//! The checkpoint record embeds the trailing window of (number, hash) pairs,
//! so the safe-sync check at startup never has to scan the block topic. The
//! checkpoint is produced only after the block payload is acknowledged by
//! the broker; a crash between the two leaves the checkpoint describing the
//! last fully committed block.
//!
//! Compacted topics are treated as single-partition (partition 0): per-key
//! compaction plus a totally ordered block stream require it.

use std::time::Duration;

use alloy_primitives::B256;
use async_trait::async_trait;
use log::{debug, info, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};

use etherfeed_sync::{BlockRef, BlockSink, EncodedBlock, SyncError, SyncResult, SyncState};

/// The single partition compacted topics are written to.
const PARTITION: i32 = 0;

#[derive(Debug, Clone)]
pub struct KafkaSinkConfig {
    pub brokers: String,
    /// Logical stream id; keys the checkpoint record.
    pub stream: String,
    pub block_topic: String,
    pub checkpoint_topic: String,
    pub delivery_timeout: Duration,
    pub read_timeout: Duration,
    /// How many trailing (number, hash) pairs the checkpoint carries.
    /// Should match the tracker's safe-sync window.
    pub window: usize,
}

impl KafkaSinkConfig {
    pub fn new(brokers: impl Into<String>, stream: impl Into<String>) -> Self {
        let stream = stream.into();
        Self {
            brokers: brokers.into(),
            block_topic: format!("{}.blocks", stream),
            checkpoint_topic: format!("{}.checkpoint", stream),
            stream,
            delivery_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            window: 256,
        }
    }
}

/// The checkpoint payload, JSON-encoded on the checkpoint topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointRecord {
    stream: String,
    block_number: u64,
    block_hash: B256,
    /// Trailing window, oldest first.
    window: Vec<BlockRef>,
}

/// Log-compacted Kafka sink for one stream.
pub struct KafkaBlockSink {
    producer: FutureProducer,
    config: KafkaSinkConfig,
    head: Option<SyncState>,
    /// Trailing window, oldest first; mirrored into every checkpoint.
    window: Vec<BlockRef>,
}

impl KafkaBlockSink {
    /// Connect to the brokers and load the stream's last checkpoint.
    pub async fn connect(config: KafkaSinkConfig) -> SyncResult<Self> {
        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &config.brokers)
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "30000");
        let producer: FutureProducer = producer_config.create().map_err(kafka_err)?;

        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", format!("{}.checkpoint-reader", config.stream))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        let checkpoint = {
            let topic = config.checkpoint_topic.clone();
            let timeout = config.read_timeout;
            tokio::task::spawn_blocking(move || {
                read_latest_checkpoint(&consumer_config, &topic, timeout)
            })
            .await
            .map_err(|e| SyncError::SinkWrite(format!("checkpoint read task failed: {}", e)))??
        };

        let (head, window) = match checkpoint {
            Some(record) => {
                info!(
                    "stream '{}' resumes at block {} ({})",
                    config.stream, record.block_number, record.block_hash
                );
                (
                    Some(SyncState {
                        block_number: record.block_number,
                        block_hash: record.block_hash,
                    }),
                    record.window,
                )
            }
            None => {
                info!("stream '{}' has no checkpoint yet", config.stream);
                (None, Vec::new())
            }
        };

        Ok(Self {
            producer,
            config,
            head,
            window,
        })
    }

    async fn produce(&self, topic: &str, key: &[u8], payload: Option<&[u8]>) -> SyncResult<()> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).key(key);
        if let Some(payload) = payload {
            record = record.payload(payload);
        }
        self.producer
            .send(record, Timeout::After(self.config.delivery_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| {
                SyncError::SinkWrite(format!("kafka delivery to '{}' failed: {}", topic, e))
            })
    }

    async fn publish_checkpoint(&self) -> SyncResult<()> {
        match self.head {
            Some(head) => {
                let record = CheckpointRecord {
                    stream: self.config.stream.clone(),
                    block_number: head.block_number,
                    block_hash: head.block_hash,
                    window: self.window.clone(),
                };
                let payload = serde_json::to_vec(&record).map_err(|e| {
                    SyncError::Serialization(format!("checkpoint encode failed: {}", e))
                })?;
                self.produce(
                    &self.config.checkpoint_topic,
                    self.config.stream.as_bytes(),
                    Some(&payload),
                )
                .await
            }
            // Tombstone: compaction removes the checkpoint entirely.
            None => {
                self.produce(
                    &self.config.checkpoint_topic,
                    self.config.stream.as_bytes(),
                    None,
                )
                .await
            }
        }
    }
}

#[async_trait]
impl BlockSink for KafkaBlockSink {
    async fn write(
        &mut self,
        block: &EncodedBlock,
        number: u64,
        hash: B256,
    ) -> SyncResult<SyncState> {
        // Payload first; the checkpoint only moves once the broker has
        // acknowledged the block record.
        self.produce(
            &self.config.block_topic,
            &number.to_be_bytes(),
            Some(block.as_bytes()),
        )
        .await?;

        advance_window(
            &mut self.window,
            BlockRef { number, hash },
            self.config.window,
        );
        let state = SyncState {
            block_number: number,
            block_hash: hash,
        };
        self.head = Some(state);
        self.publish_checkpoint().await?;
        debug!(
            "stream '{}': block {} committed to '{}'",
            self.config.stream, number, self.config.block_topic
        );
        Ok(state)
    }

    async fn current_head(&self) -> SyncResult<Option<SyncState>> {
        Ok(self.head)
    }

    async fn truncate_from(&mut self, number: u64) -> SyncResult<()> {
        self.window.retain(|r| r.number < number);
        self.head = self.window.last().map(|r| SyncState {
            block_number: r.number,
            block_hash: r.hash,
        });
        if self.head.is_none() {
            warn!(
                "stream '{}' truncated below its window; clearing checkpoint",
                self.config.stream
            );
        }
        // Superseded heights need no explicit deletion: re-synced blocks
        // overwrite by key under log compaction.
        self.publish_checkpoint().await
    }

    async fn recent_blocks(&self, limit: usize) -> SyncResult<Vec<BlockRef>> {
        Ok(self.window.iter().rev().take(limit).copied().collect())
    }
}

/// Bounded push: drops any stale entry at or above the new number, appends,
/// and trims the front down to `capacity`.
fn advance_window(window: &mut Vec<BlockRef>, entry: BlockRef, capacity: usize) {
    window.retain(|r| r.number < entry.number);
    window.push(entry);
    if window.len() > capacity {
        let excess = window.len() - capacity;
        window.drain(..excess);
    }
}

/// Read the newest record of the (compacted, single-partition) checkpoint
/// topic. Blocking; run on a blocking thread.
fn read_latest_checkpoint(
    config: &ClientConfig,
    topic: &str,
    timeout: Duration,
) -> SyncResult<Option<CheckpointRecord>> {
    let consumer: BaseConsumer = config.create().map_err(kafka_err)?;
    let (low, high) = consumer
        .fetch_watermarks(topic, PARTITION, Timeout::After(timeout))
        .map_err(kafka_err)?;
    if high <= low {
        return Ok(None);
    }

    let mut assignment = TopicPartitionList::new();
    assignment
        .add_partition_offset(topic, PARTITION, Offset::Offset(high - 1))
        .map_err(kafka_err)?;
    consumer.assign(&assignment).map_err(kafka_err)?;

    match consumer.poll(Timeout::After(timeout)) {
        Some(Ok(message)) => match message.payload() {
            Some(payload) => {
                let record: CheckpointRecord = serde_json::from_slice(payload).map_err(|e| {
                    SyncError::Serialization(format!("checkpoint decode failed: {}", e))
                })?;
                Ok(Some(record))
            }
            // Tombstone: the stream was reset.
            None => Ok(None),
        },
        Some(Err(e)) => Err(kafka_err(e)),
        None => Err(SyncError::SinkWrite(format!(
            "no checkpoint message readable from '{}' within {:?}",
            topic, timeout
        ))),
    }
}

fn kafka_err(e: rdkafka::error::KafkaError) -> SyncError {
    SyncError::SinkWrite(format!("kafka error: {}", e))
}
