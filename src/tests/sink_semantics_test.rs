//! Sink contract semantics: idempotent rewrites, empty-stream truncation,
//! window ordering, and isolation between independent streams.

use std::sync::Arc;

use alloy_primitives::{Address, B256};
use etherfeed_sync::mock::{MockChainNode, MockSink};
use etherfeed_sync::{
    BlockSink, EncodedBlock, PipelineRegistry, StreamTracker, SyncError, SyncTracker,
};

use crate::chain_builder::ChainBuilder;
use crate::tests::test_config;

fn addr(last: u8) -> Address {
    Address::with_last_byte(last)
}

#[tokio::test]
async fn rewriting_a_height_is_idempotent() {
    let mut sink = MockSink::new();
    let payload = EncodedBlock::from_bytes(vec![1, 2, 3]);
    let hash = B256::with_last_byte(0x01);

    let first = sink.write(&payload, 7, hash).await.unwrap();
    let second = sink.write(&payload, 7, hash).await.unwrap();

    // Same logical advance, no duplicate records at the height.
    assert_eq!(first, second);
    assert_eq!(sink.record_count().await, 1);
    assert_eq!(sink.current_head().await.unwrap().unwrap().block_number, 7);
    assert_eq!(sink.write_count(7).await, 2);
}

#[tokio::test]
async fn truncating_an_empty_stream_is_safe() {
    let mut sink = MockSink::new();
    sink.truncate_from(0).await.unwrap();
    sink.truncate_from(100).await.unwrap();
    assert!(sink.current_head().await.unwrap().is_none());
    assert!(sink.recent_blocks(16).await.unwrap().is_empty());
}

#[tokio::test]
async fn recent_blocks_come_newest_first() {
    let mut sink = MockSink::new();
    for number in 0..5u64 {
        let payload = EncodedBlock::from_bytes(vec![number as u8]);
        sink.write(&payload, number, B256::with_last_byte(number as u8))
            .await
            .unwrap();
    }
    let window = sink.recent_blocks(3).await.unwrap();
    let numbers: Vec<_> = window.iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![4, 3, 2]);
}

#[tokio::test]
async fn a_fatal_stream_does_not_stop_its_siblings() {
    let _ = env_logger::builder().is_test(true).try_init();
    let chain = ChainBuilder::new()
        .fund(addr(1), 10_000_000_000_000_000)
        .add_empty_blocks(6);
    let node: MockChainNode = chain.into_node();

    let healthy_sink = MockSink::new();
    let failing_sink = MockSink::new();
    failing_sink.fail_next_writes(1000).await;

    let mut config = test_config(Some(6));
    config.sink_write_retries = 1;

    let mut registry = PipelineRegistry::new();
    let healthy: Arc<dyn StreamTracker> = Arc::new(SyncTracker::new(
        node.clone(),
        healthy_sink.clone(),
        config.clone(),
    ));
    let failing: Arc<dyn StreamTracker> =
        Arc::new(SyncTracker::new(node, failing_sink.clone(), config));
    registry.spawn("healthy", healthy);
    registry.spawn("failing", failing);
    assert_eq!(registry.len(), 2);

    let results = registry.join_all().await;
    let healthy_result = &results.iter().find(|(n, _)| n == "healthy").unwrap().1;
    let failing_result = &results.iter().find(|(n, _)| n == "failing").unwrap().1;

    assert!(healthy_result.is_ok());
    assert!(matches!(failing_result, Err(SyncError::SinkWrite(_))));

    // The healthy stream delivered everything despite its sibling's death.
    assert_eq!(healthy_sink.record_count().await, 6);
    assert_eq!(failing_sink.record_count().await, 0);
}
