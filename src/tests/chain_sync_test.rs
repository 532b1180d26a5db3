//! End-to-end catch-up: every block delivered exactly once, in order, and
//! resumable across tracker restarts.

use alloy_primitives::Address;
use anyhow::Result;
use etherfeed_sync::mock::MockSink;
use etherfeed_sync::{decode_block, BlockSink, SyncTracker};
use log::info;

use crate::chain_builder::ChainBuilder;
use crate::tests::test_config;

fn addr(last: u8) -> Address {
    Address::with_last_byte(last)
}

fn busy_chain(blocks: u64) -> ChainBuilder {
    let mut chain = ChainBuilder::new()
        .fund(addr(1), 10_000_000_000_000_000)
        .fund(addr(2), 10_000_000_000_000_000)
        .add_empty_blocks(1);
    for n in 1..blocks {
        chain = chain.add_block(|b| {
            b.beneficiary(addr(9))
                .transfer(addr(1), addr(2), 1000 + n)
                .reward(5_000_000)
        });
    }
    chain
}

#[tokio::test]
async fn delivers_every_block_exactly_once() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let chain = busy_chain(10);
    let node = chain.clone().into_node();
    let sink = MockSink::new();

    let tracker = SyncTracker::new(node, sink.clone(), test_config(Some(10)));
    tracker.start().await?;

    let head = sink.current_head().await?.unwrap();
    assert_eq!(head.block_number, 9);
    assert_eq!(head.block_hash, chain.block_hash(9).unwrap());

    assert_eq!(sink.persisted_numbers().await, (0..10).collect::<Vec<_>>());
    for number in 0..10 {
        assert_eq!(sink.write_count(number).await, 1, "block {}", number);
    }
    info!("all 10 blocks delivered exactly once");
    Ok(())
}

#[tokio::test]
async fn delivered_payloads_decode_to_the_assembled_blocks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let chain = busy_chain(4);
    let node = chain.clone().into_node();
    let sink = MockSink::new();

    let tracker = SyncTracker::new(node, sink.clone(), test_config(Some(4)));
    tracker.start().await.unwrap();

    for number in 0..4 {
        let payload = sink.payload(number).await.unwrap();
        let block = decode_block(&payload).unwrap();
        assert_eq!(block.header.number, number);
        assert_eq!(block.header.hash, chain.block_hash(number).unwrap());
        assert_eq!(block.receipts.len(), block.body.transactions.len());
    }
}

#[tokio::test]
async fn restart_resumes_from_the_checkpoint() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let chain = busy_chain(10);
    let sink = MockSink::new();

    // First run covers the lower half of the chain.
    let tracker = SyncTracker::new(
        chain.clone().into_node(),
        sink.clone(),
        test_config(Some(5)),
    );
    tracker.start().await?;
    assert_eq!(sink.current_head().await?.unwrap().block_number, 4);

    // A fresh tracker against the same sink picks up at block 5.
    let tracker = SyncTracker::new(
        chain.clone().into_node(),
        sink.clone(),
        test_config(Some(10)),
    );
    tracker.start().await?;

    assert_eq!(sink.persisted_numbers().await, (0..10).collect::<Vec<_>>());
    for number in 0..10 {
        assert_eq!(sink.write_count(number).await, 1, "block {}", number);
    }
    Ok(())
}

#[tokio::test]
async fn start_block_override_skips_history() {
    let _ = env_logger::builder().is_test(true).try_init();
    let chain = busy_chain(8);
    let sink = MockSink::new();
    let mut config = test_config(Some(8));
    config.start_block = 5;

    let tracker = SyncTracker::new(chain.into_node(), sink.clone(), config);
    tracker.start().await.unwrap();

    assert_eq!(sink.persisted_numbers().await, vec![5, 6, 7]);
}
