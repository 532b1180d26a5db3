//! Genesis end-to-end: three pre-funded accounts from an allocation list
//! flow through assembly, encoding, and delivery with exact balances.

use std::collections::BTreeMap;

use alloy_primitives::{Address, U256};
use etherfeed_sync::mock::MockSink;
use etherfeed_sync::{
    decode_block, encode_block, BalanceChangeCause, BlockSink, GenesisAccount, GenesisAlloc,
    SyncTracker,
};

use crate::chain_builder::ChainBuilder;
use crate::tests::test_config;

fn addr(last: u8) -> Address {
    Address::with_last_byte(last)
}

fn three_account_alloc() -> GenesisAlloc {
    let mut accounts = BTreeMap::new();
    for (last, balance) in [(1u8, 1_000_000u64), (2, 2_000_000), (3, 3_000_000)] {
        accounts.insert(
            addr(last),
            GenesisAccount {
                balance: U256::from(balance),
                ..Default::default()
            },
        );
    }
    GenesisAlloc::new(accounts)
}

#[tokio::test]
async fn genesis_allocation_flows_through_the_pipeline() {
    let _ = env_logger::builder().is_test(true).try_init();
    let alloc = three_account_alloc();
    let chain = ChainBuilder::new().with_genesis_alloc(&alloc);
    let sink = MockSink::new();

    let tracker = SyncTracker::new(chain.into_node(), sink.clone(), test_config(Some(1)))
        .with_genesis_alloc(alloc.clone());
    tracker.start().await.unwrap();

    assert_eq!(sink.current_head().await.unwrap().unwrap().block_number, 0);
    let payload = sink.payload(0).await.unwrap();
    let block = decode_block(&payload).unwrap();

    assert_eq!(block.touched_accounts.len(), 3);
    assert_eq!(block.balance_deltas.len(), 3);
    for delta in &block.balance_deltas {
        assert_eq!(delta.cause, BalanceChangeCause::Allocation);
        assert_eq!(delta.old_balance, U256::ZERO);
    }

    let balances: Vec<U256> = block
        .touched_accounts
        .iter()
        .map(|account| account.balance)
        .collect();
    assert_eq!(
        balances,
        vec![
            U256::from(1_000_000u64),
            U256::from(2_000_000u64),
            U256::from(3_000_000u64),
        ]
    );

    // Round trip preserves the block, byte for byte.
    let re_encoded = encode_block(&block).unwrap();
    assert_eq!(re_encoded.as_bytes(), payload.as_slice());

    // Total difficulty is present: genesis came from a live chain context.
    assert!(block.total_difficulty.is_some());
    assert!(block.trace.is_some());
    assert!(block.receipts.is_empty());
}

#[tokio::test]
async fn alloc_json_survives_the_full_path() {
    let _ = env_logger::builder().is_test(true).try_init();
    let raw = r#"{
        "0x0000000000000000000000000000000000000001": { "balance": "0xf4240" },
        "0x0000000000000000000000000000000000000002": { "balance": "0x1e8480" },
        "0x0000000000000000000000000000000000000003": { "balance": "0x2dc6c0" }
    }"#;
    let alloc = GenesisAlloc::from_json(raw).unwrap();
    assert_eq!(alloc.len(), 3);
    assert_eq!(
        alloc.get(&addr(1)).unwrap().balance,
        U256::from(1_000_000u64)
    );

    let chain = ChainBuilder::new().with_genesis_alloc(&alloc);
    let sink = MockSink::new();
    let tracker = SyncTracker::new(chain.into_node(), sink.clone(), test_config(Some(1)))
        .with_genesis_alloc(alloc);
    tracker.start().await.unwrap();
    let block = decode_block(&sink.payload(0).await.unwrap()).unwrap();
    assert_eq!(block.balance_deltas.len(), 3);
}
