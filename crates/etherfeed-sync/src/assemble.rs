//! # Block Assembler
//!
//! Turns a block number into exactly one [`EnrichedBlock`] or fails
//! explicitly. Retrieval errors propagate as transient
//! [`SyncError::NodeUnavailable`] for the tracker to retry; a receipts/body
//! length disagreement is [`SyncError::InconsistentBlockData`] and fatal for
//! the stream; missing trace data degrades the block (no rewards, no
//! creation records) instead of failing it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use alloy_primitives::{keccak256, Address, U256};
use log::{debug, warn};

use crate::{
    AccountSnapshot, AccountState, BalanceChangeCause, BalanceDelta, BlockBody, BlockHeader,
    BlockTrace, ChainNodeAdapter, EnrichedBlock, GenesisAlloc, ProbeAccount, StateView,
    SyncError, SyncResult, TokenClassification, TokenClassifier,
};

/// Post-block state snapshot assembled from accounts the block touched.
/// Classification probes run against this; anything outside it reads as
/// empty, which resolves to a non-match.
#[derive(Debug, Clone, Default)]
pub struct PrefetchedState {
    accounts: BTreeMap<Address, ProbeAccount>,
    storage: BTreeMap<(Address, U256), U256>,
}

impl PrefetchedState {
    pub fn insert_account(&mut self, address: Address, account: ProbeAccount) {
        self.accounts.insert(address, account);
    }

    pub fn insert_storage(&mut self, address: Address, slot: U256, value: U256) {
        self.storage.insert((address, slot), value);
    }
}

impl StateView for PrefetchedState {
    fn basic(&self, address: Address) -> Option<ProbeAccount> {
        self.accounts.get(&address).cloned()
    }

    fn storage(&self, address: Address, slot: U256) -> U256 {
        self.storage
            .get(&(address, slot))
            .copied()
            .unwrap_or(U256::ZERO)
    }
}

/// Assembles enriched blocks from node data.
pub struct BlockAssembler<N> {
    node: Arc<N>,
    classifier: TokenClassifier,
    genesis_alloc: Option<GenesisAlloc>,
}

impl<N: ChainNodeAdapter> BlockAssembler<N> {
    pub fn new(node: Arc<N>) -> Self {
        Self {
            node,
            classifier: TokenClassifier::new(),
            genesis_alloc: None,
        }
    }

    /// Provide the allocation list used to synthesize the genesis block.
    pub fn with_genesis_alloc(mut self, alloc: GenesisAlloc) -> Self {
        self.genesis_alloc = Some(alloc);
        self
    }

    pub fn with_classifier(mut self, classifier: TokenClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Produce the enriched block for `number`.
    pub async fn assemble(&self, number: u64) -> SyncResult<EnrichedBlock> {
        let (header, body) = self
            .node
            .block_by_number(number)
            .await?
            .ok_or_else(|| SyncError::NodeUnavailable(format!("block {} not served", number)))?;

        if number == 0 {
            if let Some(alloc) = &self.genesis_alloc {
                return Ok(self.assemble_genesis(header, body, alloc));
            }
        }

        let receipts = self.node.receipts(number).await?;
        if receipts.len() != body.transactions.len() {
            return Err(SyncError::InconsistentBlockData {
                height: number,
                message: format!(
                    "{} receipts for {} transactions",
                    receipts.len(),
                    body.transactions.len()
                ),
            });
        }

        let trace = match self.node.trace(number).await {
            Ok(trace) => trace,
            Err(SyncError::TraceUnavailable(_)) => None,
            Err(e) => return Err(e),
        };
        if trace.is_none() {
            warn!(
                "trace unavailable for block {}; rewards and creations omitted",
                number
            );
        }

        let total_difficulty = if number == 0 {
            Some(header.difficulty)
        } else {
            self.node
                .total_difficulty(number - 1)
                .await?
                .map(|parent| parent + header.difficulty)
        };

        let (touched, causes, created) = collect_touched(&header, &body, &receipts, trace.as_ref());

        let mut touched_accounts = Vec::with_capacity(touched.len());
        let mut balance_deltas = Vec::new();
        for address in &touched {
            let post = self.node.account_at(*address, number).await?;
            let pre = if number == 0 {
                AccountState::default()
            } else {
                self.node.account_at(*address, number - 1).await?
            };
            touched_accounts.push(AccountSnapshot {
                address: *address,
                balance: post.balance,
                nonce: post.nonce,
                code_hash: keccak256(&post.code),
                code: post.code.clone(),
                created_contract: created.contains(address),
            });

            match causes.get(address) {
                Some(account_causes) if !account_causes.is_empty() => {
                    // One record per independent cause; a net-zero change is
                    // still recorded with equal balances.
                    for cause in account_causes {
                        balance_deltas.push(BalanceDelta {
                            address: *address,
                            old_balance: pre.balance,
                            new_balance: post.balance,
                            cause: *cause,
                        });
                    }
                }
                _ => {
                    // Balance moved without an attributable cause (trace
                    // gaps); record it as a plain value transfer.
                    if pre.balance != post.balance {
                        balance_deltas.push(BalanceDelta {
                            address: *address,
                            old_balance: pre.balance,
                            new_balance: post.balance,
                            cause: BalanceChangeCause::ValueTransfer,
                        });
                    }
                }
            }
        }

        let token_classifications = self.classify_created(&touched_accounts, &created);

        debug!(
            "assembled block {}: {} touched accounts, {} deltas, {} creations",
            number,
            touched_accounts.len(),
            balance_deltas.len(),
            created.len()
        );

        Ok(EnrichedBlock {
            header,
            body,
            receipts,
            total_difficulty,
            trace,
            touched_accounts,
            balance_deltas,
            token_classifications,
        })
    }

    /// Genesis has no live pre-state; touched accounts and deltas come from
    /// the allocation list, and probes run against the allocation itself.
    fn assemble_genesis(
        &self,
        header: BlockHeader,
        body: BlockBody,
        alloc: &GenesisAlloc,
    ) -> EnrichedBlock {
        let (touched_accounts, balance_deltas) = alloc.synthesize();
        let token_classifications = alloc
            .contract_addresses()
            .into_iter()
            .map(|address| self.classifier.classify(alloc, address))
            .collect();
        let total_difficulty = Some(header.difficulty);
        EnrichedBlock {
            header,
            body,
            receipts: Vec::new(),
            total_difficulty,
            trace: Some(BlockTrace::default()),
            touched_accounts,
            balance_deltas,
            token_classifications,
        }
    }

    fn classify_created(
        &self,
        touched_accounts: &[AccountSnapshot],
        created: &BTreeSet<Address>,
    ) -> Vec<TokenClassification> {
        if created.is_empty() {
            return Vec::new();
        }
        let mut snapshot = PrefetchedState::default();
        for account in touched_accounts {
            snapshot.insert_account(
                account.address,
                ProbeAccount {
                    balance: account.balance,
                    nonce: account.nonce,
                    code: account.code.clone(),
                },
            );
        }
        created
            .iter()
            .map(|address| self.classifier.classify(&snapshot, *address))
            .collect()
    }
}

type CauseMap = BTreeMap<Address, BTreeSet<BalanceChangeCause>>;

/// Union of every account the block touched, with the causes attributable to
/// each and the set of contracts it created.
fn collect_touched(
    header: &BlockHeader,
    body: &BlockBody,
    receipts: &[crate::ReceiptRecord],
    trace: Option<&BlockTrace>,
) -> (BTreeSet<Address>, CauseMap, BTreeSet<Address>) {
    let mut touched = BTreeSet::new();
    let mut causes: CauseMap = BTreeMap::new();
    let mut created = BTreeSet::new();

    let mut tag = |touched: &mut BTreeSet<Address>,
                   causes: &mut CauseMap,
                   address: Address,
                   cause: BalanceChangeCause| {
        touched.insert(address);
        causes.entry(address).or_default().insert(cause);
    };

    for (tx, receipt) in body.transactions.iter().zip(receipts) {
        tag(&mut touched, &mut causes, tx.from, BalanceChangeCause::GasFee);
        let recipient = tx.to.or(receipt.contract_address);
        if let Some(to) = recipient {
            touched.insert(to);
            if tx.value > U256::ZERO {
                tag(
                    &mut touched,
                    &mut causes,
                    tx.from,
                    BalanceChangeCause::ValueTransfer,
                );
                tag(&mut touched, &mut causes, to, BalanceChangeCause::ValueTransfer);
            }
        }
        if let Some(contract) = receipt.contract_address {
            created.insert(contract);
        }
    }

    if !body.transactions.is_empty() {
        // The beneficiary collects the fees the senders paid.
        tag(
            &mut touched,
            &mut causes,
            header.beneficiary,
            BalanceChangeCause::GasFee,
        );
    }

    if let Some(trace) = trace {
        for call in &trace.internal_calls {
            touched.insert(call.from);
            touched.insert(call.to);
            if call.value > U256::ZERO {
                tag(
                    &mut touched,
                    &mut causes,
                    call.from,
                    BalanceChangeCause::ValueTransfer,
                );
                tag(
                    &mut touched,
                    &mut causes,
                    call.to,
                    BalanceChangeCause::ValueTransfer,
                );
            }
        }
        for contract in &trace.created_contracts {
            touched.insert(*contract);
            created.insert(*contract);
        }
        for reward in &trace.rewards {
            tag(
                &mut touched,
                &mut causes,
                reward.beneficiary,
                BalanceChangeCause::Reward,
            );
        }
        for sd in &trace.self_destructs {
            tag(
                &mut touched,
                &mut causes,
                sd.contract,
                BalanceChangeCause::SelfDestructRefund,
            );
            tag(
                &mut touched,
                &mut causes,
                sd.refund_address,
                BalanceChangeCause::SelfDestructRefund,
            );
        }
    }

    (touched, causes, created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBlock, MockChainNode};
    use crate::{LogRecord, ReceiptRecord, RewardRecord, RewardKind, TransactionRecord};
    use alloy_primitives::{Bytes, B256};

    fn addr(last: u8) -> Address {
        Address::with_last_byte(last)
    }

    fn header(number: u64, parent: B256, beneficiary: Address) -> BlockHeader {
        let mut seed = Vec::with_capacity(40);
        seed.extend_from_slice(&number.to_be_bytes());
        seed.extend_from_slice(parent.as_slice());
        BlockHeader {
            hash: keccak256(&seed),
            parent_hash: parent,
            number,
            timestamp: number * 15,
            beneficiary,
            difficulty: U256::from(1000u64),
            gas_limit: 8_000_000,
            gas_used: 21_000,
            base_fee_per_gas: None,
            state_root: B256::ZERO,
            transactions_root: B256::ZERO,
            receipts_root: B256::ZERO,
        }
    }

    fn transfer_tx(from: Address, to: Address, value: u64) -> TransactionRecord {
        TransactionRecord {
            hash: keccak256([from.as_slice(), to.as_slice()].concat()),
            from,
            to: Some(to),
            value: U256::from(value),
            gas_limit: 21_000,
            gas_price: U256::from(1u64),
            nonce: 0,
            input: Bytes::new(),
        }
    }

    fn receipt() -> ReceiptRecord {
        ReceiptRecord {
            status: true,
            cumulative_gas_used: 21_000,
            gas_used: 21_000,
            contract_address: None,
            logs: Vec::<LogRecord>::new(),
        }
    }

    fn state(entries: &[(Address, u64)]) -> BTreeMap<Address, AccountState> {
        entries
            .iter()
            .map(|(address, balance)| {
                (
                    *address,
                    AccountState {
                        balance: U256::from(*balance),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    fn two_block_chain() -> MockChainNode {
        let node = MockChainNode::new();
        let sender = addr(1);
        let recipient = addr(2);
        let miner = addr(3);

        let genesis_header = header(0, B256::ZERO, miner);
        let genesis_hash = genesis_header.hash;
        node.push_block(MockBlock {
            header: genesis_header,
            body: BlockBody::default(),
            receipts: vec![],
            trace: Some(BlockTrace::default()),
            state: state(&[(sender, 1_000_000), (recipient, 0), (miner, 0)]),
            total_difficulty: U256::from(1000u64),
        });

        // sender pays 100 value + 21_000 gas at price 1; miner collects the
        // fee plus a reward.
        node.push_block(MockBlock {
            header: header(1, genesis_hash, miner),
            body: BlockBody {
                transactions: vec![transfer_tx(sender, recipient, 100)],
                ommers: vec![],
            },
            receipts: vec![receipt()],
            trace: Some(BlockTrace {
                rewards: vec![RewardRecord {
                    beneficiary: miner,
                    amount: U256::from(5000u64),
                    kind: RewardKind::Block,
                }],
                ..Default::default()
            }),
            state: state(&[
                (sender, 1_000_000 - 100 - 21_000),
                (recipient, 100),
                (miner, 21_000 + 5000),
            ]),
            total_difficulty: U256::from(2000u64),
        });
        node
    }

    #[tokio::test]
    async fn assembles_transfer_block() {
        let node = Arc::new(two_block_chain());
        let assembler = BlockAssembler::new(node);
        let block = assembler.assemble(1).await.unwrap();

        assert_eq!(block.receipts.len(), 1);
        assert_eq!(block.total_difficulty, Some(U256::from(2000u64)));
        assert_eq!(block.touched_accounts.len(), 3);
        assert!(block
            .touched_accounts
            .windows(2)
            .all(|w| w[0].address < w[1].address));

        let sender_causes: BTreeSet<_> = block
            .balance_deltas
            .iter()
            .filter(|d| d.address == addr(1))
            .map(|d| d.cause)
            .collect();
        assert!(sender_causes.contains(&BalanceChangeCause::ValueTransfer));
        assert!(sender_causes.contains(&BalanceChangeCause::GasFee));

        let miner_causes: BTreeSet<_> = block
            .balance_deltas
            .iter()
            .filter(|d| d.address == addr(3))
            .map(|d| d.cause)
            .collect();
        assert!(miner_causes.contains(&BalanceChangeCause::Reward));
        assert!(miner_causes.contains(&BalanceChangeCause::GasFee));

        // Every delta address is also a touched account.
        for delta in &block.balance_deltas {
            assert!(block
                .touched_accounts
                .iter()
                .any(|a| a.address == delta.address));
        }
    }

    #[tokio::test]
    async fn receipt_mismatch_is_inconsistent_data() {
        let node = two_block_chain();
        {
            // Drop the receipt so lengths disagree.
            node.with_block_mut(1, |block| block.receipts.clear());
        }
        let assembler = BlockAssembler::new(Arc::new(node));
        let err = assembler.assemble(1).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::InconsistentBlockData { height: 1, .. }
        ));
    }

    #[tokio::test]
    async fn missing_trace_degrades_block() {
        let node = two_block_chain();
        node.set_trace_available(false);
        let assembler = BlockAssembler::new(Arc::new(node));
        let block = assembler.assemble(1).await.unwrap();
        assert!(block.trace.is_none());
        // The reward cause is gone with the trace, but the transfer still
        // shows up from the transaction context.
        assert!(block
            .balance_deltas
            .iter()
            .all(|d| d.cause != BalanceChangeCause::Reward));
        // The miner's balance still moved; it is recorded with the causes
        // that remain attributable.
        assert!(block.balance_deltas.iter().any(|d| d.address == addr(3)));
    }

    #[tokio::test]
    async fn net_zero_delta_is_still_recorded() {
        // Miner is also the sender: fee leaves and returns in the same
        // block, value goes out.
        let node = MockChainNode::new();
        let miner = addr(7);
        let recipient = addr(8);
        let genesis_header = header(0, B256::ZERO, miner);
        let genesis_hash = genesis_header.hash;
        node.push_block(MockBlock {
            header: genesis_header,
            body: BlockBody::default(),
            receipts: vec![],
            trace: Some(BlockTrace::default()),
            state: state(&[(miner, 1000), (recipient, 0)]),
            total_difficulty: U256::from(1000u64),
        });
        node.push_block(MockBlock {
            header: header(1, genesis_hash, miner),
            body: BlockBody {
                transactions: vec![transfer_tx(miner, recipient, 0)],
                ommers: vec![],
            },
            receipts: vec![receipt()],
            trace: Some(BlockTrace::default()),
            // Fee paid equals fee collected: balance unchanged.
            state: state(&[(miner, 1000), (recipient, 0)]),
            total_difficulty: U256::from(2000u64),
        });

        let assembler = BlockAssembler::new(Arc::new(node));
        let block = assembler.assemble(1).await.unwrap();
        let miner_deltas: Vec<_> = block
            .balance_deltas
            .iter()
            .filter(|d| d.address == miner)
            .collect();
        assert!(!miner_deltas.is_empty());
        for delta in miner_deltas {
            assert_eq!(delta.old_balance, delta.new_balance);
        }
    }

    #[tokio::test]
    async fn created_contracts_are_classified() {
        let node = MockChainNode::new();
        let deployer = addr(1);
        let contract = addr(0xc0);
        let miner = addr(3);
        // Runtime that reverts on every call.
        let code = Bytes::from(hex::decode("60006000fd").unwrap());

        let genesis_header = header(0, B256::ZERO, miner);
        let genesis_hash = genesis_header.hash;
        node.push_block(MockBlock {
            header: genesis_header,
            body: BlockBody::default(),
            receipts: vec![],
            trace: Some(BlockTrace::default()),
            state: state(&[(deployer, 1_000_000)]),
            total_difficulty: U256::from(1000u64),
        });

        let creation_tx = TransactionRecord {
            hash: B256::with_last_byte(0x11),
            from: deployer,
            to: None,
            value: U256::ZERO,
            gas_limit: 100_000,
            gas_price: U256::from(1u64),
            nonce: 0,
            input: code.clone(),
        };
        let mut post_state = state(&[(deployer, 1_000_000 - 53_000), (miner, 53_000)]);
        post_state.insert(
            contract,
            AccountState {
                balance: U256::ZERO,
                nonce: 1,
                code: code.clone(),
            },
        );
        node.push_block(MockBlock {
            header: header(1, genesis_hash, miner),
            body: BlockBody {
                transactions: vec![creation_tx],
                ommers: vec![],
            },
            receipts: vec![ReceiptRecord {
                status: true,
                cumulative_gas_used: 53_000,
                gas_used: 53_000,
                contract_address: Some(contract),
                logs: vec![],
            }],
            trace: Some(BlockTrace {
                created_contracts: vec![contract],
                ..Default::default()
            }),
            state: post_state,
            total_difficulty: U256::from(2000u64),
        });

        let assembler = BlockAssembler::new(Arc::new(node));
        let block = assembler.assemble(1).await.unwrap();
        assert_eq!(block.token_classifications.len(), 1);
        let classification = &block.token_classifications[0];
        assert_eq!(classification.address, contract);
        assert!(classification.interfaces.is_empty());
        let snapshot = block
            .touched_accounts
            .iter()
            .find(|a| a.address == contract)
            .unwrap();
        assert!(snapshot.created_contract);
    }
}
