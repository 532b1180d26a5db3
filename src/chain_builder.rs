//! Chain builder utilities for creating test EVM chains
//!
//! Provides a fluent API for building deterministic mock chains: value
//! transfers, contract creations, reward events, and forked suffixes for
//! reorg scenarios. Every hash is derived from (number, parent, salt), so a
//! fork only needs a different salt to diverge.

use std::collections::BTreeMap;

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use etherfeed_sync::mock::{MockBlock, MockChainNode};
use etherfeed_sync::{
    AccountState, BlockBody, BlockHeader, BlockTrace, GenesisAlloc, ReceiptRecord, RewardKind,
    RewardRecord, TransactionRecord,
};

pub const GAS_PRICE: u64 = 1_000_000_000;
pub const TRANSFER_GAS: u64 = 21_000;
pub const CREATE_GAS: u64 = 53_000;
const DIFFICULTY: u64 = 131_072;

fn block_hash(number: u64, parent: B256, salt: u64) -> B256 {
    let mut seed = Vec::with_capacity(48);
    seed.extend_from_slice(&number.to_be_bytes());
    seed.extend_from_slice(parent.as_slice());
    seed.extend_from_slice(&salt.to_be_bytes());
    keccak256(&seed)
}

fn tx_hash(number: u64, index: usize, salt: u64) -> B256 {
    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&number.to_be_bytes());
    seed.extend_from_slice(&(index as u64).to_be_bytes());
    seed.extend_from_slice(&salt.to_be_bytes());
    keccak256(&seed)
}

fn contract_address(creator: Address, nonce: u64) -> Address {
    let mut seed = Vec::with_capacity(28);
    seed.extend_from_slice(creator.as_slice());
    seed.extend_from_slice(&nonce.to_be_bytes());
    Address::from_slice(&keccak256(&seed)[12..])
}

enum TxSpec {
    Transfer {
        from: Address,
        to: Address,
        value: U256,
    },
    Create {
        creator: Address,
        code: Bytes,
        endowment: U256,
    },
}

/// A builder for one test block.
pub struct BlockBuilder {
    number: u64,
    parent_hash: B256,
    beneficiary: Address,
    salt: u64,
    txs: Vec<TxSpec>,
    reward: Option<U256>,
}

impl BlockBuilder {
    fn new(number: u64, parent_hash: B256) -> Self {
        Self {
            number,
            parent_hash,
            beneficiary: Address::with_last_byte(0x99),
            salt: 0,
            txs: Vec::new(),
            reward: None,
        }
    }

    pub fn beneficiary(mut self, beneficiary: Address) -> Self {
        self.beneficiary = beneficiary;
        self
    }

    /// A different salt gives the block (and everything after it) a
    /// different hash: the handle for building fork suffixes.
    pub fn salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    pub fn transfer(mut self, from: Address, to: Address, value: u64) -> Self {
        self.txs.push(TxSpec::Transfer {
            from,
            to,
            value: U256::from(value),
        });
        self
    }

    pub fn create_contract(mut self, creator: Address, code: Bytes) -> Self {
        self.txs.push(TxSpec::Create {
            creator,
            code,
            endowment: U256::ZERO,
        });
        self
    }

    pub fn reward(mut self, amount: u64) -> Self {
        self.reward = Some(U256::from(amount));
        self
    }

    fn build(self, state: &mut BTreeMap<Address, AccountState>, td: &mut U256) -> MockBlock {
        let gas_price = U256::from(GAS_PRICE);
        let mut transactions = Vec::new();
        let mut receipts = Vec::new();
        let mut trace = BlockTrace::default();
        let mut cumulative_gas = 0u64;
        let mut fees = U256::ZERO;

        for (index, spec) in self.txs.into_iter().enumerate() {
            match spec {
                TxSpec::Transfer { from, to, value } => {
                    let fee = gas_price * U256::from(TRANSFER_GAS);
                    let nonce = {
                        let sender = state.entry(from).or_default();
                        let nonce = sender.nonce;
                        sender.balance = sender
                            .balance
                            .checked_sub(value + fee)
                            .expect("underfunded test account");
                        sender.nonce += 1;
                        nonce
                    };
                    state.entry(to).or_default().balance += value;
                    fees += fee;
                    cumulative_gas += TRANSFER_GAS;
                    transactions.push(TransactionRecord {
                        hash: tx_hash(self.number, index, self.salt),
                        from,
                        to: Some(to),
                        value,
                        gas_limit: TRANSFER_GAS,
                        gas_price,
                        nonce,
                        input: Bytes::new(),
                    });
                    receipts.push(ReceiptRecord {
                        status: true,
                        cumulative_gas_used: cumulative_gas,
                        gas_used: TRANSFER_GAS,
                        contract_address: None,
                        logs: vec![],
                    });
                }
                TxSpec::Create {
                    creator,
                    code,
                    endowment,
                } => {
                    let fee = gas_price * U256::from(CREATE_GAS);
                    let nonce = {
                        let sender = state.entry(creator).or_default();
                        let nonce = sender.nonce;
                        sender.balance = sender
                            .balance
                            .checked_sub(endowment + fee)
                            .expect("underfunded test account");
                        sender.nonce += 1;
                        nonce
                    };
                    let contract = contract_address(creator, nonce);
                    state.insert(
                        contract,
                        AccountState {
                            balance: endowment,
                            nonce: 1,
                            code: code.clone(),
                        },
                    );
                    fees += fee;
                    cumulative_gas += CREATE_GAS;
                    transactions.push(TransactionRecord {
                        hash: tx_hash(self.number, index, self.salt),
                        from: creator,
                        to: None,
                        value: endowment,
                        gas_limit: CREATE_GAS,
                        gas_price,
                        nonce,
                        input: code,
                    });
                    receipts.push(ReceiptRecord {
                        status: true,
                        cumulative_gas_used: cumulative_gas,
                        gas_used: CREATE_GAS,
                        contract_address: Some(contract),
                        logs: vec![],
                    });
                    trace.created_contracts.push(contract);
                }
            }
        }

        if fees > U256::ZERO {
            state.entry(self.beneficiary).or_default().balance += fees;
        }
        if let Some(amount) = self.reward {
            state.entry(self.beneficiary).or_default().balance += amount;
            trace.rewards.push(RewardRecord {
                beneficiary: self.beneficiary,
                amount,
                kind: RewardKind::Block,
            });
        }

        let difficulty = U256::from(DIFFICULTY);
        *td += difficulty;

        let header = BlockHeader {
            hash: block_hash(self.number, self.parent_hash, self.salt),
            parent_hash: self.parent_hash,
            number: self.number,
            timestamp: 1_600_000_000 + self.number * 15,
            beneficiary: self.beneficiary,
            difficulty,
            gas_limit: 8_000_000,
            gas_used: cumulative_gas,
            base_fee_per_gas: None,
            state_root: B256::ZERO,
            transactions_root: B256::ZERO,
            receipts_root: B256::ZERO,
        };

        MockBlock {
            header,
            body: BlockBody {
                transactions,
                ommers: vec![],
            },
            receipts,
            trace: Some(trace),
            state: state.clone(),
            total_difficulty: *td,
        }
    }
}

/// A builder for whole test chains, dense from block 0.
#[derive(Clone)]
pub struct ChainBuilder {
    blocks: Vec<MockBlock>,
    state: BTreeMap<Address, AccountState>,
    td: U256,
    parent: B256,
    next_number: u64,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            state: BTreeMap::new(),
            td: U256::ZERO,
            parent: B256::ZERO,
            next_number: 0,
        }
    }

    /// Seed account state from an allocation list and emit the (empty)
    /// genesis block.
    pub fn with_genesis_alloc(mut self, alloc: &GenesisAlloc) -> Self {
        assert_eq!(self.next_number, 0, "genesis must be the first block");
        for (address, account) in alloc.accounts() {
            self.state.insert(
                *address,
                AccountState {
                    balance: account.balance,
                    nonce: account.nonce,
                    code: account.code.clone(),
                },
            );
        }
        self.add_block(|b| b)
    }

    /// Fund an account before any block is built.
    pub fn fund(mut self, address: Address, balance: u64) -> Self {
        assert_eq!(self.next_number, 0, "funding happens before genesis");
        self.state.insert(
            address,
            AccountState {
                balance: U256::from(balance),
                ..Default::default()
            },
        );
        self
    }

    pub fn add_block(mut self, f: impl FnOnce(BlockBuilder) -> BlockBuilder) -> Self {
        let builder = BlockBuilder::new(self.next_number, self.parent);
        let block = f(builder).build(&mut self.state, &mut self.td);
        self.parent = block.header.hash;
        self.next_number += 1;
        self.blocks.push(block);
        self
    }

    pub fn add_empty_blocks(mut self, count: usize) -> Self {
        for _ in 0..count {
            self = self.add_block(|b| b);
        }
        self
    }

    /// Height of the last built block.
    pub fn height(&self) -> u64 {
        self.next_number.saturating_sub(1)
    }

    pub fn block_hash(&self, number: u64) -> Option<B256> {
        self.blocks.get(number as usize).map(|b| b.header.hash)
    }

    /// Contract addresses created by the block at `number`, in order.
    pub fn created_contracts(&self, number: u64) -> Vec<Address> {
        self.blocks
            .get(number as usize)
            .and_then(|b| b.trace.as_ref())
            .map(|t| t.created_contracts.clone())
            .unwrap_or_default()
    }

    /// A builder that shares history below `from` but will extend it with
    /// different blocks: the raw material for reorg tests.
    pub fn fork_at(&self, from: u64) -> Self {
        assert!(from > 0 && (from as usize) <= self.blocks.len());
        let base = &self.blocks[from as usize - 1];
        Self {
            blocks: self.blocks[..from as usize].to_vec(),
            state: base.state.clone(),
            td: base.total_difficulty,
            parent: base.header.hash,
            next_number: from,
        }
    }

    /// The block suffix at and above `from`, for `MockChainNode::simulate_reorg`.
    pub fn blocks_from(&self, from: u64) -> Vec<MockBlock> {
        self.blocks
            .iter()
            .filter(|b| b.header.number >= from)
            .cloned()
            .collect()
    }

    pub fn into_node(self) -> MockChainNode {
        let node = MockChainNode::new();
        for block in self.blocks {
            node.push_block(block);
        }
        node
    }
}
