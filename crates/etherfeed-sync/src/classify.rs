//! # Token Classification Engine
//!
//! Determines which token-standard interfaces a newly-created contract
//! implements by executing small fixed probes against it inside a disposable
//! execution frame. Each probe gets a fresh copy-on-write [`CacheDB`] layered
//! over an immutable [`StateView`] snapshot, a fixed caller, and a fixed gas
//! allowance the contract cannot influence — nothing a probe does can reach
//! real chain state, and a probe that reverts, runs out of gas, or faults in
//! any way is a non-match, never an error.
//!
//! Probes:
//! - ERC165 / ERC721 / ERC1155 use the standard `supportsInterface`
//!   introspection pattern (the EIP-165 detection rule for ERC165 itself:
//!   true for `0x01ffc9a7`, false for `0xffffffff`).
//! - ERC20 has no introspection; the probe is best-effort — `totalSupply()`
//!   and `balanceOf(0)` must both answer with an ABI word, and `decimals()`
//!   is attempted for auxiliary metadata only.
//! - ERC777 is likewise best-effort via `granularity()`, which the standard
//!   requires to be at least 1.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::time::{Duration, Instant};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use log::{debug, warn};
use revm::db::CacheDB;
use revm::primitives::{AccountInfo, Bytecode, ExecutionResult, Output, TransactTo};
use revm::{DatabaseRef, Evm};

use crate::{Erc20Metadata, ProbeAccount, StateView, TokenClassification, TokenInterface};

/// Gas allowed per probe call. Fixed, not contract-configurable. ERC165
/// mandates `supportsInterface` complete in under 30k gas; the margin here
/// covers proxies and the best-effort probes.
pub const PROBE_GAS_LIMIT: u64 = 1_000_000;

/// Fixed caller for probe frames. Deliberately not the zero address, which
/// some contracts special-case.
const PROBE_CALLER: Address = Address::with_last_byte(0xfe);

const SUPPORTS_INTERFACE: [u8; 4] = [0x01, 0xff, 0xc9, 0xa7];
const ERC165_ID: [u8; 4] = [0x01, 0xff, 0xc9, 0xa7];
const ERC165_INVALID_ID: [u8; 4] = [0xff, 0xff, 0xff, 0xff];
const ERC721_ID: [u8; 4] = [0x80, 0xac, 0x58, 0xcd];
const ERC1155_ID: [u8; 4] = [0xd9, 0xb6, 0x7a, 0x26];
const SEL_TOTAL_SUPPLY: [u8; 4] = [0x18, 0x16, 0x0d, 0xdd];
const SEL_BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
const SEL_DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
const SEL_GRANULARITY: [u8; 4] = [0x55, 0x6f, 0x0d, 0xc7];

/// Adapts a [`StateView`] snapshot to revm's read-only database interface.
struct SnapshotDb<'a> {
    view: &'a dyn StateView,
}

impl DatabaseRef for SnapshotDb<'_> {
    type Error = Infallible;

    fn basic_ref(&self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        Ok(self.view.basic(address).map(|account| {
            let code_hash = keccak256(&account.code);
            AccountInfo {
                balance: account.balance,
                nonce: account.nonce,
                code_hash,
                code: Some(Bytecode::new_raw(account.code.clone())),
            }
        }))
    }

    fn code_by_hash_ref(&self, _code_hash: B256) -> Result<Bytecode, Self::Error> {
        // Code is always carried inline by `basic_ref`.
        Ok(Bytecode::new())
    }

    fn storage_ref(&self, address: Address, slot: U256) -> Result<U256, Self::Error> {
        Ok(self.view.storage(address, slot))
    }

    fn block_hash_ref(&self, _number: u64) -> Result<B256, Self::Error> {
        Ok(B256::ZERO)
    }
}

/// Classifies contract addresses against the known token interfaces.
#[derive(Debug, Clone)]
pub struct TokenClassifier {
    gas_limit: u64,
    /// Wall-clock ceiling for one whole classification. Gas is the primary
    /// bound; this is the backstop against pathological bytecode. Probes
    /// that would start past the deadline resolve to non-match.
    budget: Duration,
}

impl Default for TokenClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenClassifier {
    pub fn new() -> Self {
        Self {
            gas_limit: PROBE_GAS_LIMIT,
            budget: Duration::from_millis(250),
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Run the full probe set against `address` on top of `view`.
    ///
    /// Always returns a classification; an address with no code, or one that
    /// faults on every probe, classifies as the empty set.
    pub fn classify(&self, view: &dyn StateView, address: Address) -> TokenClassification {
        let mut interfaces = BTreeSet::new();
        let mut erc20 = None;

        let has_code = view
            .basic(address)
            .map(|account| !account.code.is_empty())
            .unwrap_or(false);
        if !has_code {
            return TokenClassification {
                address,
                interfaces,
                erc20,
            };
        }

        let deadline = Instant::now() + self.budget;
        let mut probe = |calldata: Bytes| -> Option<Bytes> {
            if Instant::now() >= deadline {
                warn!(
                    "classification budget exhausted for {}; remaining probes skipped",
                    address
                );
                return None;
            }
            self.call(view, address, calldata)
        };

        // EIP-165 detection rule.
        if probe(supports_interface_calldata(ERC165_ID))
            .as_deref()
            .map(|o| word_is_true(o))
            .unwrap_or(false)
            && probe(supports_interface_calldata(ERC165_INVALID_ID))
                .as_deref()
                .map(|out| !word_is_true(out))
                .unwrap_or(false)
        {
            interfaces.insert(TokenInterface::Erc165);
        }

        // ERC721 and ERC1155 go through supportsInterface as well, so a
        // match implies ERC165 by construction of the probe.
        if probe(supports_interface_calldata(ERC721_ID))
            .as_deref()
            .map(|o| word_is_true(o))
            .unwrap_or(false)
        {
            interfaces.insert(TokenInterface::Erc721);
            interfaces.insert(TokenInterface::Erc165);
        }
        if probe(supports_interface_calldata(ERC1155_ID))
            .as_deref()
            .map(|o| word_is_true(o))
            .unwrap_or(false)
        {
            interfaces.insert(TokenInterface::Erc1155);
            interfaces.insert(TokenInterface::Erc165);
        }

        // Best-effort ERC20: no introspection exists, so require the two
        // mandatory views to answer with ABI words.
        let total_supply = probe(selector_calldata(SEL_TOTAL_SUPPLY))
            .as_deref()
            .and_then(|o| abi_word(o));
        let balance_of = probe(balance_of_calldata(Address::ZERO))
            .as_deref()
            .and_then(|o| abi_word(o));
        if total_supply.is_some() && balance_of.is_some() {
            interfaces.insert(TokenInterface::Erc20);
            let decimals = probe(selector_calldata(SEL_DECIMALS))
                .as_deref()
                .and_then(|o| abi_word(o))
                .filter(|word| *word <= U256::from(u8::MAX))
                .map(|word| word.to::<u8>());
            erc20 = Some(Erc20Metadata { decimals });
        }

        // Best-effort ERC777: granularity() must exist and be >= 1.
        if probe(selector_calldata(SEL_GRANULARITY))
            .as_deref()
            .and_then(|o| abi_word(o))
            .map(|word| word >= U256::from(1))
            .unwrap_or(false)
        {
            interfaces.insert(TokenInterface::Erc777);
        }

        debug!("classified {} as {:?}", address, interfaces);
        TokenClassification {
            address,
            interfaces,
            erc20,
        }
    }

    /// One probe call in a fresh disposable frame. `None` on any execution
    /// fault.
    fn call(&self, view: &dyn StateView, target: Address, calldata: Bytes) -> Option<Bytes> {
        let db = CacheDB::new(SnapshotDb { view });
        let mut evm = Evm::builder()
            .with_db(db)
            .modify_tx_env(|tx| {
                tx.caller = PROBE_CALLER;
                tx.transact_to = TransactTo::Call(target);
                tx.data = calldata;
                tx.value = U256::ZERO;
                tx.gas_limit = self.gas_limit;
                tx.gas_price = U256::ZERO;
            })
            .build();
        match evm.transact() {
            Ok(outcome) => match outcome.result {
                ExecutionResult::Success {
                    output: Output::Call(bytes),
                    ..
                } => Some(bytes),
                _ => None,
            },
            Err(_) => None,
        }
    }
}

fn selector_calldata(selector: [u8; 4]) -> Bytes {
    Bytes::from(selector.to_vec())
}

fn supports_interface_calldata(interface_id: [u8; 4]) -> Bytes {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&SUPPORTS_INTERFACE);
    data.extend_from_slice(&interface_id);
    data.extend_from_slice(&[0u8; 28]);
    Bytes::from(data)
}

fn balance_of_calldata(owner: Address) -> Bytes {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&SEL_BALANCE_OF);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(owner.as_slice());
    Bytes::from(data)
}

/// The leading 32-byte ABI word of a return payload, if there is one.
fn abi_word(output: &[u8]) -> Option<U256> {
    if output.len() < 32 {
        return None;
    }
    Some(U256::from_be_slice(&output[..32]))
}

fn word_is_true(output: &[u8]) -> bool {
    abi_word(output) == Some(U256::from(1))
}
