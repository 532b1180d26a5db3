//! Synthetic account views built from genesis allocation data
//!
//! The genesis block has no live chain state to diff against, so touched
//! accounts and balance deltas are synthesized directly from the allocation
//! list, and classification probes run against a state view backed by the
//! allocation itself.

use std::collections::BTreeMap;

use alloy_primitives::{keccak256, Address, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::{
    AccountSnapshot, BalanceChangeCause, BalanceDelta, ProbeAccount, StateView, SyncError,
    SyncResult,
};

/// One allocated account in the genesis state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    #[serde(default)]
    pub balance: U256,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub code: Bytes,
}

/// The genesis allocation list, address -> pre-funded account. Ordered so
/// everything derived from it is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenesisAlloc {
    accounts: BTreeMap<Address, GenesisAccount>,
}

impl GenesisAlloc {
    pub fn new(accounts: BTreeMap<Address, GenesisAccount>) -> Self {
        Self { accounts }
    }

    /// Parse a conventional geth-style `alloc` JSON object.
    pub fn from_json(raw: &str) -> SyncResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SyncError::Serialization(format!("invalid genesis alloc: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &GenesisAccount)> {
        self.accounts.iter()
    }

    pub fn get(&self, address: &Address) -> Option<&GenesisAccount> {
        self.accounts.get(address)
    }

    /// Addresses allocated with contract code.
    pub fn contract_addresses(&self) -> Vec<Address> {
        self.accounts
            .iter()
            .filter(|(_, account)| !account.code.is_empty())
            .map(|(address, _)| *address)
            .collect()
    }

    /// Build the touched-account snapshots and `Allocation` balance deltas
    /// the genesis block carries: every allocated account is touched, every
    /// balance is a delta from zero.
    pub fn synthesize(&self) -> (Vec<AccountSnapshot>, Vec<BalanceDelta>) {
        let mut snapshots = Vec::with_capacity(self.accounts.len());
        let mut deltas = Vec::with_capacity(self.accounts.len());
        for (address, account) in &self.accounts {
            snapshots.push(AccountSnapshot {
                address: *address,
                balance: account.balance,
                nonce: account.nonce,
                code: account.code.clone(),
                code_hash: keccak256(&account.code),
                created_contract: !account.code.is_empty(),
            });
            deltas.push(BalanceDelta {
                address: *address,
                old_balance: U256::ZERO,
                new_balance: account.balance,
                cause: BalanceChangeCause::Allocation,
            });
        }
        (snapshots, deltas)
    }
}

impl StateView for GenesisAlloc {
    fn basic(&self, address: Address) -> Option<ProbeAccount> {
        self.accounts.get(&address).map(|account| ProbeAccount {
            balance: account.balance,
            nonce: account.nonce,
            code: account.code.clone(),
        })
    }

    fn storage(&self, _address: Address, _slot: U256) -> U256 {
        // Allocation lists carry no storage.
        U256::ZERO
    }
}
