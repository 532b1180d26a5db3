//! Deterministic binary encoding of enriched blocks
//!
//! One buffer per block: a single format-version byte followed by a framed
//! bincode body with a fixed field order (header, body, receipts, rewards,
//! trace sections, touched accounts, balance deltas, classifications, total
//! difficulty). Optional sections that are absent encode as `None`, never as
//! an empty placeholder, so consumers can tell "no rewards recorded" apart
//! from "trace unavailable". Encoding is a pure function of the block: all
//! collections are pre-ordered and nothing non-deterministic is embedded.

use serde::{Deserialize, Serialize};

use crate::{
    AccountSnapshot, BalanceDelta, BlockBody, BlockHeader, BlockTrace, EnrichedBlock,
    InternalCall, ReceiptRecord, RewardRecord, SelfDestructRecord, SyncError, SyncResult,
    TokenClassification,
};
use alloy_primitives::{Address, U256};

/// Bumped whenever the envelope layout changes.
pub const FORMAT_VERSION: u8 = 1;

/// An encoded enriched block, ready for a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock {
    bytes: Vec<u8>,
}

impl EncodedBlock {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Wire layout. Field order is fixed; `rewards` is present only when at
/// least one reward exists, while `internal_calls` presence marks whether
/// the trace was available at all.
#[derive(Serialize, Deserialize)]
struct BlockEnvelope {
    header: BlockHeader,
    body: BlockBody,
    receipts: Vec<ReceiptRecord>,
    rewards: Option<Vec<RewardRecord>>,
    internal_calls: Option<Vec<InternalCall>>,
    created_contracts: Option<Vec<Address>>,
    self_destructs: Option<Vec<SelfDestructRecord>>,
    touched_accounts: Vec<AccountSnapshot>,
    balance_deltas: Vec<BalanceDelta>,
    token_classifications: Vec<TokenClassification>,
    total_difficulty: Option<U256>,
}

/// Serialize an enriched block into its transport buffer.
pub fn encode_block(block: &EnrichedBlock) -> SyncResult<EncodedBlock> {
    let rewards = block.trace.as_ref().and_then(|trace| {
        if trace.rewards.is_empty() {
            None
        } else {
            Some(trace.rewards.clone())
        }
    });
    let envelope = BlockEnvelope {
        header: block.header.clone(),
        body: block.body.clone(),
        receipts: block.receipts.clone(),
        rewards,
        internal_calls: block.trace.as_ref().map(|t| t.internal_calls.clone()),
        created_contracts: block.trace.as_ref().map(|t| t.created_contracts.clone()),
        self_destructs: block.trace.as_ref().map(|t| t.self_destructs.clone()),
        touched_accounts: block.touched_accounts.clone(),
        balance_deltas: block.balance_deltas.clone(),
        token_classifications: block.token_classifications.clone(),
        total_difficulty: block.total_difficulty,
    };
    let body = bincode::serialize(&envelope)
        .map_err(|e| SyncError::Serialization(format!("block encode failed: {}", e)))?;
    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&body);
    Ok(EncodedBlock { bytes })
}

/// Decode a transport buffer back into an enriched block.
pub fn decode_block(bytes: &[u8]) -> SyncResult<EnrichedBlock> {
    let (&version, body) = bytes
        .split_first()
        .ok_or_else(|| SyncError::Serialization("empty block buffer".to_string()))?;
    if version != FORMAT_VERSION {
        return Err(SyncError::Serialization(format!(
            "unsupported block format version {}",
            version
        )));
    }
    let envelope: BlockEnvelope = bincode::deserialize(body)
        .map_err(|e| SyncError::Serialization(format!("block decode failed: {}", e)))?;

    // `internal_calls` presence marks trace availability; an absent rewards
    // section inside an available trace means "no reward events recorded".
    let trace = envelope.internal_calls.map(|internal_calls| BlockTrace {
        rewards: envelope.rewards.unwrap_or_default(),
        internal_calls,
        created_contracts: envelope.created_contracts.unwrap_or_default(),
        self_destructs: envelope.self_destructs.unwrap_or_default(),
    });

    Ok(EnrichedBlock {
        header: envelope.header,
        body: envelope.body,
        receipts: envelope.receipts,
        total_difficulty: envelope.total_difficulty,
        trace,
        touched_accounts: envelope.touched_accounts,
        balance_deltas: envelope.balance_deltas,
        token_classifications: envelope.token_classifications,
    })
}
