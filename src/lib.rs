//! Etherfeed Test Suite
//!
//! Integration tests for the etherfeed ingestion pipeline, driving the real
//! tracker/assembler/encoder stack against the in-memory mock node and sink.

pub mod chain_builder;

#[cfg(test)]
mod tests;

pub use chain_builder::{BlockBuilder, ChainBuilder};
