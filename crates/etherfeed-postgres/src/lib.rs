//! # etherfeed-postgres
//!
//! Relational sink: persists each enriched block as queryable rows plus the
//! raw encoded payload, inside a single transaction that also moves the
//! stream's checkpoint row. A crash mid-write leaves the checkpoint
//! unchanged and no partial row set visible to readers; re-writing a height
//! replaces its rows by primary key, so a retried ambiguous write is
//! idempotent.

use alloy_primitives::hex::{FromHex, ToHexExt};
use alloy_primitives::B256;
use async_trait::async_trait;
use log::{debug, info};
use sqlx::PgPool;

use etherfeed_sync::{
    decode_block, BalanceChangeCause, BlockRef, BlockSink, EncodedBlock, SyncError, SyncResult,
    SyncState, TokenInterface,
};

#[derive(Debug, Clone)]
pub struct PostgresSinkConfig {
    pub url: String,
    /// Logical stream id; keys the checkpoint row.
    pub stream: String,
}

/// Transactional PostgreSQL sink for one stream.
#[derive(Debug, Clone)]
pub struct PostgresBlockSink {
    pool: PgPool,
    stream: String,
}

impl PostgresBlockSink {
    pub async fn connect(config: PostgresSinkConfig) -> SyncResult<Self> {
        let pool = PgPool::connect(&config.url).await.map_err(db_err)?;
        Ok(Self::new(pool, config.stream))
    }

    pub fn new(pool: PgPool, stream: String) -> Self {
        Self { pool, stream }
    }

    pub async fn run_migrations(&self) -> SyncResult<()> {
        info!("running migrations for stream '{}'", self.stream);
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::SinkWrite(format!("migration failed: {}", e)))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    block_number: i64,
    block_hash: String,
}

#[derive(sqlx::FromRow)]
struct BlockRefRow {
    number: i64,
    hash: String,
}

#[async_trait]
impl BlockSink for PostgresBlockSink {
    async fn write(
        &mut self,
        block: &EncodedBlock,
        number: u64,
        hash: B256,
    ) -> SyncResult<SyncState> {
        let decoded = decode_block(block.as_bytes())?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO blocks (stream, number, hash, parent_hash, block_timestamp, gas_used, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stream, number)
            DO UPDATE SET hash = EXCLUDED.hash, parent_hash = EXCLUDED.parent_hash,
                          block_timestamp = EXCLUDED.block_timestamp,
                          gas_used = EXCLUDED.gas_used, payload = EXCLUDED.payload
            "#,
        )
        .bind(&self.stream)
        .bind(number as i64)
        .bind(hash.encode_hex_with_prefix())
        .bind(decoded.header.parent_hash.encode_hex_with_prefix())
        .bind(decoded.header.timestamp as i64)
        .bind(decoded.header.gas_used as i64)
        .bind(block.as_bytes())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Replace, not append: a retried write must not leave duplicates.
        sqlx::query("DELETE FROM account_deltas WHERE stream = $1 AND block_number = $2")
            .bind(&self.stream)
            .bind(number as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for delta in &decoded.balance_deltas {
            sqlx::query(
                r#"
                INSERT INTO account_deltas (stream, block_number, address, old_balance, new_balance, cause)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&self.stream)
            .bind(number as i64)
            .bind(delta.address.encode_hex_with_prefix())
            .bind(delta.old_balance.to_string())
            .bind(delta.new_balance.to_string())
            .bind(cause_label(delta.cause))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query("DELETE FROM token_classifications WHERE stream = $1 AND block_number = $2")
            .bind(&self.stream)
            .bind(number as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for classification in &decoded.token_classifications {
            let interfaces: Vec<String> = classification
                .interfaces
                .iter()
                .map(|i| interface_label(*i).to_string())
                .collect();
            let decimals = classification
                .erc20
                .as_ref()
                .and_then(|meta| meta.decimals)
                .map(|d| d as i16);
            sqlx::query(
                r#"
                INSERT INTO token_classifications (stream, block_number, address, interfaces, decimals)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&self.stream)
            .bind(number as i64)
            .bind(classification.address.encode_hex_with_prefix())
            .bind(&interfaces)
            .bind(decimals)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        // The checkpoint moves in the same transaction as the rows.
        sqlx::query(
            r#"
            INSERT INTO checkpoints (stream, block_number, block_hash, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (stream)
            DO UPDATE SET block_number = EXCLUDED.block_number,
                          block_hash = EXCLUDED.block_hash, updated_at = NOW()
            "#,
        )
        .bind(&self.stream)
        .bind(number as i64)
        .bind(hash.encode_hex_with_prefix())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!("stream '{}': block {} committed", self.stream, number);

        Ok(SyncState {
            block_number: number,
            block_hash: hash,
        })
    }

    async fn current_head(&self) -> SyncResult<Option<SyncState>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT block_number, block_hash FROM checkpoints WHERE stream = $1",
        )
        .bind(&self.stream)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| {
            Ok(SyncState {
                block_number: r.block_number as u64,
                block_hash: parse_hash(&r.block_hash)?,
            })
        })
        .transpose()
    }

    async fn truncate_from(&mut self, number: u64) -> SyncResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for table in ["account_deltas", "token_classifications"] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE stream = $1 AND block_number >= $2",
                table
            ))
            .bind(&self.stream)
            .bind(number as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        sqlx::query("DELETE FROM blocks WHERE stream = $1 AND number >= $2")
            .bind(&self.stream)
            .bind(number as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let survivor = sqlx::query_as::<_, BlockRefRow>(
            "SELECT number, hash FROM blocks WHERE stream = $1 ORDER BY number DESC LIMIT 1",
        )
        .bind(&self.stream)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        match survivor {
            Some(row) => {
                sqlx::query(
                    r#"
                    UPDATE checkpoints SET block_number = $2, block_hash = $3, updated_at = NOW()
                    WHERE stream = $1
                    "#,
                )
                .bind(&self.stream)
                .bind(row.number)
                .bind(row.hash)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query("DELETE FROM checkpoints WHERE stream = $1")
                    .bind(&self.stream)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        info!(
            "stream '{}': truncated records at and above block {}",
            self.stream, number
        );
        Ok(())
    }

    async fn recent_blocks(&self, limit: usize) -> SyncResult<Vec<BlockRef>> {
        let rows = sqlx::query_as::<_, BlockRefRow>(
            "SELECT number, hash FROM blocks WHERE stream = $1 ORDER BY number DESC LIMIT $2",
        )
        .bind(&self.stream)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                Ok(BlockRef {
                    number: row.number as u64,
                    hash: parse_hash(&row.hash)?,
                })
            })
            .collect()
    }
}

fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::SinkWrite(format!("postgres error: {}", e))
}

fn parse_hash(raw: &str) -> SyncResult<B256> {
    B256::from_hex(raw)
        .map_err(|e| SyncError::Serialization(format!("stored hash '{}' invalid: {}", raw, e)))
}

fn cause_label(cause: BalanceChangeCause) -> &'static str {
    match cause {
        BalanceChangeCause::Allocation => "allocation",
        BalanceChangeCause::ValueTransfer => "value_transfer",
        BalanceChangeCause::GasFee => "gas_fee",
        BalanceChangeCause::Reward => "reward",
        BalanceChangeCause::SelfDestructRefund => "self_destruct_refund",
    }
}

fn interface_label(interface: TokenInterface) -> &'static str {
    match interface {
        TokenInterface::Erc20 => "ERC20",
        TokenInterface::Erc165 => "ERC165",
        TokenInterface::Erc721 => "ERC721",
        TokenInterface::Erc777 => "ERC777",
        TokenInterface::Erc1155 => "ERC1155",
    }
}
