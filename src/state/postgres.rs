//! PostgreSQL store
//!
//! Every mutating call runs in a transaction holding
//! `pg_advisory_xact_lock` on the hash lock, loads the [`SwapSlot`], applies
//! the shared lifecycle rules and writes the slot back.

use super::{
    ActionKind, CheckpointStore, EventKey, LockRecord, PreimageOutcome, Submission, Swap,
    SwapFlag, SwapRegistry, SwapSlot, SwapStats, SwapStatus, UpsertOutcome,
};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::hashlock::{parse_h256, ChainId, HashLock, Preimage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

const SWAP_COLUMNS: &str = "hash_lock, origin_chain, counter_chain, origin_htlc, counter_htlc, \
     amount, sender, receiver, time_lock, preimage, status, last_relay_attempt, attempt_count, \
     flag, last_error, archived, created_at, updated_at";

/// Store for PostgreSQL persistence
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                hash_lock BYTEA PRIMARY KEY,
                origin_chain BIGINT NOT NULL,
                counter_chain BIGINT NOT NULL,
                origin_htlc VARCHAR(42) NOT NULL,
                counter_htlc VARCHAR(42),
                amount TEXT NOT NULL,
                sender VARCHAR(42) NOT NULL,
                receiver VARCHAR(42),
                time_lock BIGINT NOT NULL,
                preimage BYTEA,
                status VARCHAR(20) NOT NULL,
                last_relay_attempt TIMESTAMPTZ,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                flag VARCHAR(32),
                last_error TEXT,
                archived BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_status ON swaps (status)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_origin_htlc ON swaps (origin_chain, origin_htlc)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_counter_htlc ON swaps (counter_chain, counter_htlc)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orphan_preimages (
                hash_lock BYTEA PRIMARY KEY,
                preimage BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS action_submissions (
                id BIGSERIAL PRIMARY KEY,
                action_id UUID NOT NULL,
                hash_lock BYTEA NOT NULL,
                kind VARCHAR(10) NOT NULL,
                chain_id BIGINT NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_submissions_hash_lock ON action_submissions (hash_lock)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                shard BIGINT NOT NULL,
                chain_id BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (shard, chain_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                shard BIGINT NOT NULL,
                chain_id BIGINT NOT NULL,
                tx_hash BYTEA NOT NULL,
                log_index BIGINT NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (shard, chain_id, tx_hash, log_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS watched_contracts (
                chain_id BIGINT NOT NULL,
                address VARCHAR(42) NOT NULL,
                from_block BIGINT NOT NULL,
                PRIMARY KEY (chain_id, address)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }

    /// Open a transaction serialised on one hash lock
    async fn lock_swap(&self, hash_lock: HashLock) -> RelayerResult<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(&hash_lock))
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn load_slot(
        tx: &mut Transaction<'_, Postgres>,
        hash_lock: HashLock,
    ) -> RelayerResult<SwapSlot> {
        let swap = sqlx::query(&format!(
            "SELECT {} FROM swaps WHERE hash_lock = $1",
            SWAP_COLUMNS
        ))
        .bind(hash_lock.as_bytes())
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| swap_from_row(&row))
        .transpose()?;

        let orphan_preimage = sqlx::query("SELECT preimage FROM orphan_preimages WHERE hash_lock = $1")
            .bind(hash_lock.as_bytes())
            .fetch_optional(&mut **tx)
            .await?
            .map(|row| h256_from_bytes(row.get("preimage")))
            .transpose()?;

        Ok(SwapSlot {
            swap,
            orphan_preimage,
        })
    }

    async fn save_swap(tx: &mut Transaction<'_, Postgres>, swap: &Swap) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO swaps (hash_lock, origin_chain, counter_chain, origin_htlc, counter_htlc,
                amount, sender, receiver, time_lock, preimage, status, last_relay_attempt,
                attempt_count, flag, last_error, archived, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (hash_lock) DO UPDATE SET
                counter_htlc = EXCLUDED.counter_htlc,
                receiver = EXCLUDED.receiver,
                preimage = EXCLUDED.preimage,
                status = EXCLUDED.status,
                last_relay_attempt = EXCLUDED.last_relay_attempt,
                attempt_count = EXCLUDED.attempt_count,
                flag = EXCLUDED.flag,
                last_error = EXCLUDED.last_error,
                archived = EXCLUDED.archived,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(swap.hash_lock.as_bytes())
        .bind(swap.origin_chain as i64)
        .bind(swap.counter_chain as i64)
        .bind(format!("{:?}", swap.origin_htlc))
        .bind(swap.counter_htlc.map(|a| format!("{:?}", a)))
        .bind(swap.amount.to_string())
        .bind(format!("{:?}", swap.sender))
        .bind(swap.receiver.map(|a| format!("{:?}", a)))
        .bind(swap.time_lock as i64)
        .bind(swap.preimage.map(|p| p.as_bytes().to_vec()))
        .bind(swap.status.as_str())
        .bind(swap.last_relay_attempt)
        .bind(swap.attempt_count as i32)
        .bind(swap.flag.map(|f| f.as_str()))
        .bind(swap.last_error.as_deref())
        .bind(swap.archived)
        .bind(swap.created_at)
        .bind(swap.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Load, mutate and persist one swap under its lock
    async fn update_swap<T>(
        &self,
        hash_lock: HashLock,
        f: impl FnOnce(&mut Swap) -> RelayerResult<T> + Send,
    ) -> RelayerResult<T> {
        let mut tx = self.lock_swap(hash_lock).await?;
        let mut slot = Self::load_slot(&mut tx, hash_lock).await?;
        let swap = slot.swap_mut(hash_lock)?;
        let result = f(swap)?;
        Self::save_swap(&mut tx, swap).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn fetch_swaps(&self, sql: &str, status: Option<&str>, limit: i64) -> RelayerResult<Vec<Swap>> {
        let rows = sqlx::query(sql)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(swap_from_row).collect()
    }
}

#[async_trait]
impl SwapRegistry for PgStore {
    async fn upsert_on_lock(&self, record: LockRecord) -> RelayerResult<UpsertOutcome> {
        let mut tx = self.lock_swap(record.hash_lock).await?;
        let mut slot = Self::load_slot(&mut tx, record.hash_lock).await?;
        let had_orphan = slot.orphan_preimage.is_some();

        let outcome = slot.apply_lock(&record, Utc::now());
        if !matches!(outcome, UpsertOutcome::Unchanged(_)) {
            Self::save_swap(&mut tx, outcome.swap()).await?;
        }
        if had_orphan && slot.orphan_preimage.is_none() {
            sqlx::query("DELETE FROM orphan_preimages WHERE hash_lock = $1")
                .bind(record.hash_lock.as_bytes())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn record_preimage(
        &self,
        hash_lock: HashLock,
        preimage: Preimage,
    ) -> RelayerResult<PreimageOutcome> {
        let mut tx = self.lock_swap(hash_lock).await?;
        let mut slot = Self::load_slot(&mut tx, hash_lock).await?;

        let outcome = slot.apply_preimage(hash_lock, preimage, Utc::now())?;
        if outcome == PreimageOutcome::Recorded {
            match slot.swap.as_ref() {
                Some(swap) => Self::save_swap(&mut tx, swap).await?,
                None => {
                    sqlx::query(
                        "INSERT INTO orphan_preimages (hash_lock, preimage) VALUES ($1, $2)",
                    )
                    .bind(hash_lock.as_bytes())
                    .bind(preimage.as_bytes())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn transition(
        &self,
        hash_lock: HashLock,
        from: SwapStatus,
        to: SwapStatus,
    ) -> RelayerResult<Swap> {
        self.update_swap(hash_lock, |swap| {
            swap.advance(from, to, Utc::now())?;
            Ok(swap.clone())
        })
        .await
    }

    async fn get(&self, hash_lock: HashLock) -> RelayerResult<Option<Swap>> {
        sqlx::query(&format!(
            "SELECT {} FROM swaps WHERE hash_lock = $1",
            SWAP_COLUMNS
        ))
        .bind(hash_lock.as_bytes())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| swap_from_row(&row))
        .transpose()
    }

    async fn find_by_htlc(&self, chain: ChainId, htlc: Address) -> RelayerResult<Option<HashLock>> {
        let row = sqlx::query(
            r#"
            SELECT hash_lock FROM swaps
            WHERE (origin_chain = $1 AND origin_htlc = $2)
               OR (counter_chain = $1 AND counter_htlc = $2)
            LIMIT 1
            "#,
        )
        .bind(chain as i64)
        .bind(format!("{:?}", htlc))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| h256_from_bytes(r.get("hash_lock"))).transpose()
    }

    async fn list_pending(&self) -> RelayerResult<Vec<Swap>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM swaps WHERE status IN ('locked', 'relaying', 'refunding')",
            SWAP_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(swap_from_row).collect()
    }

    async fn list(&self, status: Option<SwapStatus>, limit: usize) -> RelayerResult<Vec<Swap>> {
        let sql = format!(
            "SELECT {} FROM swaps WHERE ($1::VARCHAR IS NULL OR status = $1) \
             ORDER BY updated_at DESC LIMIT $2",
            SWAP_COLUMNS
        );
        self.fetch_swaps(&sql, status.map(|s| s.as_str()), limit as i64)
            .await
    }

    async fn record_attempt(&self, hash_lock: HashLock) -> RelayerResult<u32> {
        self.update_swap(hash_lock, |swap| {
            swap.attempt_count += 1;
            swap.last_relay_attempt = Some(Utc::now());
            Ok(swap.attempt_count)
        })
        .await
    }

    async fn record_submission(&self, submission: &Submission) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO action_submissions (action_id, hash_lock, kind, chain_id, tx_hash)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(submission.action_id)
        .bind(submission.hash_lock.as_bytes())
        .bind(submission.kind.as_str())
        .bind(submission.chain_id as i64)
        .bind(format!("{:?}", submission.tx_hash))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_submission(
        &self,
        hash_lock: HashLock,
        kind: ActionKind,
    ) -> RelayerResult<Option<Submission>> {
        let row = sqlx::query(
            r#"
            SELECT action_id, chain_id, tx_hash FROM action_submissions
            WHERE hash_lock = $1 AND kind = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(hash_lock.as_bytes())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let raw: String = row.get("tx_hash");
            let tx_hash = parse_h256(&raw)
                .ok_or_else(|| RelayerError::Internal(format!("bad tx hash '{}'", raw)))?;
            Ok(Submission {
                action_id: row.get("action_id"),
                hash_lock,
                kind,
                chain_id: row.get::<i64, _>("chain_id") as u64,
                tx_hash,
            })
        })
        .transpose()
    }

    async fn flag(&self, hash_lock: HashLock, flag: SwapFlag, message: String) -> RelayerResult<()> {
        self.update_swap(hash_lock, |swap| {
            swap.set_flag(flag, message, Utc::now());
            Ok(())
        })
        .await
    }

    async fn clear_flag(&self, hash_lock: HashLock) -> RelayerResult<Swap> {
        self.update_swap(hash_lock, |swap| {
            if swap.is_frozen() {
                return Err(RelayerError::SwapFrozen { hash_lock });
            }
            swap.flag = None;
            swap.updated_at = Utc::now();
            Ok(swap.clone())
        })
        .await
    }

    async fn archive_terminal(&self, before: DateTime<Utc>) -> RelayerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE swaps SET archived = TRUE
            WHERE archived = FALSE
              AND status IN ('relayed', 'refunded', 'expired_unresolved')
              AND updated_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> RelayerResult<SwapStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total, COUNT(flag) AS flagged
            FROM swaps
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = SwapStats::default();
        for status in SwapStatus::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }
        for row in rows {
            let status: String = row.get("status");
            stats
                .by_status
                .insert(status, row.get::<i64, _>("total") as u64);
            stats.flagged += row.get::<i64, _>("flagged") as u64;
        }

        Ok(stats)
    }

    /// Health check
    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn get_checkpoint(&self, shard: u64, chain_id: ChainId) -> RelayerResult<Option<u64>> {
        let row = sqlx::query(
            "SELECT block_number FROM chain_checkpoints WHERE shard = $1 AND chain_id = $2",
        )
        .bind(shard as i64)
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn save_checkpoint(
        &self,
        shard: u64,
        chain_id: ChainId,
        block_number: u64,
    ) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (shard, chain_id, block_number, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (shard, chain_id)
            DO UPDATE SET block_number = $3, updated_at = NOW()
            "#,
        )
        .bind(shard as i64)
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!(
            "Saved checkpoint for chain {} (shard {}): block {}",
            chain_id, shard, block_number
        );
        Ok(())
    }

    async fn is_processed(&self, shard: u64, key: &EventKey) -> RelayerResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS hit FROM processed_events
            WHERE shard = $1 AND chain_id = $2 AND tx_hash = $3 AND log_index = $4
            "#,
        )
        .bind(shard as i64)
        .bind(key.chain_id as i64)
        .bind(key.tx_hash.as_bytes())
        .bind(key.log_index as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn mark_processed(&self, shard: u64, key: &EventKey) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (shard, chain_id, tx_hash, log_index)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(shard as i64)
        .bind(key.chain_id as i64)
        .bind(key.tx_hash.as_bytes())
        .bind(key.log_index as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn watch_contract(
        &self,
        chain_id: ChainId,
        address: Address,
        from_block: u64,
    ) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO watched_contracts (chain_id, address, from_block)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(chain_id as i64)
        .bind(format!("{:?}", address))
        .bind(from_block as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn watched_contracts(&self, chain_id: ChainId) -> RelayerResult<Vec<(Address, u64)>> {
        let rows = sqlx::query(
            "SELECT address, from_block FROM watched_contracts WHERE chain_id = $1",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let address = parse_address(row.get("address"))?;
                Ok((address, row.get::<i64, _>("from_block") as u64))
            })
            .collect()
    }
}

/// Advisory lock key derived from the leading bytes of the hash lock
fn advisory_key(hash_lock: &HashLock) -> i64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash_lock.as_bytes()[..8]);
    i64::from_be_bytes(prefix)
}

fn h256_from_bytes(bytes: Vec<u8>) -> RelayerResult<H256> {
    if bytes.len() != 32 {
        return Err(RelayerError::Internal(format!(
            "expected 32 bytes, found {}",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(&bytes))
}

fn parse_address(raw: String) -> RelayerResult<Address> {
    raw.parse()
        .map_err(|e| RelayerError::Internal(format!("bad address '{}': {}", raw, e)))
}

fn swap_from_row(row: &PgRow) -> RelayerResult<Swap> {
    let amount: String = row.get("amount");
    let status: String = row.get("status");

    Ok(Swap {
        hash_lock: h256_from_bytes(row.get("hash_lock"))?,
        origin_chain: row.get::<i64, _>("origin_chain") as u64,
        counter_chain: row.get::<i64, _>("counter_chain") as u64,
        origin_htlc: parse_address(row.get("origin_htlc"))?,
        counter_htlc: row
            .get::<Option<String>, _>("counter_htlc")
            .map(parse_address)
            .transpose()?,
        amount: U256::from_dec_str(&amount)
            .map_err(|e| RelayerError::Internal(format!("bad amount '{}': {}", amount, e)))?,
        sender: parse_address(row.get("sender"))?,
        receiver: row
            .get::<Option<String>, _>("receiver")
            .map(parse_address)
            .transpose()?,
        time_lock: row.get::<i64, _>("time_lock") as u64,
        preimage: row
            .get::<Option<Vec<u8>>, _>("preimage")
            .map(h256_from_bytes)
            .transpose()?,
        status: status.parse()?,
        last_relay_attempt: row.get("last_relay_attempt"),
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        flag: row
            .get::<Option<String>, _>("flag")
            .map(|f| f.parse())
            .transpose()?,
        last_error: row.get("last_error"),
        archived: row.get("archived"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
