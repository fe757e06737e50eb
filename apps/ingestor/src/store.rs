use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use rust_decimal::Decimal;
use schema::{RawSwapRecord, Side, SwapRecord};
use serde::Serialize;
use sqlx::{
    FromRow, PgPool,
    postgres::{PgPoolOptions, PgQueryResult},
};
use std::time::Duration;

const MIGRATION: &str = include_str!("../migrations/0001_swaps.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The ledger row already existed (a concurrent run got there first);
    /// nothing was written.
    AlreadyPresent,
}

/// Persisted swap store. Append-only from the ingestion side.
#[async_trait]
pub trait SwapStore: Send + Sync {
    async fn raw_exists(&self, tx_hash: &str) -> Result<bool>;

    /// Insert the ledger row and the canonical row as one unit.
    async fn insert_pair(&self, raw: &RawSwapRecord, swap: &SwapRecord) -> Result<InsertOutcome>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub raw_swaps: i64,
    pub swaps: i64,
    pub total_amount_out: Decimal,
    pub total_value_usd: Decimal,
}

#[derive(FromRow)]
struct SwapRow {
    tx_hash: String,
    wallet: String,
    side: String,
    amount_in: Decimal,
    amount_out: Decimal,
    value_usd: Decimal,
    occurred_at: DateTime<Utc>,
}

impl SwapRow {
    fn into_record(self) -> Result<SwapRecord> {
        let side = Side::parse(&self.side)
            .with_context(|| format!("swap {} has unknown side {:?}", self.tx_hash, self.side))?;
        Ok(SwapRecord {
            tx_hash: self.tx_hash,
            wallet: self.wallet,
            side,
            amount_in: self.amount_in,
            amount_out: self.amount_out,
            value_usd: self.value_usd,
            occurred_at: self.occurred_at,
        })
    }
}

pub struct PgSwapStore {
    pool: PgPool,
}

impl PgSwapStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    /// Create the swap tables if they don't exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .context("applying swap schema")?;
        info!("swap schema ready");
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let raw_swaps: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_swaps")
            .fetch_one(&self.pool)
            .await?;

        let (swaps, total_amount_out, total_value_usd): (i64, Decimal, Decimal) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(amount_out), 0), COALESCE(SUM(value_usd), 0) FROM swaps",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            raw_swaps,
            swaps,
            total_amount_out,
            total_value_usd,
        })
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<SwapRecord>> {
        let rows: Vec<SwapRow> = sqlx::query_as(
            "SELECT tx_hash, wallet, side, amount_in, amount_out, value_usd, occurred_at
             FROM swaps ORDER BY occurred_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SwapRow::into_record).collect()
    }
}

#[async_trait]
impl SwapStore for PgSwapStore {
    async fn raw_exists(&self, tx_hash: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM raw_swaps WHERE tx_hash = $1)")
                .bind(tx_hash)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_pair(&self, raw: &RawSwapRecord, swap: &SwapRecord) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let res: PgQueryResult = sqlx::query(
            "INSERT INTO raw_swaps
                (tx_hash, wallet, side, amount_in, amount_out, value_usd, occurred_at, fetched_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tx_hash) DO NOTHING",
        )
        .bind(&raw.swap.tx_hash)
        .bind(&raw.swap.wallet)
        .bind(raw.swap.side.as_str())
        .bind(raw.swap.amount_in)
        .bind(raw.swap.amount_out)
        .bind(raw.swap.value_usd)
        .bind(raw.swap.occurred_at)
        .bind(raw.fetched_at)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(InsertOutcome::AlreadyPresent);
        }

        // a failure here drops `tx`, which rolls back the ledger row too
        sqlx::query(
            "INSERT INTO swaps
                (tx_hash, wallet, side, amount_in, amount_out, value_usd, occurred_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&swap.tx_hash)
        .bind(&swap.wallet)
        .bind(swap.side.as_str())
        .bind(swap.amount_in)
        .bind(swap.amount_out)
        .bind(swap.value_usd)
        .bind(swap.occurred_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(InsertOutcome::Inserted)
    }
}
