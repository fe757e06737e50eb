use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::{env, path::PathBuf, time::Duration};

#[derive(Parser, Debug, Clone)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// DEX pool account whose transactions are ingested (or CAPITALDEX_POOL_ADDRESS)
    #[arg(long)]
    pub pool_address: Option<String>,

    /// How many of the most recent transactions to fetch per run
    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// TonAPI base URL
    #[arg(long, default_value = "https://tonapi.io")]
    pub api_url: String,

    /// Reconcile from a recorded jsonl/json file instead of TonAPI
    #[arg(long)]
    pub from_file: Option<PathBuf>,

    /// Append every fetched transaction to this jsonl file
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// USD price of one TON, used when no live price is available
    #[arg(long, default_value = "5")]
    pub price_usd: Decimal,

    /// Look up the TON/USD rate on TonAPI each run
    #[arg(long)]
    pub live_price: bool,

    #[arg(long, default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub store_timeout_secs: u64,

    /// Keep running, one reconciliation every N seconds
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Number of recent swaps printed by `stats`
    #[arg(long, default_value_t = 10)]
    pub recent: i64,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reconcile the pool feed into the swap store (default)
    Sync,
    /// Print store counts, totals and the latest swaps
    Stats,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub api_url: String,
    pub api_key: Option<String>,
    pub pool_address: String,
    pub from_file: Option<PathBuf>,
    pub record: Option<PathBuf>,
    pub limit: usize,
    pub price_usd: Decimal,
    pub live_price: bool,
    pub fetch_timeout: Duration,
    pub store_timeout: Duration,
    pub interval: Option<Duration>,
    pub recent: i64,

    pub database_url: String,
    pub database_max_connections: u32,

    pub kafka_broker: Option<String>,
    pub kafka_swaps_topic: String,
    pub kafka_dlq_topic: String,
}

pub fn load(cli: &Cli) -> Result<Config> {
    let command = cli.command.clone().unwrap_or(Command::Sync);

    let api_key = env::var("TON_API_KEY").ok().filter(|s| !s.trim().is_empty());
    let pool_address = cli
        .pool_address
        .clone()
        .or_else(|| env::var("CAPITALDEX_POOL_ADDRESS").ok())
        .unwrap_or_default();

    let database_url = env::var("DATABASE_URL").map_err(|_| anyhow!("Missing DATABASE_URL"))?;
    let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    let kafka_broker = env::var("KAFKA_BROKER").ok().filter(|s| !s.trim().is_empty());
    let kafka_swaps_topic =
        env::var("KAFKA_SWAPS_TOPIC").unwrap_or_else(|_| "ton_swaps".to_string());
    let kafka_dlq_topic =
        env::var("KAFKA_DLQ_TOPIC").unwrap_or_else(|_| "ton_swaps_dlq".to_string());

    // Validate mode
    if command == Command::Sync && cli.from_file.is_none() {
        if pool_address.trim().is_empty() {
            return Err(anyhow!(
                "Missing pool address: pass --pool-address or set CAPITALDEX_POOL_ADDRESS"
            ));
        }
        if api_key.is_none() {
            return Err(anyhow!("Missing TON_API_KEY"));
        }
    }
    if cli.limit == 0 {
        return Err(anyhow!("--limit must be greater than 0"));
    }
    if cli.price_usd.is_sign_negative() {
        return Err(anyhow!("--price-usd must not be negative"));
    }

    Ok(Config {
        command,
        api_url: cli.api_url.trim_end_matches('/').to_string(),
        api_key,
        pool_address,
        from_file: cli.from_file.clone(),
        record: cli.record.clone(),
        limit: cli.limit,
        price_usd: cli.price_usd,
        live_price: cli.live_price,
        fetch_timeout: Duration::from_secs(cli.fetch_timeout_secs),
        store_timeout: Duration::from_secs(cli.store_timeout_secs),
        interval: cli.interval_secs.filter(|s| *s > 0).map(Duration::from_secs),
        recent: cli.recent,
        database_url,
        database_max_connections,
        kafka_broker,
        kafka_swaps_topic,
        kafka_dlq_topic,
    })
}
