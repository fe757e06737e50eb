use anyhow::Result;
use clap::Parser;
use log::{error, info};
use serde_json::json;

mod config;
mod price;
mod reconcile;
mod sink;
mod source;
mod store;
mod tonapi;

use config::{Command, Config};
use price::{FallbackPrice, FixedPrice, PriceSource};
use reconcile::{RunOptions, reconcile};
use sink::{KafkaSink, NoopSink, SwapSink};
use source::{FileSource, RecordingSource, TransactionSource};
use store::{PgSwapStore, SwapStore};
use tonapi::TonApiClient;

fn setup_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = config::Cli::parse();
    let cfg = config::load(&cli)?;

    let store = PgSwapStore::connect(&cfg.database_url, cfg.database_max_connections).await?;
    store.migrate().await?;

    let result = match cfg.command {
        Command::Sync => run_sync(&cfg, &store).await,
        Command::Stats => print_stats(&store, cfg.recent).await,
    };

    store.close().await;
    result
}

async fn run_sync(cfg: &Config, store: &PgSwapStore) -> Result<()> {
    let tonapi = TonApiClient::new(
        cfg.api_url.clone(),
        cfg.api_key.clone(),
        cfg.pool_address.clone(),
        cfg.fetch_timeout,
    )?;

    info!(
        "mode: {}",
        if cfg.from_file.is_some() {
            "replay"
        } else {
            "tonapi"
        }
    );

    let feed: Box<dyn TransactionSource> = match (&cfg.from_file, &cfg.record) {
        (Some(path), _) => {
            info!("replaying from {}", path.display());
            Box::new(FileSource::new(path.clone()))
        }
        (None, Some(rec)) => {
            info!("pool={} recording to {}", cfg.pool_address, rec.display());
            Box::new(RecordingSource::new(tonapi.clone(), rec.clone()))
        }
        (None, None) => {
            info!("pool={}", cfg.pool_address);
            Box::new(tonapi.clone())
        }
    };

    let price: Box<dyn PriceSource> = if cfg.live_price {
        Box::new(FallbackPrice::new(tonapi, cfg.price_usd))
    } else {
        Box::new(FixedPrice(cfg.price_usd))
    };

    let sink: Box<dyn SwapSink> = match &cfg.kafka_broker {
        Some(broker) => {
            info!(
                "publishing swaps to {} (dlq {}) via {}",
                cfg.kafka_swaps_topic, cfg.kafka_dlq_topic, broker
            );
            Box::new(KafkaSink::new(
                sink::create_producer(broker)?,
                cfg.kafka_swaps_topic.clone(),
                cfg.kafka_dlq_topic.clone(),
            ))
        }
        None => Box::new(NoopSink),
    };

    let opts = RunOptions {
        limit: cfg.limit,
        fetch_timeout: cfg.fetch_timeout,
        store_timeout: cfg.store_timeout,
        ..RunOptions::default()
    };

    let Some(interval) = cfg.interval else {
        return run_once(feed.as_ref(), store, price.as_ref(), sink.as_ref(), &opts).await;
    };

    info!("polling every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                // a failed run is already logged and reported; keep polling
                let _ = run_once(feed.as_ref(), store, price.as_ref(), sink.as_ref(), &opts).await;
            }
        }
    }
    Ok(())
}

async fn run_once(
    feed: &dyn TransactionSource,
    store: &dyn SwapStore,
    price: &dyn PriceSource,
    sink: &dyn SwapSink,
    opts: &RunOptions,
) -> Result<()> {
    match reconcile(feed, store, price, sink, opts).await {
        Ok(report) => {
            println!("{}", report.summary_json());
            Ok(())
        }
        Err(e) => {
            error!("sync failed: {e:#}");
            println!("{}", schema::failure_json(&format!("{e:#}")));
            Err(e)
        }
    }
}

async fn print_stats(store: &PgSwapStore, recent: i64) -> Result<()> {
    let stats = store.stats().await?;
    let swaps = store.recent(recent).await?;

    info!(
        "raw_swaps={} swaps={} total_xauh={} total_usd={}",
        stats.raw_swaps, stats.swaps, stats.total_amount_out, stats.total_value_usd
    );
    if stats.raw_swaps != stats.swaps {
        error!(
            "ledger/canonical mismatch: raw_swaps={} swaps={}",
            stats.raw_swaps, stats.swaps
        );
    }

    let out = json!({ "stats": stats, "recent": swaps });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
