//! Pool feed → swap store reconciliation.
//!
//! One run fetches the latest page of pool transactions and appends a
//! canonical swap (plus its ledger twin) for every hash not seen before.
//! Only a failed fetch aborts a run; anything wrong with a single
//! transaction is recorded in the report and the run moves on.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use schema::{
    IngestionReport, RawTransaction, Side, SwapRecord, TON_DECIMALS, TxOutcome, XAUH_DECIMALS,
    from_minor_units,
};
use std::time::Duration;
use tokio::time::timeout;

use crate::price::PriceSource;
use crate::sink::SwapSink;
use crate::source::TransactionSource;
use crate::store::{InsertOutcome, SwapStore};

pub const UNKNOWN_WALLET: &str = "unknown";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub limit: usize,
    pub fetch_timeout: Duration,
    pub store_timeout: Duration,
    /// Per-message bound on sink publishes
    pub publish_timeout: Duration,
    /// Inbound TON value below which a transaction is noise
    pub dust_threshold: Decimal,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            fetch_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            dust_threshold: Decimal::new(1, 2),
        }
    }
}

/// Result of interpreting one transaction, before touching the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    /// No inbound message or no outbound messages
    Invalid,
    Dust,
    Swap(SwapRecord),
}

/// Interpret a feed transaction as a swap.
///
/// Errors are reserved for data that is present but unusable (undecodable
/// entries, bad numbers, missing or impossible timestamps).
pub fn extract_swap(
    tx: &RawTransaction,
    price_usd: Decimal,
    dust_threshold: Decimal,
) -> Result<Extracted> {
    if let Some(m) = &tx.malformed {
        return Err(anyhow!("malformed transaction: {}", m.error));
    }

    let Some(in_msg) = tx.in_msg.as_ref() else {
        return Ok(Extracted::Invalid);
    };
    if tx.out_msgs.is_empty() {
        return Ok(Extracted::Invalid);
    }

    let amount_in = match in_msg.value.as_deref() {
        Some(v) => from_minor_units(v, TON_DECIMALS).context("inbound value")?,
        None => Decimal::ZERO,
    };
    if amount_in < dust_threshold {
        return Ok(Extracted::Dust);
    }

    let amount_out = match tx.first_transfer_amount() {
        Some(a) => from_minor_units(&a, XAUH_DECIMALS).context("jetton transfer amount")?,
        None => Decimal::ZERO,
    };

    let value_usd = amount_in
        .checked_mul(price_usd)
        .ok_or_else(|| anyhow!("usd value overflow ({amount_in} x {price_usd})"))?
        .normalize();

    let utime = tx.utime.ok_or_else(|| anyhow!("transaction has no utime"))?;
    let occurred_at = DateTime::<Utc>::from_timestamp(utime, 0)
        .ok_or_else(|| anyhow!("utime {utime} out of range"))?;

    let wallet = in_msg.source_address().unwrap_or(UNKNOWN_WALLET).to_string();

    // TON flowing into the pool buys the jetton
    Ok(Extracted::Swap(SwapRecord {
        tx_hash: tx.hash.clone(),
        wallet,
        side: Side::Buy,
        amount_in,
        amount_out,
        value_usd,
        occurred_at,
    }))
}

async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, fut).await {
        Ok(r) => r.with_context(|| what.to_string()),
        Err(_) => Err(anyhow!("{what} timed out after {limit:?}")),
    }
}

// Sink failures never fail the run
async fn publish(
    limit: Duration,
    what: &str,
    tx_hash: &str,
    fut: impl Future<Output = Result<()>>,
) {
    if let Err(e) = bounded(limit, what, fut).await {
        warn!("{what} failed tx={tx_hash}: {e:#}");
    }
}

async fn process_tx(
    tx: &RawTransaction,
    store: &dyn SwapStore,
    price_usd: Decimal,
    fetched_at: DateTime<Utc>,
    opts: &RunOptions,
) -> Result<(TxOutcome, Option<SwapRecord>)> {
    if bounded(opts.store_timeout, "dedup check", store.raw_exists(&tx.hash)).await? {
        return Ok((TxOutcome::SkipDuplicate, None));
    }

    let swap = match extract_swap(tx, price_usd, opts.dust_threshold)? {
        Extracted::Invalid => return Ok((TxOutcome::DropInvalid, None)),
        Extracted::Dust => return Ok((TxOutcome::DropDust, None)),
        Extracted::Swap(s) => s,
    };

    let raw = swap.to_raw(fetched_at);
    match bounded(opts.store_timeout, "insert", store.insert_pair(&raw, &swap)).await? {
        InsertOutcome::Inserted => Ok((TxOutcome::Ingested, Some(swap))),
        InsertOutcome::AlreadyPresent => Ok((TxOutcome::SkipDuplicate, None)),
    }
}

/// Run one reconciliation pass.
///
/// `Err` means the feed could not be read (or the price could not be
/// determined) and nothing was written.
pub async fn reconcile(
    feed: &dyn TransactionSource,
    store: &dyn SwapStore,
    price: &dyn PriceSource,
    sink: &dyn SwapSink,
    opts: &RunOptions,
) -> Result<IngestionReport> {
    let txs = bounded(
        opts.fetch_timeout,
        "fetching transactions",
        feed.fetch_page(opts.limit),
    )
    .await?;
    let price_usd =
        bounded(opts.fetch_timeout, "base asset price", price.base_usd_price()).await?;

    info!("reconciling {} transactions (ton_usd={})", txs.len(), price_usd);

    let fetched_at = Utc::now();
    let mut report = IngestionReport::with_total(txs.len());

    for tx in &txs {
        let outcome = match process_tx(tx, store, price_usd, fetched_at, opts).await {
            Ok((outcome, Some(swap))) => {
                info!(
                    "new swap {}: {} TON -> {} XAUH from {}",
                    swap.tx_hash, swap.amount_in, swap.amount_out, swap.wallet
                );
                let sent = sink.swap_ingested(&swap);
                publish(opts.publish_timeout, "swap publish", &tx.hash, sent).await;
                outcome
            }
            Ok((outcome, None)) => {
                debug!("tx {} -> {:?}", tx.hash, outcome);
                outcome
            }
            Err(e) => {
                warn!("tx {} failed: {e:#}", tx.hash);
                TxOutcome::Error(format!("{e:#}"))
            }
        };

        let failed = matches!(outcome, TxOutcome::Error(_));
        report.record(&tx.hash, outcome);
        if failed && let Some(err) = report.errors.last() {
            let sent = sink.record_failed(err);
            publish(opts.publish_timeout, "dlq publish", &tx.hash, sent).await;
        }
    }

    info!(
        "sync complete: new={} skipped={} invalid={} dust={} errors={} total={}",
        report.new_swaps,
        report.skipped,
        report.dropped_invalid,
        report.dropped_dust,
        report.errors.len(),
        report.total_processed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::FixedPrice;
    use crate::sink::NoopSink;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use schema::IngestionError;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    struct StaticFeed(Vec<RawTransaction>);

    #[async_trait]
    impl TransactionSource for StaticFeed {
        async fn fetch_page(&self, limit: usize) -> Result<Vec<RawTransaction>> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    struct DownFeed;

    #[async_trait]
    impl TransactionSource for DownFeed {
        async fn fetch_page(&self, _limit: usize) -> Result<Vec<RawTransaction>> {
            Err(anyhow!("tonapi http error status=401 Unauthorized"))
        }
    }

    struct SlowFeed;

    struct SlowPrice;

    #[async_trait]
    impl PriceSource for SlowPrice {
        async fn base_usd_price(&self) -> Result<Decimal> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(dec!(5))
        }
    }

    /// Broker that accepts the connection and never acknowledges.
    struct HangingSink;

    #[async_trait]
    impl SwapSink for HangingSink {
        async fn swap_ingested(&self, _swap: &SwapRecord) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn record_failed(&self, _error: &IngestionError) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[async_trait]
    impl TransactionSource for SlowFeed {
        async fn fetch_page(&self, _limit: usize) -> Result<Vec<RawTransaction>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CollectSink {
        swaps: Mutex<Vec<String>>,
        failed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SwapSink for CollectSink {
        async fn swap_ingested(&self, swap: &SwapRecord) -> Result<()> {
            self.swaps.lock().unwrap().push(swap.tx_hash.clone());
            Ok(())
        }

        async fn record_failed(&self, error: &IngestionError) -> Result<()> {
            self.failed.lock().unwrap().push(error.tx_hash.clone());
            Ok(())
        }
    }

    fn tx(v: Value) -> RawTransaction {
        RawTransaction::from_json(&v).unwrap()
    }

    /// A pool swap: `nanotons` in, one jetton transfer of `jetton_units` out.
    fn swap_tx(hash: &str, nanotons: &str, jetton_units: &str) -> RawTransaction {
        tx(json!({
            "hash": hash,
            "utime": 1731000000,
            "in_msg": {
                "value": nanotons,
                "source": { "address": "0:wallet" }
            },
            "out_msgs": [
                {
                    "value": "50000000",
                    "decoded_op_name": "jetton_transfer",
                    "decoded_body": { "amount": jetton_units }
                }
            ]
        }))
    }

    fn opts() -> RunOptions {
        RunOptions::default()
    }

    async fn run(feed: &dyn TransactionSource, store: &MemoryStore) -> Result<IngestionReport> {
        reconcile(feed, store, &FixedPrice(dec!(5)), &NoopSink, &opts()).await
    }

    #[tokio::test]
    async fn test_end_to_end_single_swap() {
        let feed = StaticFeed(vec![swap_tx("0xabc", "5000000000", "2000000000000000000")]);
        let store = MemoryStore::default();

        let report = run(&feed, &store).await.unwrap();
        assert_eq!(report.new_swaps, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.total_processed, 1);
        assert!(report.errors.is_empty());

        let swap = store.swap("0xabc").unwrap();
        assert_eq!(swap.amount_in, dec!(5));
        assert_eq!(swap.amount_out, dec!(2));
        assert_eq!(swap.value_usd, dec!(25));
        assert_eq!(swap.wallet, "0:wallet");
        assert_eq!(swap.side, Side::Buy);
        assert_eq!(swap.occurred_at.timestamp(), 1731000000);

        let raw = store.raw.lock().unwrap().get("0xabc").cloned().unwrap();
        assert_eq!(raw.swap, swap);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let feed = StaticFeed(vec![
            swap_tx("h1", "5000000000", "1"),
            swap_tx("h2", "7000000000", "1"),
        ]);
        let store = MemoryStore::default();

        let first = run(&feed, &store).await.unwrap();
        assert_eq!(first.new_swaps, 2);

        let second = run(&feed, &store).await.unwrap();
        assert_eq!(second.new_swaps, 0);
        assert_eq!(second.skipped, second.total_processed);
        assert_eq!(store.swap_count(), 2);
        assert_eq!(store.raw_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_hash_within_page() {
        let feed = StaticFeed(vec![
            swap_tx("same", "5000000000", "1"),
            swap_tx("same", "5000000000", "1"),
        ]);
        let store = MemoryStore::default();

        let report = run(&feed, &store).await.unwrap();
        assert_eq!(report.new_swaps, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.swap_count(), 1);
    }

    #[tokio::test]
    async fn test_dust_is_dropped_silently() {
        // 0.001 TON, threshold is 0.01
        let feed = StaticFeed(vec![swap_tx("dust", "1000000", "1")]);
        let store = MemoryStore::default();

        let report = run(&feed, &store).await.unwrap();
        assert_eq!(report.new_swaps, 0);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.dropped_dust, 1);
        assert!(report.errors.is_empty());
        assert_eq!(store.swap_count(), 0);
    }

    #[tokio::test]
    async fn test_threshold_value_is_not_dust() {
        let feed = StaticFeed(vec![swap_tx("edge", "10000000", "1")]);
        let store = MemoryStore::default();

        let report = run(&feed, &store).await.unwrap();
        assert_eq!(report.new_swaps, 1);
    }

    #[tokio::test]
    async fn test_no_transfer_records_zero_out() {
        let feed = StaticFeed(vec![tx(json!({
            "hash": "partial",
            "utime": 1731000000,
            "in_msg": { "value": "3000000000", "source": { "address": "0:w" } },
            "out_msgs": [
                { "value": "100", "decoded_op_name": "excess" },
                { "value": "200", "decoded_op_name": "jetton_transfer", "decoded_body": {} }
            ]
        }))]);
        let store = MemoryStore::default();

        let report = run(&feed, &store).await.unwrap();
        assert_eq!(report.new_swaps, 1);
        let swap = store.swap("partial").unwrap();
        assert_eq!(swap.amount_out, Decimal::ZERO);
        assert_eq!(swap.amount_in, dec!(3));
    }

    #[tokio::test]
    async fn test_structurally_incomplete_dropped() {
        let feed = StaticFeed(vec![
            tx(json!({ "hash": "no_in", "utime": 1, "out_msgs": [ { "value": "1" } ] })),
            tx(json!({
                "hash": "no_out",
                "utime": 1,
                "in_msg": { "value": "5000000000" },
                "out_msgs": []
            })),
        ]);
        let store = MemoryStore::default();

        let report = run(&feed, &store).await.unwrap();
        assert_eq!(report.new_swaps, 0);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.dropped_invalid, 2);
        assert!(report.errors.is_empty());
        assert_eq!(store.raw_count(), 0);
    }

    #[tokio::test]
    async fn test_persistence_error_is_isolated() {
        let feed = StaticFeed(vec![
            swap_tx("t1", "5000000000", "1"),
            swap_tx("t2", "5000000000", "1"),
            swap_tx("t3", "5000000000", "1"),
        ]);
        let store = MemoryStore::failing(&["t2"]);
        let sink = CollectSink::default();

        let report = reconcile(&feed, &store, &FixedPrice(dec!(5)), &sink, &opts())
            .await
            .unwrap();
        assert_eq!(report.new_swaps, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].tx_hash, "t2");
        assert!(report.errors[0].message.contains("unique constraint"));
        assert!(store.swap("t3").is_some());

        assert_eq!(*sink.swaps.lock().unwrap(), vec!["t1", "t3"]);
        assert_eq!(*sink.failed.lock().unwrap(), vec!["t2"]);
    }

    #[tokio::test]
    async fn test_bad_numbers_are_record_errors() {
        let feed = StaticFeed(vec![
            swap_tx("bad_in", "12abc", "1"),
            swap_tx("bad_out", "5000000000", "1e18"),
            swap_tx("huge_out", "5000000000", &"9".repeat(40)),
            swap_tx("ok", "5000000000", "1"),
        ]);
        let store = MemoryStore::default();

        let report = run(&feed, &store).await.unwrap();
        let failed: Vec<_> = report.errors.iter().map(|e| e.tx_hash.as_str()).collect();
        assert_eq!(failed, vec!["bad_in", "bad_out", "huge_out"]);
        assert_eq!(report.new_swaps, 1);
        assert_eq!(store.swap_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_utime_is_record_error() {
        let feed = StaticFeed(vec![tx(json!({
            "hash": "no_time",
            "in_msg": { "value": "5000000000" },
            "out_msgs": [ { "value": "1" } ]
        }))]);
        let store = MemoryStore::default();

        let report = run(&feed, &store).await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("utime"));
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let feed = StaticFeed(vec![tx(json!({
            "hash": "anon",
            "utime": 1731000000,
            "in_msg": { "value": "5000000000", "source": null },
            "out_msgs": [ { "value": "1" } ]
        }))]);
        let store = MemoryStore::default();

        run(&feed, &store).await.unwrap();
        assert_eq!(store.swap("anon").unwrap().wallet, UNKNOWN_WALLET);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_fatal() {
        let store = MemoryStore::default();
        let err = run(&DownFeed, &store).await.unwrap_err();
        assert!(format!("{err:#}").contains("401"));
        assert_eq!(*store.exists_calls.lock().unwrap(), 0);
        assert_eq!(store.raw_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_fatal() {
        let store = MemoryStore::default();
        let o = RunOptions {
            fetch_timeout: Duration::from_millis(20),
            ..opts()
        };
        let err = reconcile(&SlowFeed, &store, &FixedPrice(dec!(5)), &NoopSink, &o)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_price_timeout_is_fatal() {
        let feed = StaticFeed(vec![swap_tx("p1", "5000000000", "1")]);
        let store = MemoryStore::default();
        let o = RunOptions {
            fetch_timeout: Duration::from_millis(20),
            ..opts()
        };
        let err = reconcile(&feed, &store, &SlowPrice, &NoopSink, &o)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("base asset price timed out"));
        assert_eq!(*store.exists_calls.lock().unwrap(), 0);
        assert_eq!(store.raw_count(), 0);
    }

    #[tokio::test]
    async fn test_hanging_sink_does_not_stall_run() {
        let feed = StaticFeed(vec![
            swap_tx("s1", "5000000000", "1"),
            swap_tx("s2", "oops", "1"),
            swap_tx("s3", "5000000000", "1"),
        ]);
        let store = MemoryStore::default();
        let o = RunOptions {
            publish_timeout: Duration::from_millis(20),
            ..opts()
        };

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            reconcile(&feed, &store, &FixedPrice(dec!(5)), &HangingSink, &o),
        )
        .await
        .expect("run stalled on the sink")
        .unwrap();
        assert_eq!(report.new_swaps, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].tx_hash, "s2");
        assert_eq!(store.swap_count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_record_error() {
        let page = json!({
            "transactions": [
                { "hash": "0xbad", "utime": "1731000000" },
                {
                    "hash": "0xok",
                    "utime": 1731000000,
                    "in_msg": { "value": "5000000000", "source": { "address": "0:w" } },
                    "out_msgs": [ { "value": "1" } ]
                }
            ]
        });
        let feed = StaticFeed(crate::tonapi::parse_page(&page).unwrap());
        let store = MemoryStore::default();
        let sink = CollectSink::default();

        let report = reconcile(&feed, &store, &FixedPrice(dec!(5)), &sink, &opts())
            .await
            .unwrap();
        assert_eq!(report.total_processed, 2);
        assert_eq!(report.new_swaps, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].tx_hash, "0xbad");
        assert!(report.errors[0].message.contains("malformed transaction"));
        assert!(store.swap("0xbad").is_none());
        assert_eq!(*sink.failed.lock().unwrap(), vec!["0xbad"]);
    }

    #[tokio::test]
    async fn test_lost_insert_race_counts_as_skipped() {
        let feed = StaticFeed(vec![swap_tx("raced", "5000000000", "1")]);
        let mut store = MemoryStore::default();
        store.racing.insert("raced".to_string());

        // another run already wrote the ledger row
        let earlier = extract_swap(&feed.0[0], dec!(5), opts().dust_threshold).unwrap();
        let Extracted::Swap(s) = earlier else {
            panic!("expected a swap");
        };
        store.insert_pair(&s.to_raw(Utc::now()), &s).await.unwrap();

        let report = run(&feed, &store).await.unwrap();
        assert_eq!(report.new_swaps, 0);
        assert_eq!(report.skipped, 1);
        assert!(report.errors.is_empty());
        assert_eq!(store.swap_count(), 1);
    }

    #[tokio::test]
    async fn test_limit_bounds_page() {
        let feed = StaticFeed(vec![
            swap_tx("a", "5000000000", "1"),
            swap_tx("b", "5000000000", "1"),
            swap_tx("c", "5000000000", "1"),
        ]);
        let store = MemoryStore::default();
        let o = RunOptions { limit: 2, ..opts() };

        let report = reconcile(&feed, &store, &FixedPrice(dec!(5)), &NoopSink, &o)
            .await
            .unwrap();
        assert_eq!(report.total_processed, 2);
        assert!(store.swap("c").is_none());
    }

    #[test]
    fn test_extract_uses_injected_price() {
        let t = swap_tx("p", "2500000000", "1");
        let Extracted::Swap(s) = extract_swap(&t, dec!(3.2), dec!(0.01)).unwrap() else {
            panic!("expected a swap");
        };
        assert_eq!(s.value_usd, dec!(8));
    }
}
