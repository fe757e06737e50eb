use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use schema::RawTransaction;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::price::PriceSource;
use crate::source::TransactionSource;

const MAX_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct TonApiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    account: String,
}

impl TonApiClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        account: String,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
            account,
        })
    }

    fn transactions_url(&self) -> String {
        format!(
            "{}/v2/blockchain/accounts/{}/transactions",
            self.base_url, self.account
        )
    }

    /// GET with retry on 429/5xx and transport errors. Other statuses fail at once.
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let mut backoff = Duration::from_millis(250);

        for attempt in 1..=MAX_ATTEMPTS {
            let mut req = self.http.get(url).query(query);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(r) => {
                    let status = r.status();
                    if status.is_success() {
                        return r
                            .json::<Value>()
                            .await
                            .map_err(|e| anyhow!("tonapi decode error: {e:?}"));
                    }

                    let body = r.text().await.unwrap_or_default();
                    if is_retryable(status) && attempt < MAX_ATTEMPTS {
                        warn!(
                            "tonapi status={} attempt={} sleeping={:?}",
                            status, attempt, backoff
                        );
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(5));
                        continue;
                    }
                    return Err(anyhow!("tonapi http error status={status} body={body}"));
                }
                Err(e) => {
                    if attempt < MAX_ATTEMPTS {
                        warn!("tonapi request failed attempt={attempt}: {e}");
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(5));
                        continue;
                    }
                    return Err(anyhow!("tonapi request failed: {e:?}"));
                }
            }
        }

        Err(anyhow!("unreachable"))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Decode the `transactions` array of a TonAPI page.
///
/// Entries with a hash are always kept, even when the rest is malformed, so
/// the run can report them. Entries without a hash are dropped with a
/// warning: there is nothing to dedup on or to report against.
pub fn parse_page(page: &Value) -> Result<Vec<RawTransaction>> {
    let arr = match page.get("transactions") {
        Some(Value::Array(arr)) => arr,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => return Err(anyhow!("unexpected transactions field")),
    };

    let mut out = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        match RawTransaction::from_json_lenient(item) {
            Some(tx) => out.push(tx),
            None => warn!("skipping transaction without hash at index {i}"),
        }
    }
    Ok(out)
}

#[async_trait]
impl TransactionSource for TonApiClient {
    async fn fetch_page(&self, limit: usize) -> Result<Vec<RawTransaction>> {
        let url = self.transactions_url();
        let page = self.get_json(&url, &[("limit", limit.to_string())]).await?;
        let txs = parse_page(&page)?;
        debug!("tonapi returned {} transactions for {}", txs.len(), self.account);
        Ok(txs)
    }
}

#[async_trait]
impl PriceSource for TonApiClient {
    async fn base_usd_price(&self) -> Result<Decimal> {
        let url = format!("{}/v2/rates", self.base_url);
        let v = self
            .get_json(
                &url,
                &[("tokens", "ton".to_string()), ("currencies", "usd".to_string())],
            )
            .await?;
        parse_ton_usd(&v)
    }
}

fn parse_ton_usd(v: &Value) -> Result<Decimal> {
    let price = v
        .pointer("/rates/TON/prices/USD")
        .ok_or_else(|| anyhow!("rates response has no TON/USD price"))?;

    let p = match price {
        Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
        Value::String(s) => s.parse::<Decimal>().ok(),
        _ => None,
    }
    .ok_or_else(|| anyhow!("unparseable TON/USD price: {price}"))?;

    if p <= Decimal::ZERO {
        return Err(anyhow!("non-positive TON/USD price: {p}"));
    }
    Ok(p)
}
