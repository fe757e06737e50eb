use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{info, warn};
use schema::RawTransaction;
use serde_json::Value;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::tonapi::parse_page;

/// Paged, read-only feed of pool transactions, most recent first.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn fetch_page(&self, limit: usize) -> Result<Vec<RawTransaction>>;
}

/// Replays transactions recorded earlier, either as jsonl (one transaction
/// per line) or as a full TonAPI page document.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl TransactionSource for FileSource {
    async fn fetch_page(&self, limit: usize) -> Result<Vec<RawTransaction>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;

        let mut txs = parse_recorded(&content)?;
        txs.truncate(limit);
        info!("replay from {}: {} transactions", self.path.display(), txs.len());
        Ok(txs)
    }
}

fn parse_recorded(content: &str) -> Result<Vec<RawTransaction>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{')
        && let Ok(doc) = serde_json::from_str::<Value>(trimmed)
        && doc.get("transactions").is_some()
    {
        return parse_page(&doc);
    }

    let mut out = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let v: Value = serde_json::from_str(line)
            .map_err(|e| anyhow!("line {}: invalid json: {e}", n + 1))?;
        match RawTransaction::from_json_lenient(&v) {
            Some(tx) => out.push(tx),
            None => warn!("line {}: skipping transaction without hash", n + 1),
        }
    }
    Ok(out)
}

/// Append fetched transactions to a jsonl file so a run can be replayed.
pub fn record_jsonl(path: &Path, txs: &[RawTransaction]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;

    for tx in txs {
        let line = serde_json::to_string(&tx.to_json()?)?;
        writeln!(f, "{line}")?;
    }
    Ok(())
}

/// Wraps a source and records every page it returns.
pub struct RecordingSource<S> {
    inner: S,
    path: PathBuf,
}

impl<S> RecordingSource<S> {
    pub fn new(inner: S, path: PathBuf) -> Self {
        Self { inner, path }
    }
}

#[async_trait]
impl<S: TransactionSource> TransactionSource for RecordingSource<S> {
    async fn fetch_page(&self, limit: usize) -> Result<Vec<RawTransaction>> {
        let txs = self.inner.fetch_page(limit).await?;
        // the page is still good even if the recording isn't
        if let Err(e) = record_jsonl(&self.path, &txs) {
            warn!("recording to {} failed: {e:?}", self.path.display());
        }
        Ok(txs)
    }
}
