//! Per-run ingestion report.

use serde::Serialize;
use serde_json::{Value, json};

/// What happened to one transaction of the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    SkipDuplicate,
    DropInvalid,
    DropDust,
    Ingested,
    /// Record-level failure; the run carries on
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionError {
    pub tx_hash: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionReport {
    pub new_swaps: usize,
    #[serde(rename = "skippedSwaps")]
    pub skipped: usize,
    pub total_processed: usize,
    pub dropped_invalid: usize,
    pub dropped_dust: usize,
    pub errors: Vec<IngestionError>,
}

#[derive(Serialize)]
struct Summary<'a> {
    success: bool,
    #[serde(flatten)]
    report: &'a IngestionReport,
}

impl IngestionReport {
    pub fn with_total(total_processed: usize) -> Self {
        Self {
            total_processed,
            ..Self::default()
        }
    }

    /// Account for one transaction of the page.
    pub fn record(&mut self, tx_hash: &str, outcome: TxOutcome) {
        match outcome {
            TxOutcome::SkipDuplicate => self.skipped += 1,
            TxOutcome::DropInvalid => self.dropped_invalid += 1,
            TxOutcome::DropDust => self.dropped_dust += 1,
            TxOutcome::Ingested => self.new_swaps += 1,
            TxOutcome::Error(message) => self.errors.push(IngestionError {
                tx_hash: tx_hash.to_string(),
                message,
            }),
        }
    }

    /// JSON summary for the monitoring caller.
    pub fn summary_json(&self) -> Value {
        serde_json::to_value(Summary {
            success: true,
            report: self,
        })
        .unwrap_or_else(|e| failure_json(&format!("report serialization failed: {e}")))
    }
}

/// Summary for a run that failed before any transaction was processed.
pub fn failure_json(error: &str) -> Value {
    json!({ "success": false, "error": error })
}
