use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Canonical swap, one per completed exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub tx_hash: String,
    pub wallet: String,
    pub side: Side,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub value_usd: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Ingestion ledger twin of a [`SwapRecord`]; its existence marks a hash as seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSwapRecord {
    #[serde(flatten)]
    pub swap: SwapRecord,
    pub fetched_at: DateTime<Utc>,
}

impl SwapRecord {
    pub fn to_raw(&self, fetched_at: DateTime<Utc>) -> RawSwapRecord {
        RawSwapRecord {
            swap: self.clone(),
            fetched_at,
        }
    }
}
