//! Wire model for TonAPI account transactions.
//!
//! The feed is loosely typed: values arrive as strings or numbers, decoded
//! bodies have drifted between shapes over time, and any field except `hash`
//! may be absent. Everything here deserializes leniently so a single odd
//! transaction never poisons a whole page; interpretation happens later.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Account reference as TonAPI returns it (`{"address": "0:..", ...}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountRef {
    #[serde(default)]
    pub address: Option<String>,
}

/// Inbound or outbound message of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub source: Option<AccountRef>,

    #[serde(default)]
    pub destination: Option<AccountRef>,

    /// Attached value in minor units (nanotons), normalized to a digit string
    #[serde(default, deserialize_with = "de_opt_units")]
    pub value: Option<String>,

    #[serde(default)]
    pub decoded_op_name: Option<String>,

    #[serde(default)]
    pub decoded_body: Option<Value>,
}

/// One transaction of the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: String,

    /// On-chain time, Unix seconds
    #[serde(default)]
    pub utime: Option<i64>,

    #[serde(default)]
    pub in_msg: Option<Message>,

    #[serde(default, deserialize_with = "de_null_vec")]
    pub out_msgs: Vec<Message>,

    /// Set when the entry carried a hash but the rest didn't decode
    #[serde(skip)]
    pub malformed: Option<Malformed>,
}

/// Decode failure of a feed entry, with the entry as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Malformed {
    pub error: String,
    pub raw: Value,
}

/// Decoded operation carried by a message.
///
/// Both historical payload shapes map onto this enum:
/// `decoded_op_name = "jetton_transfer"` with `decoded_body.amount`, and
/// `decoded_body.sum_type = "JettonTransfer"` with `decoded_body.value.amount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOp {
    JettonTransfer { amount: Option<String> },
    JettonNotify { amount: Option<String> },
    Excess,
    Unrecognized { name: Option<String> },
}

impl MessageOp {
    /// Amount of a jetton transfer, if this is one and it carries an amount.
    pub fn transfer_amount(&self) -> Option<&str> {
        match self {
            MessageOp::JettonTransfer { amount: Some(a) } => Some(a.as_str()),
            _ => None,
        }
    }
}

impl Message {
    /// Normalize the decoded payload into a [`MessageOp`].
    pub fn op(&self) -> MessageOp {
        let body = self.decoded_body.as_ref();

        let name = self
            .decoded_op_name
            .as_deref()
            .or_else(|| body.and_then(|b| b.get("sum_type")).and_then(Value::as_str));

        let amount = || {
            body.and_then(|b| b.get("amount").or_else(|| b.pointer("/value/amount")))
                .and_then(units_string)
        };

        match name.map(op_key).as_deref() {
            Some("jettontransfer") => MessageOp::JettonTransfer { amount: amount() },
            Some("jettonnotify") => MessageOp::JettonNotify { amount: amount() },
            Some("excess") | Some("excesses") => MessageOp::Excess,
            _ => MessageOp::Unrecognized {
                name: name.map(str::to_string),
            },
        }
    }

    pub fn source_address(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|a| a.address.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}

impl RawTransaction {
    pub fn from_json(v: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(v)
    }

    /// Decode a feed entry, keeping any entry that has a string `hash`.
    ///
    /// A hashed entry that fails to decode comes back with `malformed` set
    /// so it can still be reported against its hash. Hashless entries are
    /// `None`.
    pub fn from_json_lenient(v: &Value) -> Option<Self> {
        match Self::from_json(v) {
            Ok(tx) => Some(tx),
            Err(e) => {
                let hash = v.get("hash").and_then(Value::as_str)?;
                Some(Self {
                    hash: hash.to_string(),
                    utime: None,
                    in_msg: None,
                    out_msgs: Vec::new(),
                    malformed: Some(Malformed {
                        error: e.to_string(),
                        raw: v.clone(),
                    }),
                })
            }
        }
    }

    /// JSON form for recording; malformed entries keep their original shape.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match &self.malformed {
            Some(m) => Ok(m.raw.clone()),
            None => serde_json::to_value(self),
        }
    }

    /// First outbound jetton transfer amount, scanning in message order.
    pub fn first_transfer_amount(&self) -> Option<String> {
        self.out_msgs
            .iter()
            .map(Message::op)
            .find_map(|op| op.transfer_amount().map(str::to_string))
    }
}

// "jetton_transfer", "JettonTransfer" and "jetton-transfer" all become "jettontransfer"
fn op_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Render a JSON string or number as a units string; anything else is absent.
pub fn units_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_opt_units<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref().and_then(units_string))
}

fn de_null_vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
}
