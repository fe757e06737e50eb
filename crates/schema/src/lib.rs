pub mod report;
pub mod swap;
pub mod ton_tx;
pub mod units;

pub use report::{failure_json, IngestionError, IngestionReport, TxOutcome};
pub use swap::{RawSwapRecord, Side, SwapRecord};
pub use ton_tx::{AccountRef, Malformed, Message, MessageOp, RawTransaction};
pub use units::{from_minor_units, AmountError, TON_DECIMALS, XAUH_DECIMALS};
