//! The common bid schema every source normalizes into, and the machinery that deduplicates bids
//! and writes them out.
mod processor;
mod sink;

use std::{fmt::Display, str::FromStr};

use alloy_primitives::U256;
use anyhow::anyhow;

use crate::beacon_chain::Slot;

pub use processor::BidProcessor;
pub use processor::BidProcessorStats;
pub use sink::BidSink;
pub use sink::OutputKind;
pub use sink::RotatingFileSink;
pub use sink::RotatingFileSinkConfig;

#[cfg(test)]
pub use processor::tests::RecordingSink;

/// Column names of every exported bid row. Downstream consumers parse rows positionally, never
/// reorder these.
pub const COMMON_BID_CSV_FIELDS: [&str; 15] = [
    "source_type",
    "received_at_ms",
    "timestamp_ms",
    "slot",
    "slot_t_ms",
    "value",
    "block_hash",
    "parent_hash",
    "builder_pubkey",
    "block_number",
    "block_fee_recipient",
    "relay",
    "proposer_pubkey",
    "proposer_fee_recipient",
    "optimistic_submission",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceType {
    GetHeader,
    DataApi,
    UltrasoundStream,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::GetHeader,
        SourceType::DataApi,
        SourceType::UltrasoundStream,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::GetHeader => "get-header",
            SourceType::DataApi => "data-api",
            SourceType::UltrasoundStream => "ultrasound-stream",
        }
    }
}

impl Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .into_iter()
            .find(|source_type| source_type.as_str() == s.trim())
            .ok_or_else(|| anyhow!("unknown bid source: {s}"))
    }
}

/// A bid normalized from any of the sources. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommonBid {
    pub source_type: SourceType,
    /// When this process received the bid.
    pub received_at_ms: i64,
    /// When the source says the bid arrived, not every source reports this.
    pub timestamp_ms: Option<i64>,
    pub slot: Slot,
    pub value: U256,
    pub block_hash: String,
    pub parent_hash: String,
    pub builder_pubkey: String,
    pub block_number: u64,
    pub block_fee_recipient: String,
    pub relay: String,
    pub proposer_pubkey: String,
    pub proposer_fee_recipient: String,
    /// Only the data API reports this.
    pub optimistic_submission: Option<bool>,
}

impl CommonBid {
    /// Milliseconds between the start of the slot and the source reported bid timestamp. Negative
    /// for bids submitted before the slot started.
    pub fn slot_t_ms(&self) -> Option<i64> {
        let slot_start_ms = self.slot.checked_timestamp_ms()?;
        self.timestamp_ms?.checked_sub(slot_start_ms)
    }

    /// Identifies the same bid seen through different relays, sources or poll attempts.
    pub fn unique_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.slot, self.block_hash, self.parent_hash, self.builder_pubkey, self.value
        )
    }

    /// Row in `COMMON_BID_CSV_FIELDS` order, missing values are empty cells.
    pub fn to_csv_record(&self) -> [String; 15] {
        fn opt_to_string<T: ToString>(value: Option<T>) -> String {
            value.map(|value| value.to_string()).unwrap_or_default()
        }

        [
            self.source_type.to_string(),
            self.received_at_ms.to_string(),
            opt_to_string(self.timestamp_ms),
            self.slot.to_string(),
            opt_to_string(self.slot_t_ms()),
            self.value.to_string(),
            self.block_hash.clone(),
            self.parent_hash.clone(),
            self.builder_pubkey.clone(),
            self.block_number.to_string(),
            self.block_fee_recipient.clone(),
            self.relay.clone(),
            self.proposer_pubkey.clone(),
            self.proposer_fee_recipient.clone(),
            opt_to_string(self.optimistic_submission),
        ]
    }
}

/// Relays differ in the casing of hex strings, dedup needs one.
pub fn normalize_hex(hex: &str) -> String {
    hex.trim().to_lowercase()
}
