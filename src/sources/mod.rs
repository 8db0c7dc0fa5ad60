//! Producers of bids. Each source normalizes what it receives into `CommonBid`s and sends them
//! over its own channel to the collector.
pub mod data_api;
pub mod get_header;
pub mod ultrasound_stream;

use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bids::CommonBid;

pub use data_api::DataApiPoller;
pub use get_header::{ExpectedOutcome, GetHeaderPoller, KnownErrors};
pub use ultrasound_stream::{DecodeError, TopBidUpdate, UltrasoundStreamClient};

pub type BidBatch = Vec<CommonBid>;
pub type BidSender = mpsc::Sender<BidBatch>;
pub type BidReceiver = mpsc::Receiver<BidBatch>;

pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(5);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(120);

/// Doubles from 5s up to 120s and never gives up.
pub fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: RECONNECT_INITIAL_DELAY,
        initial_interval: RECONNECT_INITIAL_DELAY,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: RECONNECT_MAX_DELAY,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Sleeps until the given unix millisecond timestamp. Returns false when cancelled first.
pub async fn sleep_until_ms(timestamp_ms: i64, cancel: &CancellationToken) -> bool {
    let wait_ms = timestamp_ms.saturating_sub(now_ms()).max(0) as u64;
    sleep_or_cancel(Duration::from_millis(wait_ms), cancel).await
}

/// Returns false when cancelled before the duration passed.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
