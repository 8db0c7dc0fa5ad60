//! Polls the bid trace endpoint of every relay a few times around each slot start. Relays keep
//! accepting bids until shortly after the slot starts, polling at fixed offsets samples that
//! window without querying continuously.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    beacon_chain::Slot,
    bids::{normalize_hex, CommonBid, SourceType},
    relays::{BidTrace, RelayApi},
};

use super::{now_ms, sleep_until_ms, BidSender};

/// Offsets relative to the start of the slot being polled.
pub const POLL_OFFSETS_MS: [i64; 5] = [-4000, -2000, -500, 500, 2000];

impl CommonBid {
    pub fn from_data_api(trace: BidTrace, relay: &str, received_at_ms: i64) -> Self {
        let timestamp_ms = trace.received_timestamp_ms();

        Self {
            source_type: SourceType::DataApi,
            received_at_ms,
            timestamp_ms,
            slot: trace.slot,
            value: trace.value,
            block_hash: normalize_hex(&trace.block_hash),
            parent_hash: normalize_hex(&trace.parent_hash),
            builder_pubkey: normalize_hex(&trace.builder_pubkey),
            block_number: trace.block_number,
            block_fee_recipient: String::new(),
            relay: relay.to_string(),
            proposer_pubkey: normalize_hex(&trace.proposer_pubkey),
            proposer_fee_recipient: normalize_hex(&trace.proposer_fee_recipient),
            optimistic_submission: Some(trace.optimistic_submission),
        }
    }
}

/// When to poll for the given slot at the given offset, or None when that moment already passed.
/// Late polls would misrepresent when bids were available, they are skipped instead.
pub fn poll_time_ms(slot: Slot, offset_ms: i64, now_ms: i64) -> Option<i64> {
    let fire_ms = slot.timestamp_ms() + offset_ms;
    if fire_ms < now_ms {
        None
    } else {
        Some(fire_ms)
    }
}

pub struct DataApiPoller {
    relays: Vec<Arc<dyn RelayApi>>,
    tx: BidSender,
}

impl DataApiPoller {
    pub fn new(relays: Vec<Arc<dyn RelayApi>>, tx: BidSender) -> Self {
        Self { relays, tx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(relays = self.relays.len(), "starting data api poller");

        // Start on a slot boundary so every offset of the first polled slot lies ahead.
        let first_slot = Slot::now() + 1;
        if !sleep_until_ms(first_slot.timestamp_ms(), &cancel).await {
            return;
        }

        loop {
            let next_slot = Slot::now() + 1;

            for offset_ms in POLL_OFFSETS_MS {
                let fire_ms = match poll_time_ms(next_slot, offset_ms, now_ms()) {
                    Some(fire_ms) => fire_ms,
                    None => {
                        warn!(slot = %next_slot, offset_ms, "poll time already passed, skipping");
                        continue;
                    }
                };

                if !sleep_until_ms(fire_ms, &cancel).await {
                    debug!("data api poller stopped");
                    return;
                }

                self.poll_relays(next_slot, offset_ms);
            }
        }
    }

    /// One task per relay so a slow relay never holds up the others.
    fn poll_relays(&self, slot: Slot, offset_ms: i64) {
        debug!(%slot, offset_ms, "polling relays for bid traces");

        for relay_api in &self.relays {
            tokio::spawn(poll_relay(
                relay_api.clone(),
                slot,
                offset_ms,
                self.tx.clone(),
            ));
        }
    }
}

pub async fn poll_relay(relay_api: Arc<dyn RelayApi>, slot: Slot, offset_ms: i64, tx: BidSender) {
    let relay = relay_api.relay().hostname().to_string();

    let traces = match relay_api.fetch_builder_bids(slot).await {
        Ok(traces) => traces,
        Err(err) => {
            warn!(%relay, %slot, offset_ms, ?err, "failed to fetch bid traces");
            return;
        }
    };

    let received_at_ms = now_ms();
    let bids: Vec<CommonBid> = traces
        .into_iter()
        .map(|trace| CommonBid::from_data_api(trace, &relay, received_at_ms))
        .collect();

    debug!(%relay, %slot, offset_ms, count = bids.len(), "fetched bid traces");

    if bids.is_empty() {
        return;
    }

    if tx.send(bids).await.is_err() {
        debug!(%relay, "bid channel closed, dropping bid traces");
    }
}
