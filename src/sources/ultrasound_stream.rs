//! Follows the ultrasound relay top bid websocket. Every binary message is one fixed size
//! `TopBidUpdate`.

use alloy_primitives::{hex, Address, FixedBytes, B256, U256};
use anyhow::Result;
use async_tungstenite::{
    tokio::connect_async,
    tungstenite::{self, Message},
};
use backoff::backoff::Backoff;
use futures::{pin_mut, Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    beacon_chain::Slot,
    bids::{CommonBid, SourceType},
};

use super::{now_ms, reconnect_backoff, sleep_or_cancel, BidSender, RECONNECT_MAX_DELAY};

pub const TOP_BID_UPDATE_LEN: usize = 188;

pub const ULTRASOUND_RELAY_HOSTNAME: &str = "relay.ultrasound.money";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected top bid update of {TOP_BID_UPDATE_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("slot out of range: {0}")]
    SlotOutOfRange(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopBidUpdate {
    pub timestamp_ms: u64,
    pub slot: Slot,
    pub block_number: u64,
    pub block_hash: B256,
    pub parent_hash: B256,
    pub builder_pubkey: FixedBytes<48>,
    pub fee_recipient: Address,
    pub value: U256,
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

impl TopBidUpdate {
    /// Layout: timestamp, slot and block number as little endian u64s, then block hash (32),
    /// parent hash (32), builder pubkey (48), fee recipient (20) and a little endian value (32).
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != TOP_BID_UPDATE_LEN {
            return Err(DecodeError::InvalidLength(bytes.len()));
        }

        let raw_slot = read_u64(bytes, 8);
        let slot = i64::try_from(raw_slot)
            .ok()
            .map(Slot)
            .filter(Slot::is_in_range)
            .ok_or(DecodeError::SlotOutOfRange(raw_slot))?;

        Ok(Self {
            timestamp_ms: read_u64(bytes, 0),
            slot,
            block_number: read_u64(bytes, 16),
            block_hash: B256::from_slice(&bytes[24..56]),
            parent_hash: B256::from_slice(&bytes[56..88]),
            builder_pubkey: FixedBytes::<48>::from_slice(&bytes[88..136]),
            fee_recipient: Address::from_slice(&bytes[136..156]),
            value: U256::from_le_slice(&bytes[156..188]),
        })
    }
}

impl CommonBid {
    pub fn from_top_bid_update(update: TopBidUpdate, relay: &str, received_at_ms: i64) -> Self {
        Self {
            source_type: SourceType::UltrasoundStream,
            received_at_ms,
            timestamp_ms: i64::try_from(update.timestamp_ms).ok(),
            slot: update.slot,
            value: update.value,
            block_hash: hex::encode_prefixed(update.block_hash),
            parent_hash: hex::encode_prefixed(update.parent_hash),
            builder_pubkey: hex::encode_prefixed(update.builder_pubkey),
            block_number: update.block_number,
            block_fee_recipient: hex::encode_prefixed(update.fee_recipient),
            relay: relay.to_string(),
            proposer_pubkey: String::new(),
            proposer_fee_recipient: String::new(),
            optimistic_submission: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    /// We were asked to stop, or nobody is listening anymore.
    Stopped,
    /// The relay closed the connection.
    Closed,
}

pub struct UltrasoundStreamClient {
    url: String,
    relay: String,
    tx: BidSender,
}

impl UltrasoundStreamClient {
    pub fn new(url: &str, relay: &str, tx: BidSender) -> Self {
        Self {
            url: url.to_string(),
            relay: relay.to_string(),
            tx,
        }
    }

    /// Keeps a connection open until cancelled, reconnecting with backoff whenever it drops.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = reconnect_backoff();

        loop {
            let connect = tokio::select! {
                _ = cancel.cancelled() => break,
                connect = connect_async(self.url.as_str()) => connect,
            };

            match connect {
                Ok((socket, _)) => {
                    info!(url = %self.url, "connected to top bid stream");
                    backoff.reset();

                    match self.forward_frames(socket, &cancel).await {
                        Ok(StreamEnd::Stopped) => break,
                        Ok(StreamEnd::Closed) => warn!(url = %self.url, "top bid stream closed"),
                        Err(err) => warn!(url = %self.url, ?err, "top bid stream read failed"),
                    }
                }
                Err(err) => warn!(url = %self.url, ?err, "failed to connect to top bid stream"),
            }

            let delay = backoff.next_backoff().unwrap_or(RECONNECT_MAX_DELAY);
            info!(delay_secs = delay.as_secs(), "reconnecting to top bid stream");
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }

        debug!("top bid stream client stopped");
    }

    async fn forward_frames<S>(&self, frames: S, cancel: &CancellationToken) -> Result<StreamEnd>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>,
    {
        pin_mut!(frames);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Stopped),
                frame = frames.next() => frame,
            };

            let bytes = match frame {
                None | Some(Ok(Message::Close(_))) => return Ok(StreamEnd::Closed),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(Message::Binary(bytes))) => bytes,
                // Pings are answered by tungstenite, nothing else is expected.
                Some(Ok(_)) => continue,
            };

            let update = match TopBidUpdate::decode(&bytes) {
                Ok(update) => update,
                Err(err) => {
                    warn!(%err, "dropping undecodable top bid update");
                    continue;
                }
            };

            let bid = CommonBid::from_top_bid_update(update, &self.relay, now_ms());
            debug!(slot = %bid.slot, value = %bid.value, "received top bid update");

            if self.tx.send(vec![bid]).await.is_err() {
                debug!("bid channel closed, stopping top bid stream");
                return Ok(StreamEnd::Stopped);
            }
        }
    }
}
