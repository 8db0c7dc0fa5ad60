//! Follows the head of the chain and, for every next slot, asks each relay for the header it
//! would hand the proposer. Requests go out one second after the slot starts, by then the
//! relay's winning bid is settled.

use std::{collections::HashMap, fmt::Display, str::FromStr, sync::Arc};

use anyhow::{anyhow, Result};
use backoff::backoff::Backoff;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    beacon_chain::{BeaconNode, Epoch, HeadEvent, HeadEventStream, Slot},
    bids::{normalize_hex, CommonBid, SourceType},
    relays::{BuilderBid, GetHeaderError, RelayApi},
};

use super::{
    now_ms, reconnect_backoff, sleep_or_cancel, sleep_until_ms, BidSender, RECONNECT_MAX_DELAY,
};

pub const REQUEST_DELAY_MS: i64 = 1000;

/// Answers that mean there is nothing to collect, rather than that something went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedOutcome {
    NoBid,
    RateLimited,
}

impl ExpectedOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ExpectedOutcome::NoBid => "no-bid",
            ExpectedOutcome::RateLimited => "rate-limited",
        }
    }
}

impl Display for ExpectedOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExpectedOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "no-bid" => Ok(ExpectedOutcome::NoBid),
            "rate-limited" => Ok(ExpectedOutcome::RateLimited),
            unknown => Err(anyhow!("unknown expected outcome: {unknown}")),
        }
    }
}

/// Error message substrings relays use for expected outcomes. Relays each phrase these
/// differently so the table is configurable, see `FromStr` for the format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownErrors(Vec<(String, ExpectedOutcome)>);

impl KnownErrors {
    pub fn new(entries: Vec<(String, ExpectedOutcome)>) -> Self {
        Self(entries)
    }

    /// Exact, case sensitive substring match, first entry wins.
    pub fn classify(&self, message: &str) -> Option<ExpectedOutcome> {
        self.0
            .iter()
            .find(|(substring, _)| message.contains(substring.as_str()))
            .map(|(_, outcome)| *outcome)
    }
}

impl Default for KnownErrors {
    fn default() -> Self {
        Self::new(vec![
            ("no builder bid".to_string(), ExpectedOutcome::NoBid),
            (
                "Too many getHeader requests".to_string(),
                ExpectedOutcome::RateLimited,
            ),
        ])
    }
}

/// Parses `outcome:substring` entries separated by semicolons, e.g.
/// `no-bid:no bid available;rate-limited:Too many requests`.
impl FromStr for KnownErrors {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| -> Result<(String, ExpectedOutcome)> {
                let (outcome, substring) = entry
                    .split_once(':')
                    .ok_or_else(|| anyhow!("known error entry missing ':' separator: {entry}"))?;
                let substring = substring.trim();
                if substring.is_empty() {
                    return Err(anyhow!("known error entry has an empty substring: {entry}"));
                }
                Ok((substring.to_string(), outcome.parse::<ExpectedOutcome>()?))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }
}

/// Proposers of the loaded epoch and the one after, so the first slot of the next epoch is
/// known before its duties would otherwise be fetched.
#[derive(Debug, Default)]
pub struct ProposerDutiesCache {
    loaded_epoch: Option<Epoch>,
    proposers: HashMap<Slot, String>,
}

impl ProposerDutiesCache {
    pub async fn refresh(&mut self, beacon_node: &dyn BeaconNode, epoch: Epoch) -> Result<()> {
        if self.loaded_epoch == Some(epoch) {
            return Ok(());
        }

        let mut proposers = HashMap::new();
        for epoch in [epoch, epoch + 1] {
            for duty in beacon_node.get_proposer_duties(epoch).await? {
                proposers.insert(duty.slot, normalize_hex(&duty.pubkey));
            }
        }

        debug!(%epoch, count = proposers.len(), "loaded proposer duties");

        self.proposers = proposers;
        self.loaded_epoch = Some(epoch);

        Ok(())
    }

    pub fn proposer(&self, slot: Slot) -> Option<&str> {
        self.proposers.get(&slot).map(String::as_str)
    }
}

impl CommonBid {
    pub fn from_get_header(
        bid: BuilderBid,
        slot: Slot,
        relay: &str,
        proposer_pubkey: &str,
        received_at_ms: i64,
    ) -> Self {
        Self {
            source_type: SourceType::GetHeader,
            received_at_ms,
            timestamp_ms: None,
            slot,
            value: bid.value,
            block_hash: normalize_hex(&bid.header.block_hash),
            parent_hash: normalize_hex(&bid.header.parent_hash),
            builder_pubkey: normalize_hex(&bid.pubkey),
            block_number: bid.header.block_number,
            block_fee_recipient: normalize_hex(&bid.header.fee_recipient),
            relay: relay.to_string(),
            proposer_pubkey: normalize_hex(proposer_pubkey),
            proposer_fee_recipient: String::new(),
            optimistic_submission: None,
        }
    }
}

/// What the poller remembers across head events, and across resubscriptions.
#[derive(Debug, Default)]
struct HeadState {
    duties: ProposerDutiesCache,
    /// Slot the last set of requests went out for. Heads repeat on reorgs, each slot is polled
    /// once.
    last_scheduled_slot: Option<Slot>,
}

#[derive(Debug, PartialEq, Eq)]
enum HeadsEnd {
    Stopped,
    Closed,
}

pub struct GetHeaderPoller {
    beacon_node: Arc<dyn BeaconNode>,
    relays: Vec<Arc<dyn RelayApi>>,
    known_errors: Arc<KnownErrors>,
    tx: BidSender,
}

impl GetHeaderPoller {
    pub fn new(
        beacon_node: Arc<dyn BeaconNode>,
        relays: Vec<Arc<dyn RelayApi>>,
        known_errors: KnownErrors,
        tx: BidSender,
    ) -> Self {
        Self {
            beacon_node,
            relays,
            known_errors: Arc::new(known_errors),
            tx,
        }
    }

    /// Follows head events until cancelled, resubscribing with backoff whenever the event stream
    /// drops.
    pub async fn run(self, cancel: CancellationToken) {
        info!(relays = self.relays.len(), "starting get header poller");

        let mut backoff = reconnect_backoff();
        let mut state = HeadState::default();

        loop {
            let subscribe = tokio::select! {
                _ = cancel.cancelled() => break,
                subscribe = self.beacon_node.head_events() => subscribe,
            };

            match subscribe {
                Ok(heads) => {
                    backoff.reset();

                    if self.follow_heads(heads, &mut state, &cancel).await == HeadsEnd::Stopped {
                        break;
                    }
                    warn!("beacon node head event stream ended");
                }
                Err(err) => warn!(?err, "failed to subscribe to beacon node head events"),
            }

            let delay = backoff.next_backoff().unwrap_or(RECONNECT_MAX_DELAY);
            info!(delay_secs = delay.as_secs(), "resubscribing to head events");
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }

        debug!("get header poller stopped");
    }

    async fn follow_heads(
        &self,
        mut heads: HeadEventStream,
        state: &mut HeadState,
        cancel: &CancellationToken,
    ) -> HeadsEnd {
        loop {
            let head = tokio::select! {
                _ = cancel.cancelled() => return HeadsEnd::Stopped,
                head = heads.next() => head,
            };

            match head {
                None => return HeadsEnd::Closed,
                Some(Err(err)) => warn!(?err, "bad head event"),
                Some(Ok(head)) => self.on_head(head, state, cancel).await,
            }
        }
    }

    async fn on_head(
        &self,
        head: HeadEvent,
        state: &mut HeadState,
        cancel: &CancellationToken,
    ) {
        let slot = head.slot + 1;
        debug!(head_slot = %head.slot, %slot, "new head");

        if state
            .last_scheduled_slot
            .is_some_and(|last_scheduled_slot| slot <= last_scheduled_slot)
        {
            debug!(%slot, "get header already scheduled for slot, skipping");
            return;
        }

        if let Err(err) = state
            .duties
            .refresh(self.beacon_node.as_ref(), head.slot.epoch())
            .await
        {
            warn!(?err, epoch = %head.slot.epoch(), "failed to refresh proposer duties");
        }

        let proposer_pubkey = match state.duties.proposer(slot) {
            Some(pubkey) => pubkey.to_string(),
            None => {
                info!(%slot, "no known proposer, skipping get header");
                return;
            }
        };

        let parent_hash = match self
            .beacon_node
            .get_execution_block_hash(&head.block)
            .await
        {
            Ok(Some(block_hash)) => block_hash,
            Ok(None) => {
                warn!(
                    block_root = %head.block,
                    "head block has no execution payload, skipping get header"
                );
                return;
            }
            Err(err) => {
                warn!(block_root = %head.block, ?err, "failed to get head execution block hash");
                return;
            }
        };

        let request_at_ms = slot.timestamp_ms() + REQUEST_DELAY_MS;
        state.last_scheduled_slot = Some(slot);

        for relay_api in &self.relays {
            let relay_api = relay_api.clone();
            let parent_hash = parent_hash.clone();
            let proposer_pubkey = proposer_pubkey.clone();
            let known_errors = self.known_errors.clone();
            let tx = self.tx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                if !sleep_until_ms(request_at_ms, &cancel).await {
                    return;
                }
                request_header(
                    relay_api,
                    slot,
                    &parent_hash,
                    &proposer_pubkey,
                    &known_errors,
                    tx,
                )
                .await;
            });
        }
    }
}

pub async fn request_header(
    relay_api: Arc<dyn RelayApi>,
    slot: Slot,
    parent_hash: &str,
    proposer_pubkey: &str,
    known_errors: &KnownErrors,
    tx: BidSender,
) {
    let relay = relay_api.relay().hostname().to_string();

    let bid = match relay_api
        .fetch_header(slot, parent_hash, proposer_pubkey)
        .await
    {
        Ok(bid) => bid,
        Err(GetHeaderError::NoContent) => {
            debug!(%relay, %slot, "relay has no bid");
            return;
        }
        Err(err) => {
            let message = err.to_string();
            match known_errors.classify(&message) {
                Some(outcome) => debug!(%relay, %slot, %outcome, "expected get header outcome"),
                None => warn!(%relay, %slot, %message, "failed to get header"),
            }
            return;
        }
    };

    let bid = CommonBid::from_get_header(bid, slot, &relay, proposer_pubkey, now_ms());
    debug!(%relay, %slot, value = %bid.value, "received header");

    if tx.send(vec![bid]).await.is_err() {
        debug!(%relay, "bid channel closed, dropping header");
    }
}
