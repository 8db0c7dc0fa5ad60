//! Functions that know how to communicate with a beacon node to follow the head of the chain and
//! find out who proposes upcoming slots.
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, stream::BoxStream, StreamExt};
use mockall::automock;
use reqwest::{header::ACCEPT, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::json_codecs::u64_from_string;

use super::{slot_from_string, Epoch, Slot};

/// Keccak hash of a beacon block.
pub type BlockRoot = String;

/// Emitted by the beacon node every time a new block becomes the head of the chain.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct HeadEvent {
    #[serde(deserialize_with = "slot_from_string")]
    pub slot: Slot,
    /// Root of the new head block.
    pub block: BlockRoot,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ProposerDuty {
    pub pubkey: String,
    #[serde(deserialize_with = "u64_from_string")]
    pub validator_index: u64,
    #[serde(deserialize_with = "slot_from_string")]
    pub slot: Slot,
}

#[derive(Debug, Deserialize)]
struct ProposerDutiesEnvelope {
    data: Vec<ProposerDuty>,
}

#[derive(Debug, Deserialize)]
struct ExecutionPayload {
    block_hash: String,
}

#[derive(Debug, Deserialize)]
struct BeaconBlockBody {
    execution_payload: Option<ExecutionPayload>,
}

#[derive(Debug, Deserialize)]
struct BeaconBlock {
    body: BeaconBlockBody,
}

/// A signed envelope.
#[derive(Debug, Deserialize)]
struct BeaconBlockSignedEnvelope {
    message: BeaconBlock,
}

/// A versioned envelope.
#[derive(Debug, Deserialize)]
struct BeaconBlockVersionedEnvelope {
    data: BeaconBlockSignedEnvelope,
}

pub type HeadEventStream = BoxStream<'static, Result<HeadEvent>>;

#[automock]
#[async_trait]
pub trait BeaconNode: Send + Sync {
    /// Subscribes to head events. The stream ends when the node closes the connection.
    async fn head_events(&self) -> Result<HeadEventStream>;
    async fn get_proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerDuty>>;
    /// Hash of the execution payload carried by the given beacon block, if any.
    async fn get_execution_block_hash(&self, block_root: &str) -> Result<Option<String>>;
}

#[derive(Clone, Debug)]
pub struct BeaconNodeHttp {
    beacon_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl BeaconNodeHttp {
    /// The client itself carries no total timeout as the event stream is held open indefinitely,
    /// regular requests set their own.
    pub fn new(beacon_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .context("failed to build beacon node http client")?;

        Ok(Self {
            beacon_url: beacon_url.trim_end_matches('/').to_string(),
            client,
            request_timeout,
        })
    }
}

#[async_trait]
impl BeaconNode for BeaconNodeHttp {
    async fn head_events(&self) -> Result<HeadEventStream> {
        let url = format!("{}/eth/v1/events?topics=head", self.beacon_url);

        let res = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        debug!("subscribed to beacon node head events");

        let events = res
            .bytes_stream()
            .eventsource()
            .filter(|event| {
                future::ready(
                    event
                        .as_ref()
                        .map_or(true, |event| event.event == "head" && !event.data.is_empty()),
                )
            })
            .map(|event| match event {
                Ok(event) => serde_json::from_str::<HeadEvent>(&event.data)
                    .with_context(|| format!("failed to decode head event: {}", event.data)),
                Err(err) => Err(anyhow!("failed to read head event stream: {err}")),
            });

        Ok(events.boxed())
    }

    async fn get_proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerDuty>> {
        let url = format!(
            "{}/eth/v1/validator/duties/proposer/{}",
            self.beacon_url, epoch
        );

        self.client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<ProposerDutiesEnvelope>()
            .await
            .map(|envelope| envelope.data)
            .map_err(Into::into)
    }

    async fn get_execution_block_hash(&self, block_root: &str) -> Result<Option<String>> {
        let url = format!("{}/eth/v2/beacon/blocks/{}", self.beacon_url, block_root);

        let res = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        match res.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => {
                let envelope = res.json::<BeaconBlockVersionedEnvelope>().await?;
                Ok(envelope
                    .data
                    .message
                    .body
                    .execution_payload
                    .map(|payload| payload.block_hash))
            }
            status => Err(anyhow!(
                "failed to fetch block by block_root. block_root = {} status = {} url = {}",
                block_root,
                status,
                res.url()
            )),
        }
    }
}
