use std::time::Duration;

use alloy_primitives::U256;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use format_url::FormatUrl;
use mockall::automock;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    beacon_chain::{slot_from_string, Slot},
    json_codecs::{opt_i64_from_string, u256_from_string, u64_from_string},
};

use super::RelayEntry;

/// A bid as listed by the relay data API, one per block submission the relay received.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BidTrace {
    #[serde(deserialize_with = "slot_from_string")]
    pub slot: Slot,
    pub parent_hash: String,
    pub block_hash: String,
    pub builder_pubkey: String,
    pub proposer_pubkey: String,
    pub proposer_fee_recipient: String,
    #[serde(deserialize_with = "u256_from_string")]
    pub value: U256,
    #[serde(deserialize_with = "u64_from_string")]
    pub block_number: u64,
    /// Seconds, older relays only report this one.
    #[serde(default, deserialize_with = "opt_i64_from_string")]
    pub timestamp: Option<i64>,
    #[serde(default, deserialize_with = "opt_i64_from_string")]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub optimistic_submission: bool,
}

impl BidTrace {
    pub fn received_timestamp_ms(&self) -> Option<i64> {
        self.timestamp_ms
            .or_else(|| self.timestamp.and_then(|seconds| seconds.checked_mul(1000)))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ExecutionPayloadHeader {
    pub parent_hash: String,
    pub fee_recipient: String,
    pub block_hash: String,
    #[serde(deserialize_with = "u64_from_string")]
    pub block_number: u64,
    #[serde(deserialize_with = "u64_from_string")]
    pub timestamp: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BuilderBid {
    pub header: ExecutionPayloadHeader,
    #[serde(deserialize_with = "u256_from_string")]
    pub value: U256,
    /// Public key of the relay signing the bid.
    pub pubkey: String,
}

#[derive(Debug, Deserialize)]
struct SignedBuilderBid {
    message: BuilderBid,
}

#[derive(Debug, Deserialize)]
struct GetHeaderResponse {
    data: SignedBuilderBid,
}

#[derive(Debug, Error)]
pub enum GetHeaderError {
    /// Standard builder API answer when the relay has no bid for the request.
    #[error("relay has no bid (204 no content)")]
    NoContent,
    #[error("relay responded with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode header response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[automock]
#[async_trait]
pub trait RelayApi: Send + Sync {
    fn relay(&self) -> &RelayEntry;
    async fn fetch_builder_bids(&self, slot: Slot) -> Result<Vec<BidTrace>>;
    async fn fetch_header(
        &self,
        slot: Slot,
        parent_hash: &str,
        proposer_pubkey: &str,
    ) -> Result<BuilderBid, GetHeaderError>;
}

pub struct RelayApiHttp {
    relay: RelayEntry,
    client: reqwest::Client,
}

impl RelayApiHttp {
    pub fn new(relay: RelayEntry, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build relay http client")?;

        Ok(Self { relay, client })
    }
}

#[async_trait]
impl RelayApi for RelayApiHttp {
    fn relay(&self) -> &RelayEntry {
        &self.relay
    }

    async fn fetch_builder_bids(&self, slot: Slot) -> Result<Vec<BidTrace>> {
        let url = FormatUrl::new(self.relay.url())
            .with_path_template("/relay/v1/data/bidtraces/builder_blocks_received")
            .with_query_params(vec![("slot", slot.to_string().as_str())])
            .format_url();

        let res = self.client.get(&url).send().await?;

        match res.status() {
            StatusCode::OK => res
                .json::<Vec<BidTrace>>()
                .await
                .with_context(|| format!("failed to decode bid traces from {url}")),
            status => Err(anyhow!(
                "failed to fetch builder bids. relay = {} status = {} url = {}",
                self.relay,
                status,
                url
            )),
        }
    }

    async fn fetch_header(
        &self,
        slot: Slot,
        parent_hash: &str,
        proposer_pubkey: &str,
    ) -> Result<BuilderBid, GetHeaderError> {
        let url = format!(
            "{}/eth/v1/builder/header/{}/{}/{}",
            self.relay.url(),
            slot,
            parent_hash,
            proposer_pubkey
        );

        let res = self.client.get(&url).send().await?;

        match res.status() {
            StatusCode::NO_CONTENT => Err(GetHeaderError::NoContent),
            StatusCode::OK => {
                let body = res.bytes().await?;
                let response = serde_json::from_slice::<GetHeaderResponse>(&body)?;
                Ok(response.data.message)
            }
            status => {
                let body = res.text().await.unwrap_or_default();
                Err(GetHeaderError::Status { status, body })
            }
        }
    }
}
