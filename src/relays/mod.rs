mod relay_api;

use std::{fmt::Display, str::FromStr};

use anyhow::{anyhow, Context};
use reqwest::Url;

pub use relay_api::BidTrace;
pub use relay_api::BuilderBid;
pub use relay_api::ExecutionPayloadHeader;
pub use relay_api::GetHeaderError;
pub use relay_api::MockRelayApi;
pub use relay_api::RelayApi;
pub use relay_api::RelayApiHttp;

/// Relays we collect from when none are configured. Pubkeys are only listed where needed to
/// tell relays apart, collection does not verify signatures.
pub const DEFAULT_MAINNET_RELAYS: [&str; 7] = [
    "https://0xac6e77dfe25ecd6110b8e780608cce0dab71fdd5ebea22a16c0205200f2f8e2e3ad3b71d3499c54ad14d6c21b41a37ae@boost-relay.flashbots.net",
    "https://0xa1559ace749633b997cb3fdacffb890aeebdb0f5a3b6aaa7eeeaf1a38af0a8fe88b9e4b1f61f236d2e64d95733327a62@relay.ultrasound.money",
    "https://aestus.live",
    "https://agnostic-relay.net",
    "https://bloxroute.max-profit.blxrbdn.com",
    "https://bloxroute.regulated.blxrbdn.com",
    "https://titanrelay.xyz",
];

/// Where to find a relay. Parsed from URLs of the form `https://0xpubkey@hostname`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEntry {
    hostname: String,
    url: String,
    pubkey: Option<String>,
}

impl RelayEntry {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Base URL without credentials or trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pubkey(&self) -> Option<&str> {
        self.pubkey.as_deref()
    }

    pub fn default_mainnet() -> Vec<Self> {
        DEFAULT_MAINNET_RELAYS
            .iter()
            .map(|url| {
                url.parse()
                    .expect("expect default relay urls to be valid relay entries")
            })
            .collect()
    }
}

impl FromStr for RelayEntry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s.trim()).with_context(|| format!("invalid relay url: {s}"))?;

        let hostname = url
            .host_str()
            .ok_or_else(|| anyhow!("relay url is missing a host: {s}"))?
            .to_string();

        let pubkey = match url.username() {
            "" => None,
            username => Some(username.to_lowercase()),
        };

        let host_with_port = match url.port() {
            Some(port) => format!("{hostname}:{port}"),
            None => hostname.clone(),
        };
        let path = url.path().trim_end_matches('/');

        Ok(Self {
            url: format!("{}://{}{}", url.scheme(), host_with_port, path),
            hostname,
            pubkey,
        })
    }
}

impl Display for RelayEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hostname)
    }
}
