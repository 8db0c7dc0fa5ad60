//! Collector settings, read from the environment with defaults for mainnet.

use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};

use crate::{
    bids::{RotatingFileSinkConfig, SourceType},
    env::{get_env_bool, get_env_list, get_env_var},
    relays::RelayEntry,
    sources::{ultrasound_stream::ULTRASOUND_RELAY_HOSTNAME, KnownErrors},
};

pub const DEFAULT_ULTRASOUND_STREAM_URL: &str =
    "ws://relay-builders-eu.ultrasound.money/ws/v1/top_bid";

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub beacon_url: Option<String>,
    pub relays: Vec<RelayEntry>,
    pub ultrasound_stream_url: String,
    /// Hostname recorded as the relay of top bid stream bids.
    pub ultrasound_stream_relay: String,
    pub out_dir: PathBuf,
    pub output_tsv: bool,
    pub bucket_seconds: i64,
    pub uid: Option<String>,
    pub sources: Vec<SourceType>,
    pub http_timeout: Duration,
    pub housekeeping_interval: Duration,
    pub get_header_known_errors: KnownErrors,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            beacon_url: None,
            relays: RelayEntry::default_mainnet(),
            ultrasound_stream_url: DEFAULT_ULTRASOUND_STREAM_URL.to_string(),
            ultrasound_stream_relay: ULTRASOUND_RELAY_HOSTNAME.to_string(),
            out_dir: PathBuf::from("csv"),
            output_tsv: false,
            bucket_seconds: 3600,
            uid: None,
            sources: SourceType::ALL.to_vec(),
            http_timeout: Duration::from_millis(5000),
            housekeeping_interval: Duration::from_secs(30),
            get_header_known_errors: KnownErrors::default(),
        }
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env_var(key)
        .map(|var| {
            var.trim()
                .parse::<T>()
                .map_err(|err| anyhow!("invalid value for {key}: {err}"))
        })
        .transpose()
}

impl CollectorConfig {
    /// Reads settings from the environment. Not validated, callers may still override fields.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let relays = match get_env_list("RELAY_URLS") {
            Some(urls) => urls
                .iter()
                .map(|url| url.parse::<RelayEntry>())
                .collect::<Result<Vec<_>>>()
                .context("invalid RELAY_URLS")?,
            None => defaults.relays,
        };

        let sources = match get_env_list("BIDS_SOURCES") {
            Some(sources) => sources
                .iter()
                .map(|source| source.parse::<SourceType>())
                .collect::<Result<Vec<_>>>()
                .context("invalid BIDS_SOURCES")?,
            None => defaults.sources,
        };

        let get_header_known_errors = match get_env_var("GET_HEADER_KNOWN_ERRORS") {
            Some(table) => table
                .parse::<KnownErrors>()
                .context("invalid GET_HEADER_KNOWN_ERRORS")?,
            None => defaults.get_header_known_errors,
        };

        Ok(Self {
            beacon_url: get_env_var("BEACON_URL"),
            relays,
            ultrasound_stream_url: get_env_var("ULTRASOUND_STREAM_URL")
                .unwrap_or(defaults.ultrasound_stream_url),
            ultrasound_stream_relay: defaults.ultrasound_stream_relay,
            out_dir: get_env_var("BIDS_OUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.out_dir),
            output_tsv: get_env_bool("BIDS_OUTPUT_TSV")?.unwrap_or(defaults.output_tsv),
            bucket_seconds: parse_env("BIDS_BUCKET_SECONDS")?.unwrap_or(defaults.bucket_seconds),
            uid: get_env_var("BIDS_UID").filter(|uid| !uid.trim().is_empty()),
            sources,
            http_timeout: parse_env("BIDS_HTTP_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.http_timeout),
            housekeeping_interval: defaults.housekeeping_interval,
            get_header_known_errors,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("no bid sources enabled"));
        }

        if self.bucket_seconds <= 0 {
            return Err(anyhow!(
                "bucket seconds must be positive, got {}",
                self.bucket_seconds
            ));
        }

        if self.sources.contains(&SourceType::GetHeader) && self.beacon_url.is_none() {
            return Err(anyhow!("BEACON_URL is required to collect get-header bids"));
        }

        let polls_relays = self.sources.contains(&SourceType::GetHeader)
            || self.sources.contains(&SourceType::DataApi);
        if polls_relays && self.relays.is_empty() {
            return Err(anyhow!("no relays configured to poll"));
        }

        Ok(())
    }

    pub fn is_enabled(&self, source_type: SourceType) -> bool {
        self.sources.contains(&source_type)
    }

    pub fn sink_config(&self) -> RotatingFileSinkConfig {
        RotatingFileSinkConfig {
            out_dir: self.out_dir.clone(),
            bucket_seconds: self.bucket_seconds,
            uid: self.uid.clone(),
            use_tsv: self.output_tsv,
        }
    }
}
