pub mod beacon_chain;
pub mod bids;
pub mod collector;
pub mod config;
mod env;
mod json_codecs;
pub mod log;
pub mod relays;
pub mod sources;

pub use collector::Collector;
pub use config::CollectorConfig;
