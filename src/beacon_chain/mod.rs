mod node;
mod units;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;

pub use node::BeaconNode;
pub use node::BeaconNodeHttp;
pub use node::BlockRoot;
pub use node::HeadEvent;
pub use node::HeadEventStream;
pub use node::MockBeaconNode;
pub use node::ProposerDuty;

pub use units::slot_from_string;
pub use units::Epoch;
pub use units::Slot;

pub const GENESIS_TIMESTAMP_SECONDS: i64 = 1606824023;

lazy_static! {
    pub static ref GENESIS_TIMESTAMP: DateTime<Utc> =
        DateTime::from_timestamp(GENESIS_TIMESTAMP_SECONDS, 0)
            .expect("expect genesis timestamp to be a valid date time");
}
