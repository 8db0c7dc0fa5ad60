use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    fmt::Display,
    ops::{Add, Sub},
    str::FromStr,
};

use chrono::{DateTime, Duration, Utc};

use crate::beacon_chain::{GENESIS_TIMESTAMP, GENESIS_TIMESTAMP_SECONDS};

use super::Epoch;

// Beacon chain slots are defined as 12 second periods starting from genesis. Relays report slots
// as u64, we use a signed i64 so slot arithmetic around genesis does not wrap.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialOrd, PartialEq, Serialize)]
pub struct Slot(pub i64);

impl Slot {
    pub const SECONDS_PER_SLOT: i64 = 12;
    pub const SLOTS_PER_EPOCH: i64 = 32;
    /// Last slot whose start still fits unix milliseconds in an i64.
    pub const MAX: Self =
        Self((i64::MAX / 1000 - GENESIS_TIMESTAMP_SECONDS) / Self::SECONDS_PER_SLOT);

    /// Start of the slot.
    pub fn date_time(&self) -> DateTime<Utc> {
        self.into()
    }

    /// Start of the slot in unix milliseconds. Saturates when that does not fit an i64.
    pub fn timestamp_ms(&self) -> i64 {
        match self.checked_timestamp_ms() {
            Some(timestamp_ms) => timestamp_ms,
            None if self.0 < 0 => i64::MIN,
            None => i64::MAX,
        }
    }

    pub fn checked_timestamp_ms(&self) -> Option<i64> {
        self.0
            .checked_mul(Self::SECONDS_PER_SLOT)
            .and_then(|seconds| seconds.checked_add(GENESIS_TIMESTAMP_SECONDS))
            .and_then(|seconds| seconds.checked_mul(1000))
    }

    /// Slots received from relays and beacon nodes are expected in this range, anything else is
    /// garbage.
    pub fn is_in_range(&self) -> bool {
        (0..=Self::MAX.0).contains(&self.0)
    }

    /// Returns the slot in progress at the given date_time.
    ///
    /// Before genesis this floors towards negative infinity. Nothing relies on pre-genesis slots
    /// and callers should not either.
    pub fn from_date_time_rounded_down(date_time: &DateTime<Utc>) -> Self {
        Self::from_timestamp_ms(date_time.timestamp_millis())
    }

    pub fn from_timestamp_ms(timestamp_ms: i64) -> Self {
        let ms_since_genesis = timestamp_ms - GENESIS_TIMESTAMP_SECONDS * 1000;
        Self(ms_since_genesis.div_euclid(Self::SECONDS_PER_SLOT * 1000))
    }

    pub fn now() -> Self {
        Self::from_date_time_rounded_down(&Utc::now())
    }

    pub fn epoch(&self) -> Epoch {
        Epoch(self.0.div_euclid(Self::SLOTS_PER_EPOCH))
    }

}

impl Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<i64> for Slot {
    type Output = Self;

    fn add(self, rhs: i64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<i64> for Slot {
    type Output = Self;

    fn sub(self, rhs: i64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl From<Slot> for DateTime<Utc> {
    fn from(slot: Slot) -> Self {
        let seconds = slot.0 * Slot::SECONDS_PER_SLOT;
        *GENESIS_TIMESTAMP + Duration::seconds(seconds)
    }
}

impl From<&Slot> for DateTime<Utc> {
    fn from(slot: &Slot) -> Self {
        Into::<DateTime<Utc>>::into(*slot)
    }
}

impl From<i64> for Slot {
    fn from(slot: i64) -> Self {
        Self(slot)
    }
}

impl From<Slot> for i64 {
    fn from(slot: Slot) -> Self {
        slot.0
    }
}

impl FromStr for Slot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

pub fn slot_from_string<'de, D>(deserializer: D) -> Result<Slot, D::Error>
where
    D: Deserializer<'de>,
{
    let slot_text = String::deserialize(deserializer)?;
    let invalid_value = |error: &dyn Display| -> D::Error {
        serde::de::Error::invalid_value(
            serde::de::Unexpected::Str(&format!("unexpected value: {slot_text}, error: {error}")),
            &"a slot number as string e.g. \"6591598\"",
        )
    };

    let slot = slot_text
        .parse::<i64>()
        .map(Slot)
        .map_err(|error| invalid_value(&error))?;

    if slot.is_in_range() {
        Ok(slot)
    } else {
        Err(invalid_value(&"slot out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_timestamp_test() {
        assert_eq!(
            Slot(0).date_time(),
            "2020-12-01T12:00:23Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            Slot(3599).date_time(),
            "2020-12-02T00:00:11Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn known_slot_time_test() {
        let slot = Slot(6591598);
        assert_eq!(slot.date_time().timestamp(), 1685923199);
        assert_eq!(slot.timestamp_ms(), 1685923199000);
        assert_eq!(Slot::from_date_time_rounded_down(&slot.date_time()), slot);
    }

    #[test]
    fn round_trip_test() {
        for slot in [0, 1, 11, 31, 32, 3599, 4700013, 6591598, 9_999_999, 2_147_483_648] {
            let slot = Slot(slot);
            assert_eq!(Slot::from_date_time_rounded_down(&slot.date_time()), slot);
            assert_eq!(Slot::from_timestamp_ms(slot.timestamp_ms()), slot);
        }
    }

    #[test]
    fn rounds_down_within_slot_test() {
        let start = Slot(100).timestamp_ms();
        assert_eq!(Slot::from_timestamp_ms(start + 11_999), Slot(100));
        assert_eq!(Slot::from_timestamp_ms(start + 12_000), Slot(101));
        assert_eq!(Slot::from_timestamp_ms(start - 1), Slot(99));
    }

    #[test]
    fn monotonic_test() {
        let mut last = Slot::from_timestamp_ms(Slot(500).timestamp_ms());
        for ms in (0..60_000).step_by(250) {
            let slot = Slot::from_timestamp_ms(Slot(500).timestamp_ms() + ms);
            assert!(slot >= last);
            last = slot;
        }
        assert_eq!(last, Slot(504));
    }

    #[test]
    fn arithmetic_operations() {
        assert_eq!(Slot(3) + 5, Slot(8));
        assert_eq!(Slot(3) - 2, Slot(1));
    }

    #[test]
    fn epoch_calculation() {
        assert_eq!(Slot(0).epoch(), Epoch(0));
        assert_eq!(Slot(31).epoch(), Epoch(0));
        assert_eq!(Slot(32).epoch(), Epoch(1));
        assert_eq!(Slot(320).epoch(), Epoch(10));
    }

    #[test]
    fn slot_string_parse() {
        assert!(Slot::from_str("invalid").is_err());
        assert_eq!(Slot::from_str("5").unwrap(), Slot(5));
    }

    #[test]
    fn slot_from_string_test() {
        #[derive(Deserialize)]
        struct Head {
            #[serde(deserialize_with = "slot_from_string")]
            slot: Slot,
        }

        let head: Head = serde_json::from_str(r#"{"slot":"6591598"}"#).unwrap();
        assert_eq!(head.slot, Slot(6591598));
        assert!(serde_json::from_str::<Head>(r#"{"slot":"x"}"#).is_err());
        assert!(serde_json::from_str::<Head>(r#"{"slot":"-1"}"#).is_err());
        assert!(serde_json::from_str::<Head>(r#"{"slot":"4611686018427387904"}"#).is_err());
    }

    #[test]
    fn timestamp_ms_out_of_range_test() {
        assert_eq!(Slot::MAX.checked_timestamp_ms(), Some(Slot::MAX.timestamp_ms()));
        assert!(Slot::MAX.is_in_range());
        assert!(!(Slot::MAX + 1).is_in_range());
        assert!(!Slot(-1).is_in_range());

        let garbage = Slot(1 << 62);
        assert_eq!(garbage.checked_timestamp_ms(), None);
        assert_eq!(garbage.timestamp_ms(), i64::MAX);
        assert_eq!(Slot(i64::MIN).timestamp_ms(), i64::MIN);
    }
}
