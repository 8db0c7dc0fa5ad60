//! Relays and beacon nodes encode most numbers as JSON strings. These decoders turn them into
//! the numeric types we work with.
use std::str::FromStr;

use alloy_primitives::U256;
use serde::{de, Deserialize, Deserializer};

pub fn u64_from_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<u64>().map_err(|error| {
        de::Error::invalid_value(
            de::Unexpected::Str(&format!("unexpected value: {}, error: {}", s, error)),
            &"a number as string e.g. \"17519480\", which fits within u64",
        )
    })
}

/// Missing, null and empty string all decode to None.
pub fn opt_i64_from_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s.parse::<i64>().map(Some).map_err(|error| {
            de::Error::invalid_value(
                de::Unexpected::Str(&format!("unexpected value: {}, error: {}", s, error)),
                &"an optional number as string e.g. \"1686000000000\"",
            )
        }),
    }
}

/// Accepts both decimal and 0x prefixed hex strings.
pub fn u256_from_string<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    U256::from_str(&s).map_err(|error| {
        de::Error::invalid_value(
            de::Unexpected::Str(&format!("unexpected value: {}, error: {}", s, error)),
            &"a number as string e.g. \"118908973575220938641041929\", which fits within u256",
        )
    })
}
