//! Fns to read variables from the environment more conveniently.

use std::env;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use tracing::debug;

// Beacon node URLs regularly carry an API key in their path or credentials.
const SECRET_LOG_BLACKLIST: [&str; 1] = ["BEACON_URL"];

lazy_static! {
    pub static ref ENV_CONFIG: EnvConfig = get_env_config();
}

fn obfuscate_if_secret(blacklist: &[&str], key: &str, value: &str) -> String {
    if blacklist.contains(&key) {
        let mut last_four = value.to_string();
        last_four.drain(0..value.len().saturating_sub(4));
        format!("****{last_four}")
    } else {
        value.to_string()
    }
}

/// Get an environment variable, encoding found or missing as Option, and panic otherwise.
pub fn get_env_var(key: &str) -> Option<String> {
    let var = match env::var(key) {
        Err(env::VarError::NotPresent) => None,
        Err(e) => panic!("{e}"),
        Ok(var) => Some(var),
    };

    if let Some(ref existing_var) = var {
        let output = obfuscate_if_secret(&SECRET_LOG_BLACKLIST, key, existing_var);
        debug!("env var {key}: {output}");
    } else {
        debug!("env var {key} requested but not found")
    };

    var
}

pub fn get_env_bool(key: &str) -> Result<Option<bool>> {
    get_env_var(key)
        .map(|var| match var.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            str => Err(anyhow!("invalid bool value {str} for {key}")),
        })
        .transpose()
}

/// Splits a comma separated variable into its trimmed, non-empty parts.
pub fn get_env_list(key: &str) -> Option<Vec<String>> {
    get_env_var(key).map(|var| {
        var.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
}

pub struct EnvConfig {
    pub log_json: bool,
    pub log_perf: bool,
}

/// Read before logging is set up, an invalid flag counts as unset.
pub fn get_env_config() -> EnvConfig {
    EnvConfig {
        log_json: get_env_bool("LOG_JSON").ok().flatten().unwrap_or(false),
        log_perf: get_env_bool("LOG_PERF").ok().flatten().unwrap_or(false),
    }
}
