//! Environment variable parsing shared by configuration layers.

use std::env;
use std::str::FromStr;

use tracing::warn;

pub fn parse_env_usize(key: &str) -> Option<usize> {
    parse_env(key)
}

pub fn parse_env_u64(key: &str) -> Option<u64> {
    parse_env(key)
}

/// Reads `key` as a number. Unset or blank values yield `None`; values that do
/// not parse are reported and also yield `None` so the caller keeps its
/// current setting.
fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok().and_then(non_empty)?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(value = %value, key, "Invalid numeric config; ignoring");
            None
        }
    }
}

pub fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
