//! Environment helpers shared by the camlink configuration layers.

use std::time::Duration;

use crate::{Error, Result};

/// Reads a boolean flag, accepting `1`/`true`/`yes`/`on` case-insensitively.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Reads a millisecond duration. Unset or blank variables yield `None`.
pub fn env_duration_ms(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => parse_duration_ms(name, &value),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::config(format!("failed to read {name}: {e}"))),
    }
}

fn parse_duration_ms(name: &str, value: &str) -> Result<Option<Duration>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| Error::config(format!("{name} must be an integer millisecond value")))
}

/// Reads a comma or semicolon separated list. Unset variables yield `None`.
pub fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|value| split_list(&value))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
