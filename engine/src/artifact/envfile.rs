//! `KEY=VALUE` files as shipped inside release archives and instance directories

use std::collections::BTreeMap;

use crate::errors::FleetError;

/// Parse `KEY=VALUE` lines, skipping blank lines and `#` comments.
/// Any other line without `=` is an error.
pub fn parse_env(contents: &str) -> Result<BTreeMap<String, String>, FleetError> {
    let mut params = BTreeMap::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            FleetError::ValidationError(format!("line {}: expected KEY=VALUE", number + 1))
        })?;
        params.insert(key.trim().to_string(), unquote(value.trim()).to_string());
    }
    Ok(params)
}

/// Like [`parse_env`] but drops malformed lines, for remote command output
/// that may interleave other text
pub fn parse_env_lossy(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty() && !key.contains(char::is_whitespace))
        .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
