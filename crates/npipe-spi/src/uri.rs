// SPDX-License-Identifier: Apache-2.0

//! Shared URI parameter helpers for the storage and connector SPIs (spec §6 "URI format").
//!
//! `scheme://[user[:pct-encoded-password]@]host[:port]/path[?k1=v1&k2=v2...]` with
//! case-insensitive parameter names and URL-encoded values.

use std::collections::HashMap;
use url::Url;

/// Collects a URI's query parameters into a lower-cased-key map, so callers can look up
/// well-known parameters (`encrypt`, `trustServerCertificate`, `connect timeout`, ...)
/// regardless of the casing a user wrote them with.
#[must_use]
pub fn query_params(uri: &Url) -> HashMap<String, String> {
    uri.query_pairs()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
        .collect()
}

/// Parses a well-known boolean parameter (`true`/`false`, case-insensitive), defaulting to
/// `default` when absent or unparsable.
#[must_use]
pub fn bool_param(params: &HashMap<String, String>, name: &str, default: bool) -> bool {
    params
        .get(&name.to_ascii_lowercase())
        .and_then(|v| v.to_ascii_lowercase().parse::<bool>().ok())
        .unwrap_or(default)
}

/// Parses a well-known integer parameter, defaulting to `default` when absent or unparsable.
#[must_use]
pub fn int_param(params: &HashMap<String, String>, name: &str, default: u64) -> u64 {
    params
        .get(&name.to_ascii_lowercase())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_case_insensitive() {
        let uri = Url::parse(
            "sqlserver://host:1433/db?Encrypt=true&TrustServerCertificate=false&Connect%20Timeout=30",
        )
        .unwrap();
        let params = query_params(&uri);
        assert!(bool_param(&params, "encrypt", false));
        assert!(!bool_param(&params, "trustservercertificate", true));
        assert_eq!(int_param(&params, "connect timeout", 0), 30);
    }
}
