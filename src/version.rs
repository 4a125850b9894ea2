use std::sync::OnceLock;

use regex::Regex;

fn version_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"\d+(\.\d+)*[a-zA-Z0-9]*").expect("version token pattern must compile")
    })
}

/// Strips distribution metadata from a scanner-reported version, keeping the
/// leading dotted number and its alphanumeric suffix ("7.4p1 Debian 10" ->
/// "7.4p1"). Versions without any digit are returned unchanged.
pub fn clean_version(version: &str) -> &str {
    version_token()
        .find(version)
        .map(|m| m.as_str())
        .unwrap_or(version)
}

/// Free-text search term for a product/version pair.
pub fn keyword(product: &str, version: &str) -> String {
    format!("{} {}", product, clean_version(version))
}
