//! Static operator classification for edge IP ranges.

use ipnet::IpNet;
use once_cell::sync::Lazy;
use std::net::IpAddr;

pub const UNKNOWN_OPERATOR: &str = "UNKNOWN";

/// Labeled edge ranges. Routes through the same allocation tend to share
/// filtering behavior, so the pool label is a useful grouping key in results.
const OPERATOR_RANGES: &[(&str, &str)] = &[
    ("173.245.48.0/20", "CF-LEGACY"),
    ("103.21.244.0/22", "CF-APAC"),
    ("103.22.200.0/22", "CF-APAC"),
    ("103.31.4.0/22", "CF-APAC"),
    ("141.101.64.0/18", "CF-EU"),
    ("108.162.192.0/18", "CF-NA"),
    ("190.93.240.0/20", "CF-LATAM"),
    ("188.114.96.0/20", "CF-EU"),
    ("197.234.240.0/22", "CF-AFR"),
    ("198.41.128.0/17", "CF-NA"),
    ("162.158.0.0/15", "CF-EDGE"),
    ("104.16.0.0/13", "CF-MAIN"),
    ("104.24.0.0/14", "CF-MAIN"),
    ("172.64.0.0/13", "CF-EDGE"),
    ("172.67.0.0/16", "CF-SAAS"),
    ("131.0.72.0/22", "CF-LATAM"),
];

// Built once per process and treated as read-only; longest prefix first so
// the linear scan resolves overlapping ranges to the most specific label.
static RANGE_TABLE: Lazy<Vec<(IpNet, &'static str)>> = Lazy::new(|| {
    let mut table: Vec<(IpNet, &'static str)> = OPERATOR_RANGES
        .iter()
        .filter_map(|(cidr, label)| cidr.parse::<IpNet>().ok().map(|net| (net, *label)))
        .collect();
    table.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
    table
});

/// Map an IP to its operator code; unmatched addresses are `UNKNOWN`.
pub fn classify(ip: IpAddr) -> &'static str {
    RANGE_TABLE
        .iter()
        .find(|(net, _)| net.contains(&ip))
        .map(|(_, label)| *label)
        .unwrap_or(UNKNOWN_OPERATOR)
}

/// Classify textual input; malformed addresses are `UNKNOWN`.
pub fn classify_str(ip: &str) -> &'static str {
    ip.parse::<IpAddr>()
        .map(classify)
        .unwrap_or(UNKNOWN_OPERATOR)
}
