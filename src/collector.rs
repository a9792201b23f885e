use crate::config::{ScanConfiguration, ScanParameters};
use crate::error::ScanError;
use crate::orchestrator::ScanProgress;
use crate::types::{Candidate, CandidateSource};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Collected candidates are capped at `target_ip_count * OVERSAMPLE_FACTOR`
/// so later-phase attrition still leaves enough survivors to rank.
pub const OVERSAMPLE_FACTOR: usize = 4;

const PROVIDER_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Gather unique candidate IPs from the configured providers and ranges,
/// plus the known-good test IP when enabled. Individual source failures are
/// recorded and skipped; an empty overall result is a `CollectionError`.
pub async fn collect_candidates(
    config: &ScanConfiguration,
    params: &ScanParameters,
    cancel: &CancellationToken,
    progress: &ScanProgress,
) -> Result<Vec<Candidate>, ScanError> {
    let counters = &progress.collecting;
    let mut seen: HashSet<IpAddr> = HashSet::new();
    let mut candidates: Vec<Candidate> = Vec::new();

    for provider in &config.providers {
        if cancel.is_cancelled() {
            break;
        }
        counters.add_attempted();
        match resolve_provider(provider).await {
            Ok(ips) if !ips.is_empty() => {
                counters.add_succeeded();
                for ip in ips {
                    if seen.insert(ip) {
                        candidates.push(Candidate {
                            ip,
                            source: CandidateSource::Provider(provider.clone()),
                        });
                    }
                }
            }
            Ok(_) => {
                counters.add_failed();
                progress
                    .push_event(format!("provider {provider} resolved to no IPv4 addresses"))
                    .await;
            }
            Err(err) => {
                counters.add_failed();
                tracing::warn!("provider {provider} failed to resolve: {err}");
                progress
                    .push_event(format!("provider {provider} failed to resolve: {err}"))
                    .await;
            }
        }
    }

    for range in &config.ranges {
        if cancel.is_cancelled() {
            break;
        }
        counters.add_attempted();
        match range.parse::<IpNet>() {
            Ok(net) => {
                counters.add_succeeded();
                for ip in sample_hosts(net) {
                    if seen.insert(ip) {
                        candidates.push(Candidate {
                            ip,
                            source: CandidateSource::Range(range.clone()),
                        });
                    }
                }
            }
            Err(err) => {
                counters.add_failed();
                tracing::warn!("skipping invalid range {range}: {err}");
            }
        }
    }

    let cap = params.target_ip_count.saturating_mul(OVERSAMPLE_FACTOR).max(1);
    if candidates.len() > cap {
        candidates.truncate(cap);
    }

    // The test IP rides along after the cap so it can never be sampled away.
    if config.include_test_ip {
        if let Some(ip) = config.test_ip {
            if seen.insert(ip) {
                candidates.push(Candidate {
                    ip,
                    source: CandidateSource::TestIp,
                });
            }
        }
    }

    if candidates.is_empty() && !cancel.is_cancelled() {
        return Err(ScanError::Collection(
            "no provider or range yielded any candidate IP".into(),
        ));
    }
    Ok(candidates)
}

async fn resolve_provider(host: &str) -> std::io::Result<Vec<IpAddr>> {
    match time::timeout(PROVIDER_RESOLVE_TIMEOUT, lookup_host((host, 443u16))).await {
        Ok(Ok(addrs)) => Ok(addrs.map(|a| a.ip()).filter(IpAddr::is_ipv4).collect()),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "DNS resolution timed out",
        )),
    }
}

/// Expand a CIDR into sampled host addresses.
///
/// Small ranges are taken whole; larger ranges are strided so a /13 does not
/// flood the probe queue: every host up to 256, every 4th up to 4096, every
/// 64th beyond that. IPv6 ranges are not scanned and return an empty list.
pub fn sample_hosts(net: IpNet) -> Vec<IpAddr> {
    match net {
        IpNet::V4(v4) => sample_ipv4_hosts(v4).into_iter().map(IpAddr::V4).collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

fn sample_ipv4_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        // Point-to-point or single-host blocks have no network/broadcast split.
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    if end <= start + 1 {
        return Vec::new();
    }
    let host_count = end - start - 1;
    let stride: usize = if host_count <= 256 {
        1
    } else if host_count <= 4096 {
        4
    } else {
        64
    };
    (start + 1..end).step_by(stride).map(Ipv4Addr::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanParameters;
    use std::path::PathBuf;

    fn config_with_ranges(ranges: Vec<String>) -> ScanConfiguration {
        ScanConfiguration {
            uuid: "3fa4f25c-9b2e-4d71-8a53-0c2b6f1de982".into(),
            server_name: "cdn.example.com".into(),
            host_header: "cdn.example.com".into(),
            ws_path: "/".into(),
            vless_port: 443,
            local_socks_port: 1080,
            test_ip: None,
            include_test_ip: false,
            tunnel_binary: PathBuf::from("xray"),
            providers: Vec::new(),
            ranges,
        }
    }

    #[test]
    fn small_range_sampled_whole() {
        let hosts = sample_hosts("192.0.2.0/24".parse().unwrap());
        assert_eq!(hosts.len(), 254);
    }

    #[test]
    fn medium_range_sampled_every_fourth() {
        let hosts = sample_hosts("10.0.0.0/20".parse().unwrap());
        // 4094 hosts, stride 4
        assert_eq!(hosts.len(), 1024);
    }

    #[test]
    fn large_range_sampled_every_64th() {
        let hosts = sample_hosts("10.0.0.0/15".parse().unwrap());
        // 131070 hosts, stride 64
        assert_eq!(hosts.len(), 2048);
    }

    #[test]
    fn tiny_blocks_taken_whole() {
        assert_eq!(sample_hosts("192.0.2.1/32".parse().unwrap()).len(), 1);
        assert_eq!(sample_hosts("192.0.2.0/31".parse().unwrap()).len(), 2);
    }

    #[test]
    fn ipv6_ranges_are_skipped() {
        assert!(sample_hosts("2001:db8::/32".parse().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn ranges_are_deduplicated() {
        let config = config_with_ranges(vec!["192.0.2.0/29".into(), "192.0.2.0/29".into()]);
        let params = ScanParameters {
            target_ip_count: 10,
            ..ScanParameters::STANDARD
        };
        let candidates = collect_candidates(
            &config,
            &params,
            &CancellationToken::new(),
            &ScanProgress::default(),
        )
        .await
        .unwrap();
        assert_eq!(candidates.len(), 6);
    }

    #[tokio::test]
    async fn oversampling_cap_applies() {
        let config = config_with_ranges(vec!["192.0.2.0/24".into()]);
        let params = ScanParameters {
            target_ip_count: 2,
            ..ScanParameters::STANDARD
        };
        let candidates = collect_candidates(
            &config,
            &params,
            &CancellationToken::new(),
            &ScanProgress::default(),
        )
        .await
        .unwrap();
        assert_eq!(candidates.len(), 2 * OVERSAMPLE_FACTOR);
    }

    #[tokio::test]
    async fn test_ip_survives_the_cap() {
        let mut config = config_with_ranges(vec!["192.0.2.0/24".into()]);
        config.test_ip = Some("173.245.49.235".parse().unwrap());
        config.include_test_ip = true;
        let params = ScanParameters {
            target_ip_count: 1,
            ..ScanParameters::STANDARD
        };
        let candidates = collect_candidates(
            &config,
            &params,
            &CancellationToken::new(),
            &ScanProgress::default(),
        )
        .await
        .unwrap();
        let test_ip: IpAddr = "173.245.49.235".parse().unwrap();
        assert!(candidates
            .iter()
            .any(|c| c.ip == test_ip && c.source == CandidateSource::TestIp));
    }

    #[tokio::test]
    async fn empty_sources_are_a_collection_error() {
        let config = config_with_ranges(Vec::new());
        let err = collect_candidates(
            &config,
            &ScanParameters::STANDARD,
            &CancellationToken::new(),
            &ScanProgress::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScanError::Collection(_)));
    }
}
