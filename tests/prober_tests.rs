use edge_scan_rs::error::ScanError;
use edge_scan_rs::orchestrator::PhaseCounters;
use edge_scan_rs::prober::{probe_candidates, probe_one};
use edge_scan_rs::types::{Candidate, CandidateSource};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn candidate(ip: IpAddr) -> Candidate {
    Candidate {
        ip,
        source: CandidateSource::Range("127.0.0.0/8".into()),
    }
}

/// Bind an ephemeral port and release it so nothing is listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn one_result_per_candidate_with_reachability_split() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // 127.0.0.1 has a listener on `port`; 127.0.0.2 refuses the connection.
    let candidates = vec![
        candidate(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        candidate(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))),
    ];

    let counters = PhaseCounters::default();
    let results = probe_candidates(
        &candidates,
        port,
        Duration::from_millis(500),
        8,
        CancellationToken::new(),
        counters.clone(),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), candidates.len());
    let reachable: Vec<_> = results.iter().filter(|r| r.reachable).collect();
    assert_eq!(reachable.len(), 1);
    assert_eq!(reachable[0].candidate.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert!(reachable[0].latency_ms.is_some());

    let unreachable = results.iter().find(|r| !r.reachable).unwrap();
    assert!(unreachable.latency_ms.is_none());

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.attempted, 2);
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.failed, 1);
}

#[tokio::test]
async fn zero_reachable_candidates_is_a_probe_error() {
    let port = closed_port().await;
    let candidates = vec![
        candidate(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))),
        candidate(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3))),
    ];

    let err = probe_candidates(
        &candidates,
        port,
        Duration::from_millis(500),
        8,
        CancellationToken::new(),
        PhaseCounters::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ScanError::Probe(_)));
}

#[tokio::test]
async fn cancelled_probing_returns_partial_results_without_error() {
    let port = closed_port().await;
    let candidates: Vec<_> = (1..=50)
        .map(|octet| candidate(IpAddr::V4(Ipv4Addr::new(127, 0, 1, octet))))
        .collect();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let results = probe_candidates(
        &candidates,
        port,
        Duration::from_millis(500),
        4,
        cancel,
        PhaseCounters::default(),
    )
    .await
    .unwrap();

    // Submission stops at the cancellation point; nothing errors.
    assert!(results.len() <= candidates.len());
    assert!(results.iter().all(|r| !r.reachable));
}

#[tokio::test]
async fn probe_one_reports_unreachable() {
    let port = closed_port().await;
    let result = probe_one(
        candidate(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))),
        port,
        Duration::from_millis(500),
    )
    .await;
    assert!(!result.reachable);
    assert!(result.latency_ms.is_none());
}

#[tokio::test]
async fn probe_one_measures_latency_on_success() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let result = probe_one(
        candidate(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        port,
        Duration::from_millis(500),
    )
    .await;
    assert!(result.reachable);
    assert!(result.latency_ms.is_some());
}
