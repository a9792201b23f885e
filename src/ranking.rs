use crate::operators;
use crate::types::{now_rfc3339, RankedResult, ResultSnapshot, SpeedResult};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::IpAddr;

/// Produce the ranked view of successful results: deduplicated by IP (best
/// record wins), ordered by download speed descending with latency ascending
/// as the tie-break. The order is a total order recomputed from scratch, so
/// it does not depend on arrival order and re-running it is idempotent.
pub fn rank_results(results: &[SpeedResult]) -> Vec<RankedResult> {
    let mut best: HashMap<IpAddr, &SpeedResult> = HashMap::new();
    for result in results.iter().filter(|r| r.success) {
        let entry = best.entry(result.ip).or_insert(result);
        if compare(result, entry) == Ordering::Less {
            *entry = result;
        }
    }

    let mut ordered: Vec<&SpeedResult> = best.into_values().collect();
    ordered.sort_by(|a, b| compare(a, b));
    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, result)| RankedResult {
            rank: idx + 1,
            ip: result.ip,
            speed_mbps: result.speed_mbps.unwrap_or(0.0),
            latency_ms: result.latency_ms.unwrap_or(0),
            operator: operators::classify(result.ip).to_string(),
            success: true,
        })
        .collect()
}

/// Snapshot for export: the ranked view plus every raw record for diagnostics.
pub fn snapshot(results: &[SpeedResult]) -> ResultSnapshot {
    ResultSnapshot {
        generated_at: now_rfc3339(),
        ranked: rank_results(results),
        raw: results.to_vec(),
    }
}

// Faster-first ordering; the final IP comparison makes the order total so two
// records never compare equal unless they are the same measurement.
fn compare(a: &SpeedResult, b: &SpeedResult) -> Ordering {
    let a_speed = a.speed_mbps.unwrap_or(0.0);
    let b_speed = b.speed_mbps.unwrap_or(0.0);
    b_speed
        .total_cmp(&a_speed)
        .then_with(|| {
            a.latency_ms
                .unwrap_or(u64::MAX)
                .cmp(&b.latency_ms.unwrap_or(u64::MAX))
        })
        .then_with(|| a.ip.cmp(&b.ip))
}
