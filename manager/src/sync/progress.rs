//! One-line progress rendering for the sync monitor.

use std::time::Duration;

use serde::Serialize;

const BAR_WIDTH: usize = 24;

/// What the monitor observed on one tick.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChainSnapshot {
    pub local_height: u64,
    pub remote_height: u64,
    pub catching_up: bool,
    pub peers: usize,
    /// Round trip of the local status call.
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    /// Blocks per second over the sliding window.
    pub rate: f64,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Percentage of `remote` reached by `local`, capped at 100.
pub fn percent(local: u64, remote: u64) -> f64 {
    if remote == 0 {
        return 0.0;
    }
    ((local as f64 / remote as f64) * 100.0).min(100.0)
}

/// Time to close the gap at `rate` blocks per second.
pub fn eta(local: u64, remote: u64, rate: f64) -> Option<Duration> {
    if rate <= 0.0 || remote <= local {
        return None;
    }
    Some(Duration::from_secs(((remote - local) as f64 / rate).ceil() as u64))
}

/// `1234567` -> `1,234,567`
pub fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn bar(pct: f64) -> String {
    let filled = ((pct / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

fn eta_text(eta: Option<Duration>) -> String {
    match eta {
        Some(d) => humantime::format_duration(d).to_string(),
        None => "--".to_string(),
    }
}

/// Progress line for one tick.
pub fn render(snap: &ChainSnapshot, pct: f64, compact: bool) -> String {
    let eta = eta(snap.local_height, snap.remote_height, snap.rate);
    if compact {
        return format!(
            "{pct:5.1}% {}/{} {:.1} blk/s ETA {}",
            snap.local_height,
            snap.remote_height,
            snap.rate,
            eta_text(eta)
        );
    }
    format!(
        "Syncing {} {pct:5.1}%  {} / {}  {:.1} blk/s  ETA {}  peers {}  rtt {}ms",
        bar(pct),
        group_digits(snap.local_height),
        group_digits(snap.remote_height),
        snap.rate,
        eta_text(eta),
        snap.peers,
        snap.latency.as_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_grouping() {
        assert_eq!(group_digits(0), "0");
        assert_eq!(group_digits(999), "999");
        assert_eq!(group_digits(1000), "1,000");
        assert_eq!(group_digits(1234567), "1,234,567");
    }

    #[test]
    fn percent_and_eta() {
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(300, 200), 100.0);
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(eta(100, 200, 10.0), Some(Duration::from_secs(10)));
        assert_eq!(eta(200, 200, 10.0), None);
        assert_eq!(eta(100, 200, 0.0), None);
    }

    #[test]
    fn compact_line_is_short() {
        let snap = ChainSnapshot {
            local_height: 150,
            remote_height: 200,
            rate: 5.0,
            ..ChainSnapshot::default()
        };
        assert_eq!(render(&snap, 75.0, true), " 75.0% 150/200 5.0 blk/s ETA 10s");
        let full = render(&snap, 75.0, false);
        assert!(full.contains("[##################------]"));
        assert!(full.contains("150 / 200"));
    }
}
