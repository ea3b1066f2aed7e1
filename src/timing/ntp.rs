//! Centralized NTP offset cache.
//!
//! Querying the OS clock-discipline daemon costs on the order of a second,
//! so it must never happen on a per-channel write path. One control loop
//! refreshes this cache every 10 seconds; writers take a snapshot under a
//! short lock.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Refresh period for the cache.
pub const NTP_REFRESH: Duration = Duration::from_secs(10);

/// Immutable snapshot handed to readers.
#[derive(Debug, Clone, Copy)]
pub struct NtpSnapshot {
    /// System clock offset from NTP in milliseconds (positive: system fast).
    pub offset_ms: f64,
    /// Whether the OS clock is currently disciplined.
    pub synced: bool,
    /// When the snapshot was last refreshed.
    pub last_update: Option<Instant>,
}

impl NtpSnapshot {
    /// Wall-clock UTC seconds corrected by the cached offset.
    pub fn corrected_unix_time(&self) -> f64 {
        system_unix_time() - self.offset_ms / 1000.0
    }
}

/// Current system wall clock as UNIX seconds.
pub fn system_unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Process-wide NTP cache.
pub struct NtpCache {
    state: RwLock<NtpSnapshot>,
}

impl Default for NtpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NtpCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(NtpSnapshot {
                offset_ms: 0.0,
                synced: false,
                last_update: None,
            }),
        }
    }

    /// Snapshot for readers; never blocks on the subsystem call.
    pub fn snapshot(&self) -> NtpSnapshot {
        *self.state.read()
    }

    /// Overwrite the cache (refresher and tests).
    pub fn store(&self, offset_ms: f64, synced: bool) {
        let mut s = self.state.write();
        s.offset_ms = offset_ms;
        s.synced = synced;
        s.last_update = Some(Instant::now());
    }

    /// One refresh from the OS clock-discipline interface.
    pub fn refresh_once(&self) {
        match query_clock_daemon() {
            Some((offset_ms, synced)) => {
                debug!(offset_ms, synced, "ntp cache refreshed");
                self.store(offset_ms, synced);
            }
            None => {
                warn!("no NTP daemon reachable, cache marked unsynced");
                let mut s = self.state.write();
                s.synced = false;
                s.last_update = Some(Instant::now());
            }
        }
    }

    /// Spawn the refresh loop on the tokio control plane.
    pub fn spawn_refresher(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(NTP_REFRESH);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let c = cache.clone();
                // The subprocess call can take ~1 s; keep it off the runtime
                let _ = tokio::task::spawn_blocking(move || c.refresh_once()).await;
            }
            info!("ntp refresher stopped");
        })
    }
}

/// Query chrony first, then ntpd. Returns (offset_ms, synced).
fn query_clock_daemon() -> Option<(f64, bool)> {
    if let Some(r) = query_chronyc() {
        return Some(r);
    }
    query_ntpq()
}

fn query_chronyc() -> Option<(f64, bool)> {
    let out = Command::new("chronyc").arg("tracking").output().ok()?;
    if !out.status.success() {
        return None;
    }
    parse_chronyc_tracking(&String::from_utf8_lossy(&out.stdout))
}

fn query_ntpq() -> Option<(f64, bool)> {
    let out = Command::new("ntpq").args(["-c", "rv"]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    parse_ntpq_rv(&String::from_utf8_lossy(&out.stdout))
}

/// Parse `chronyc tracking` output. The "System time" line reads e.g.
/// `System time     : 0.000013946 seconds slow of NTP time`.
fn parse_chronyc_tracking(text: &str) -> Option<(f64, bool)> {
    let mut offset_ms = None;
    let mut synced = false;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("System time") {
            let rest = rest.trim_start_matches([' ', ':']).trim();
            let mut parts = rest.split_whitespace();
            let value: f64 = parts.next()?.parse().ok()?;
            let sign = if rest.contains("fast") { 1.0 } else { -1.0 };
            offset_ms = Some(sign * value * 1000.0);
        } else if let Some(rest) = line.strip_prefix("Leap status") {
            let status = rest.trim_start_matches([' ', ':']).trim();
            synced = status == "Normal";
        }
    }
    offset_ms.map(|o| (o, synced))
}

/// Parse `ntpq -c rv` output: `offset` is in milliseconds.
fn parse_ntpq_rv(text: &str) -> Option<(f64, bool)> {
    let mut offset_ms = None;
    let mut synced = false;
    for item in text.split(',') {
        let item = item.trim();
        if let Some(v) = item.strip_prefix("offset=") {
            offset_ms = v.parse::<f64>().ok();
        }
        if item.contains("sync_ntp") || item.contains("leap_none") {
            synced = true;
        }
    }
    offset_ms.map(|o| (o, synced))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chronyc_slow() {
        let text = "\
Reference ID    : C0A80001 (gateway)
Stratum         : 3
System time     : 0.000013946 seconds slow of NTP time
Last offset     : -0.000001210 seconds
Leap status     : Normal
";
        let (offset_ms, synced) = parse_chronyc_tracking(text).unwrap();
        assert!((offset_ms + 0.013946).abs() < 1e-6);
        assert!(synced);
    }

    #[test]
    fn test_parse_chronyc_fast_unsynced() {
        let text = "\
System time     : 0.250000000 seconds fast of NTP time
Leap status     : Not synchronised
";
        let (offset_ms, synced) = parse_chronyc_tracking(text).unwrap();
        assert!((offset_ms - 250.0).abs() < 1e-6);
        assert!(!synced);
    }

    #[test]
    fn test_parse_ntpq() {
        let text = "associd=0 status=0615 leap_none, sync_ntp, 1 event, clock_sync,
version=\"ntpd 4.2.8\", offset=-0.188, frequency=4.226";
        let (offset_ms, synced) = parse_ntpq_rv(text).unwrap();
        assert!((offset_ms + 0.188).abs() < 1e-9);
        assert!(synced);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let cache = NtpCache::new();
        assert!(!cache.snapshot().synced);
        cache.store(12.5, true);
        let snap = cache.snapshot();
        assert_eq!(snap.offset_ms, 12.5);
        assert!(snap.synced);
        assert!(snap.last_update.is_some());
    }
}
