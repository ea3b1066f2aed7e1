//! Per-channel packet resequencer.
//!
//! Reorders packets in a small sequence-number window, detects gaps and
//! computes fill sizes from RTP timestamps. All RTP timestamp arithmetic is
//! signed 32-bit: a one-sample backward jump is a duplicate, never a ~4 GiB
//! forward fill.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

/// Maximum packets held for reordering before the gap is flushed.
const REORDER_WINDOW_PACKETS: usize = 32;

/// Maximum time a gap stays open waiting for late packets.
const REORDER_TIMEOUT: Duration = Duration::from_millis(200);

/// Signed 16-bit sequence difference (wrap-aware).
pub fn seq_diff(a: u16, b: u16) -> i32 {
    b.wrapping_sub(a) as i16 as i32
}

/// Signed 32-bit RTP timestamp difference (wrap-aware).
pub fn rtp_diff(a: u32, b: u32) -> i64 {
    b.wrapping_sub(a) as i32 as i64
}

/// A raw packet as handed over by the demultiplexer.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub seq: u16,
    pub rtp: u32,
    pub payload: Bytes,
    pub arrived: Instant,
}

impl RawPacket {
    pub fn samples(&self) -> u32 {
        (self.payload.len() / 4) as u32
    }
}

/// Events emitted toward the minute writer, strictly in stream order.
#[derive(Debug)]
pub enum SeqEvent {
    /// In-order payload starting at this RTP timestamp.
    Samples { rtp: u32, payload: Bytes },
    /// Zero-fill of `missing` samples starting at `rtp_fill_start`.
    Gap {
        rtp_before: u32,
        rtp_after: u32,
        rtp_fill_start: u32,
        missing: u32,
        packets_lost: u32,
    },
    /// RTP jumped beyond tolerance; the stream restarted upstream.
    Restart { rtp_before: u32, rtp_after: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResequencerStats {
    pub packets_in_order: u64,
    pub packets_reordered: u64,
    pub packets_late: u64,
    pub packets_duplicate: u64,
    pub gaps: u64,
    pub restarts: u64,
}

pub struct Resequencer {
    /// Extended (unwrapped) sequence of the last emitted packet.
    last_ext: Option<i64>,
    last_seq: u16,
    /// RTP timestamp and sample count of the last emitted packet.
    last_rtp: u32,
    last_samples: u32,
    /// Held out-of-order packets keyed by extended sequence.
    window: BTreeMap<i64, RawPacket>,
    stats: ResequencerStats,
}

impl Default for Resequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Resequencer {
    pub fn new() -> Self {
        Self {
            last_ext: None,
            last_seq: 0,
            last_rtp: 0,
            last_samples: 0,
            window: BTreeMap::new(),
            stats: ResequencerStats::default(),
        }
    }

    pub fn stats(&self) -> ResequencerStats {
        self.stats
    }

    /// Reset after a stream restart; the next packet starts a new run.
    pub fn reset(&mut self) {
        self.last_ext = None;
        self.window.clear();
    }

    /// Feed one packet; returns stream-ordered events.
    pub fn push(&mut self, pkt: RawPacket) -> Vec<SeqEvent> {
        let mut events = Vec::new();

        let last_ext = match self.last_ext {
            None => {
                // First packet of a run
                self.emit(&mut events, pkt);
                self.drain_window(&mut events);
                return events;
            }
            Some(e) => e,
        };

        let ext = last_ext + seq_diff(self.last_seq, pkt.seq) as i64;

        if ext <= last_ext {
            if ext == last_ext {
                self.stats.packets_duplicate += 1;
            } else {
                self.stats.packets_late += 1;
                debug!(seq = pkt.seq, "late packet dropped");
            }
            return events;
        }

        if ext == last_ext + 1 {
            self.emit_checked(&mut events, pkt);
            self.drain_window(&mut events);
            return events;
        }

        // Out of order: hold for the reorder window
        self.stats.packets_reordered += 1;
        self.window.insert(ext, pkt);
        if self.window.len() >= REORDER_WINDOW_PACKETS {
            self.flush_gap(&mut events);
            self.drain_window(&mut events);
        }
        events
    }

    /// Timer-driven flush: emits a pending gap whose window has aged out.
    pub fn poll(&mut self, now: Instant) -> Vec<SeqEvent> {
        let mut events = Vec::new();
        let expired = self
            .window
            .values()
            .next()
            .map(|p| now.duration_since(p.arrived) >= REORDER_TIMEOUT)
            .unwrap_or(false);
        if expired {
            self.flush_gap(&mut events);
            self.drain_window(&mut events);
        }
        events
    }

    /// Force all held packets out (shutdown drain).
    pub fn flush_all(&mut self) -> Vec<SeqEvent> {
        let mut events = Vec::new();
        while !self.window.is_empty() {
            self.flush_gap(&mut events);
            self.drain_window(&mut events);
        }
        events
    }

    /// Emit the gap up to the earliest held packet, classifying it from the
    /// observed RTP delta.
    fn flush_gap(&mut self, events: &mut Vec<SeqEvent>) {
        let (&first_ext, _) = match self.window.iter().next() {
            Some(e) => e,
            None => return,
        };
        let last_ext = match self.last_ext {
            Some(e) => e,
            None => return,
        };
        let pkt = match self.window.remove(&first_ext) {
            Some(p) => p,
            None => return,
        };

        let packets_lost = (first_ext - last_ext - 1) as u32;
        let spp = self.last_samples.max(pkt.samples()) as i64;
        let expected_missing = packets_lost as i64 * spp;
        let delta = rtp_diff(self.last_rtp, pkt.rtp);
        let observed_missing = delta - self.last_samples as i64;

        // One-packet tolerance: the RTP advance must agree with what the
        // sequence numbering implies, or the stream has restarted upstream.
        let tolerance = spp;
        if (observed_missing - expected_missing).abs() <= tolerance && observed_missing >= 0 {
            if observed_missing > 0 {
                self.stats.gaps += 1;
                events.push(SeqEvent::Gap {
                    rtp_before: self.last_rtp,
                    rtp_after: pkt.rtp,
                    rtp_fill_start: self.last_rtp.wrapping_add(self.last_samples),
                    missing: observed_missing as u32,
                    packets_lost,
                });
            }
            self.emit(events, pkt);
        } else if observed_missing > 0 {
            // Large positive jump: stream restarted upstream
            self.stats.restarts += 1;
            warn!(
                rtp_before = self.last_rtp,
                rtp_after = pkt.rtp,
                jump = observed_missing,
                "rtp jump beyond tolerance, treating as stream restart"
            );
            events.push(SeqEvent::Restart {
                rtp_before: self.last_rtp,
                rtp_after: pkt.rtp,
            });
            self.window.clear();
            self.last_ext = None;
            self.emit(events, pkt);
        } else {
            // Negative beyond tolerance: stale data, ignore
            self.stats.packets_late += 1;
            debug!(
                rtp_before = self.last_rtp,
                rtp_after = pkt.rtp,
                "negative rtp jump, packet ignored"
            );
            // Pretend it was emitted so the window can continue draining
            self.last_ext = Some(first_ext);
            self.last_seq = pkt.seq;
        }
    }

    /// Emit an in-sequence packet, verifying its RTP advance. A packet whose
    /// sequence is consecutive but whose timestamp leaps is still a restart.
    fn emit_checked(&mut self, events: &mut Vec<SeqEvent>, pkt: RawPacket) {
        let delta = rtp_diff(self.last_rtp, pkt.rtp);
        let advance = delta - self.last_samples as i64;
        let tolerance = self.last_samples.max(pkt.samples()) as i64;
        if advance < -tolerance {
            // Old data under a reused sequence number
            self.stats.packets_duplicate += 1;
            debug!(
                rtp_before = self.last_rtp,
                rtp_after = pkt.rtp,
                "consecutive packet with backward rtp, dropped"
            );
            return;
        }
        if advance > tolerance {
            self.stats.restarts += 1;
            warn!(
                rtp_before = self.last_rtp,
                rtp_after = pkt.rtp,
                "consecutive packet with rtp leap, treating as stream restart"
            );
            events.push(SeqEvent::Restart {
                rtp_before: self.last_rtp,
                rtp_after: pkt.rtp,
            });
            self.window.clear();
            self.last_ext = None;
        }
        self.emit(events, pkt);
    }

    fn emit(&mut self, events: &mut Vec<SeqEvent>, pkt: RawPacket) {
        self.stats.packets_in_order += 1;
        let ext = match self.last_ext {
            Some(e) => e + seq_diff(self.last_seq, pkt.seq) as i64,
            None => pkt.seq as i64,
        };
        self.last_ext = Some(ext);
        self.last_seq = pkt.seq;
        self.last_rtp = pkt.rtp;
        self.last_samples = pkt.samples();
        events.push(SeqEvent::Samples {
            rtp: pkt.rtp,
            payload: pkt.payload,
        });
    }

    /// Emit any held packets that are now consecutive.
    fn drain_window(&mut self, events: &mut Vec<SeqEvent>) {
        loop {
            let last_ext = match self.last_ext {
                Some(e) => e,
                None => return,
            };
            let next = last_ext + 1;
            match self.window.remove(&next) {
                Some(pkt) => self.emit_checked(events, pkt),
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPP: u32 = 320; // samples per packet

    fn pkt(seq: u16, rtp: u32) -> RawPacket {
        RawPacket {
            seq,
            rtp,
            payload: Bytes::from(vec![0u8; (SPP * 4) as usize]),
            arrived: Instant::now(),
        }
    }

    fn feed(r: &mut Resequencer, packets: Vec<RawPacket>) -> Vec<SeqEvent> {
        let mut out = Vec::new();
        for p in packets {
            out.extend(r.push(p));
        }
        out
    }

    #[test]
    fn test_in_order_stream() {
        let mut r = Resequencer::new();
        let events = feed(&mut r, (0..10u16).map(|i| pkt(i, i as u32 * SPP)).collect());
        assert_eq!(events.len(), 10);
        assert!(events
            .iter()
            .all(|e| matches!(e, SeqEvent::Samples { .. })));
    }

    #[test]
    fn test_reorder_within_window() {
        let mut r = Resequencer::new();
        let mut events = Vec::new();
        events.extend(r.push(pkt(0, 0)));
        events.extend(r.push(pkt(2, 2 * SPP))); // held
        events.extend(r.push(pkt(1, SPP))); // releases both
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(e, SeqEvent::Samples { .. })));
        assert_eq!(r.stats().gaps, 0);
    }

    #[test]
    fn test_single_drop_fills_one_packet() {
        let mut r = Resequencer::new();
        let mut events = Vec::new();
        events.extend(r.push(pkt(0, 0)));
        events.extend(r.push(pkt(2, 2 * SPP))); // packet 1 lost
        // Age the window out
        let later = Instant::now() + REORDER_TIMEOUT + Duration::from_millis(1);
        events.extend(r.poll(later));

        let gap = events
            .iter()
            .find_map(|e| match e {
                SeqEvent::Gap {
                    missing,
                    packets_lost,
                    rtp_fill_start,
                    ..
                } => Some((*missing, *packets_lost, *rtp_fill_start)),
                _ => None,
            })
            .expect("expected a gap event");
        assert_eq!(gap.0, SPP);
        assert_eq!(gap.1, 1);
        assert_eq!(gap.2, SPP);
    }

    #[test]
    fn test_seq_wrap_without_gap() {
        let mut r = Resequencer::new();
        let events = feed(
            &mut r,
            vec![pkt(65534, 1000), pkt(65535, 1000 + SPP), pkt(0, 1000 + 2 * SPP)],
        );
        assert_eq!(events.len(), 3);
        assert_eq!(r.stats().gaps, 0);
        assert_eq!(r.stats().restarts, 0);
    }

    #[test]
    fn test_seq_wrap_with_gap() {
        let mut r = Resequencer::new();
        let mut events = Vec::new();
        events.extend(r.push(pkt(65535, 1000)));
        events.extend(r.push(pkt(1, 1000 + 2 * SPP))); // packet 0 lost across wrap
        let later = Instant::now() + REORDER_TIMEOUT + Duration::from_millis(1);
        events.extend(r.poll(later));
        assert!(events.iter().any(|e| matches!(
            e,
            SeqEvent::Gap {
                missing,
                packets_lost: 1,
                ..
            } if *missing == SPP
        )));
    }

    #[test]
    fn test_rtp_wrap_is_not_a_fill() {
        let mut r = Resequencer::new();
        let near_wrap = u32::MAX - SPP / 2;
        let mut events = Vec::new();
        events.extend(r.push(pkt(0, near_wrap)));
        events.extend(r.push(pkt(1, near_wrap.wrapping_add(SPP))));
        events.extend(r.push(pkt(2, near_wrap.wrapping_add(2 * SPP))));
        assert_eq!(events.len(), 3);
        assert_eq!(r.stats().gaps, 0);
        assert_eq!(r.stats().restarts, 0);
    }

    #[test]
    fn test_rtp_wrap_with_gap() {
        let mut r = Resequencer::new();
        let near_wrap = u32::MAX - SPP;
        let mut events = Vec::new();
        events.extend(r.push(pkt(0, near_wrap)));
        // Packet 1 lost; packet 2 lands after the wrap
        events.extend(r.push(pkt(2, near_wrap.wrapping_add(2 * SPP))));
        let later = Instant::now() + REORDER_TIMEOUT + Duration::from_millis(1);
        events.extend(r.poll(later));
        assert!(events.iter().any(|e| matches!(
            e,
            SeqEvent::Gap { missing, .. } if *missing == SPP
        )));
        assert_eq!(r.stats().restarts, 0);
    }

    #[test]
    fn test_one_sample_backward_jump_ignored() {
        let mut r = Resequencer::new();
        let mut events = Vec::new();
        events.extend(r.push(pkt(0, 1000)));
        // Duplicate seq with slightly earlier timestamp: dropped
        events.extend(r.push(pkt(0, 999)));
        assert_eq!(events.len(), 1);
        assert_eq!(r.stats().gaps, 0);
    }

    #[test]
    fn test_large_jump_is_restart() {
        let mut r = Resequencer::new();
        let mut events = Vec::new();
        events.extend(r.push(pkt(0, 0)));
        events.extend(r.push(pkt(1, 200_000_000)));
        assert!(events
            .iter()
            .any(|e| matches!(e, SeqEvent::Restart { .. })));
        // The packet after the restart still flows
        assert!(matches!(events.last(), Some(SeqEvent::Samples { .. })));
    }

    #[test]
    fn test_window_overflow_forces_flush() {
        let mut r = Resequencer::new();
        let mut events = Vec::new();
        events.extend(r.push(pkt(0, 0)));
        // Packet 1 lost; stuff the window until it flushes on its own
        for i in 0..REORDER_WINDOW_PACKETS as u16 {
            events.extend(r.push(pkt(2 + i, (2 + i as u32) * SPP)));
        }
        assert!(events.iter().any(|e| matches!(e, SeqEvent::Gap { .. })));
        assert_eq!(r.stats().gaps, 1);
    }
}
