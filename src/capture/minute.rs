//! Minute-boundary writer.
//!
//! Aggregates in-order samples into a preallocated one-minute vector,
//! zero-fills gaps, and closes the archive when the RTP-derived cursor
//! crosses the next minute boundary. Only the RTP clock drives sample
//! position; the sample count is never adjusted to match wall clock.

use std::sync::Arc;

use num_complex::Complex32;
use tracing::{debug, info, warn};

use crate::capture::archive::{MinuteArchive, TONE_POWER_SENTINEL};
use crate::capture::resequencer::rtp_diff;
use crate::config::ChannelConfig;
use crate::timing::ntp::{system_unix_time, NtpCache};
use crate::timing::time_snap::{TimeSnap, TonePowers};

/// One recorded fill inside the current minute.
#[derive(Debug, Clone, Copy)]
struct GapEntry {
    rtp: u32,
    sample_index: u32,
    samples_filled: u32,
    packets_lost: u32,
}

pub struct MinuteWriter {
    channel: ChannelConfig,
    ntp: Arc<NtpCache>,
    anchor: TimeSnap,
    /// Anchor correction staged for the next minute open; applying it
    /// mid-minute would make the write cursor jump.
    pending_anchor: Option<TimeSnap>,
    tone_powers: TonePowers,
    /// Samples per minute (`sample_rate * 60`).
    spm: usize,
    boundary_utc: Option<f64>,
    boundary_rtp: u32,
    buffer: Vec<Complex32>,
    samples_written: u32,
    /// One past the highest index written so far.
    cursor: usize,
    packets_received: u32,
    packet_counted: bool,
    samples_per_packet: Option<u32>,
    gap_entries: Vec<GapEntry>,
}

impl MinuteWriter {
    pub fn new(channel: ChannelConfig, ntp: Arc<NtpCache>, anchor: TimeSnap) -> Self {
        let spm = channel.sample_rate as usize * 60;
        Self {
            channel,
            ntp,
            anchor,
            pending_anchor: None,
            tone_powers: TonePowers::default(),
            spm,
            boundary_utc: None,
            boundary_rtp: 0,
            buffer: vec![Complex32::new(0.0, 0.0); spm],
            samples_written: 0,
            cursor: 0,
            packets_received: 0,
            packet_counted: false,
            samples_per_packet: None,
            gap_entries: Vec::new(),
        }
    }

    pub fn anchor(&self) -> &TimeSnap {
        &self.anchor
    }

    pub fn is_open(&self) -> bool {
        self.boundary_utc.is_some()
    }

    /// Latest detector output, stamped into archives at close.
    pub fn set_tone_powers(&mut self, powers: TonePowers) {
        self.tone_powers = powers;
    }

    /// Stage an anchor correction; it takes effect at the next minute open.
    pub fn update_anchor(&mut self, anchor: TimeSnap) {
        if self.is_open() {
            self.pending_anchor = Some(anchor);
        } else {
            self.anchor = anchor;
        }
    }

    /// Replace the anchor immediately (restart re-arm, nothing open).
    pub fn reset_anchor(&mut self, anchor: TimeSnap) {
        debug_assert!(!self.is_open());
        self.anchor = anchor;
        self.pending_anchor = None;
    }

    /// Feed one packet's worth of in-order samples. Closed minutes are
    /// appended to `out`.
    pub fn handle_samples(&mut self, rtp: u32, data: &[Complex32], out: &mut Vec<MinuteArchive>) {
        if data.is_empty() {
            return;
        }
        if self.samples_per_packet.is_none() {
            self.samples_per_packet = Some(data.len() as u32);
        }

        let sr = self.channel.sample_rate as f64;
        if self.boundary_utc.is_none() {
            // ARMED: wait for the first chunk that crosses a minute boundary
            let utc_start = self.anchor.utc_of(rtp);
            let next = (utc_start / 60.0).ceil() * 60.0;
            let end = utc_start + data.len() as f64 / sr;
            if end <= next {
                return;
            }
            self.open_minute(next);
            info!(
                channel = %self.channel.description,
                minute_utc = next,
                "recording started"
            );
        }

        self.packet_counted = false;
        let mut offset = 0usize;
        while offset < data.len() {
            let rtp_here = rtp.wrapping_add(offset as u32);
            let idx = rtp_diff(self.boundary_rtp, rtp_here);
            let remaining = data.len() - offset;

            if idx >= self.spm as i64 {
                self.roll(out);
                continue;
            }
            if idx + remaining as i64 <= 0 {
                // Entirely before the open minute: stale data
                debug!(rtp, "samples before open minute dropped");
                return;
            }

            let skip = if idx < 0 { (-idx) as usize } else { 0 };
            let write_idx = (idx + skip as i64) as usize;
            let n = (remaining - skip).min(self.spm - write_idx);
            if n == 0 {
                return;
            }
            self.buffer[write_idx..write_idx + n]
                .copy_from_slice(&data[offset + skip..offset + skip + n]);
            self.samples_written += n as u32;
            self.cursor = self.cursor.max(write_idx + n);
            if !self.packet_counted {
                self.packets_received += 1;
                self.packet_counted = true;
            }
            offset += skip + n;
        }
    }

    /// Record a resequencer gap; the buffer is pre-zeroed, so this only
    /// writes provenance. Fills crossing a minute boundary are split.
    pub fn handle_gap(
        &mut self,
        rtp_fill_start: u32,
        missing: u32,
        packets_lost: u32,
        out: &mut Vec<MinuteArchive>,
    ) {
        if self.boundary_utc.is_none() {
            return;
        }
        let mut remaining = missing as usize;
        let mut rtp_cur = rtp_fill_start;
        let mut lost = packets_lost;
        while remaining > 0 {
            let idx = rtp_diff(self.boundary_rtp, rtp_cur);
            if idx >= self.spm as i64 {
                self.roll(out);
                continue;
            }
            if idx + remaining as i64 <= 0 {
                return;
            }
            let skip = if idx < 0 { (-idx) as usize } else { 0 };
            let begin = (idx + skip as i64) as usize;
            let n = (remaining - skip).min(self.spm - begin);
            if n == 0 {
                return;
            }
            self.gap_entries.push(GapEntry {
                rtp: rtp_cur.wrapping_add(skip as u32),
                sample_index: begin as u32,
                samples_filled: n as u32,
                packets_lost: lost,
            });
            lost = 0;
            self.cursor = self.cursor.max(begin + n);
            rtp_cur = rtp_cur.wrapping_add((skip + n) as u32);
            remaining -= skip + n;
        }
    }

    /// Close the in-progress minute with the remainder zero-filled
    /// (stream restart or shutdown). Returns nothing if no real samples
    /// had landed yet.
    pub fn close_partial(&mut self, out: &mut Vec<MinuteArchive>) {
        if !self.is_open() {
            return;
        }
        if self.samples_written == 0 {
            // Nothing worth keeping
            self.boundary_utc = None;
            self.reset_minute_state();
            return;
        }
        warn!(
            channel = %self.channel.description,
            written = self.samples_written,
            "closing partial minute"
        );
        let archive = self.close_minute();
        out.push(archive);
        self.boundary_utc = None;
    }

    fn roll(&mut self, out: &mut Vec<MinuteArchive>) {
        let closed_utc = self.boundary_utc.unwrap_or(0.0);
        let archive = self.close_minute();
        out.push(archive);
        self.open_minute(closed_utc + 60.0);
    }

    fn open_minute(&mut self, minute_utc: f64) {
        if let Some(a) = self.pending_anchor.take() {
            self.anchor = a;
        }
        self.boundary_utc = Some(minute_utc);
        self.boundary_rtp = self.anchor.rtp_of(minute_utc);
        self.reset_minute_state();
    }

    fn reset_minute_state(&mut self) {
        self.buffer.iter_mut().for_each(|z| *z = Complex32::new(0.0, 0.0));
        self.samples_written = 0;
        self.cursor = 0;
        self.packets_received = 0;
        self.packet_counted = false;
        self.gap_entries.clear();
    }

    fn close_minute(&mut self) -> MinuteArchive {
        let boundary_utc = self.boundary_utc.unwrap_or(0.0);
        let spp = self.samples_per_packet.unwrap_or(0);

        let mut gap_entries = std::mem::take(&mut self.gap_entries);
        // Anything neither received nor covered by a recorded gap is a
        // trailing/unaccounted fill; record it so provenance closes.
        let accounted: u32 =
            self.samples_written + gap_entries.iter().map(|g| g.samples_filled).sum::<u32>();
        if (accounted as usize) < self.spm {
            let missing = self.spm as u32 - accounted;
            let tail_index = self.cursor as u32;
            gap_entries.push(GapEntry {
                rtp: self.boundary_rtp.wrapping_add(tail_index),
                sample_index: tail_index,
                samples_filled: missing,
                packets_lost: if spp > 0 { missing.div_ceil(spp) } else { 0 },
            });
        }

        let gaps_filled: u32 = gap_entries.iter().map(|g| g.samples_filled).sum();
        let packets_expected = if spp > 0 {
            (self.spm as u32).div_ceil(spp)
        } else {
            self.packets_received
        };

        let ntp = self.ntp.snapshot();
        let iq = std::mem::replace(
            &mut self.buffer,
            vec![Complex32::new(0.0, 0.0); self.spm],
        );

        let archive = MinuteArchive {
            iq,
            rtp_timestamp: self.boundary_rtp,
            rtp_ssrc: self.channel.ssrc,
            sample_rate: self.channel.sample_rate,
            frequency_hz: self.channel.frequency_hz,
            channel_name: self.channel.description.clone(),
            unix_timestamp: boundary_utc,
            time_snap_rtp: self.anchor.rtp_anchor,
            time_snap_utc: self.anchor.utc_anchor,
            time_snap_source: self.anchor.source.as_str().to_string(),
            time_snap_confidence: self.anchor.confidence,
            time_snap_station: self.anchor.source.station_label().to_string(),
            tone_power_1000_hz_db: self
                .tone_powers
                .power_1000_db
                .unwrap_or(TONE_POWER_SENTINEL),
            tone_power_1200_hz_db: self
                .tone_powers
                .power_1200_db
                .unwrap_or(TONE_POWER_SENTINEL),
            wwvh_differential_delay_ms: self.tone_powers.differential_delay_ms,
            // Independent wall-clock reference; never derived from the
            // RTP-based unix_timestamp above.
            ntp_wall_clock_time: ntp.corrected_unix_time(),
            ntp_offset_ms: ntp.offset_ms,
            gaps_count: gap_entries.len() as u32,
            gaps_filled,
            packets_received: self.packets_received,
            packets_expected,
            gap_rtp_timestamps: gap_entries.iter().map(|g| g.rtp).collect(),
            gap_sample_indices: gap_entries.iter().map(|g| g.sample_index).collect(),
            gap_samples_filled: gap_entries.iter().map(|g| g.samples_filled).collect(),
            gap_packets_lost: gap_entries.iter().map(|g| g.packets_lost).collect(),
            recorder_version: env!("CARGO_PKG_VERSION").to_string(),
            created_timestamp: system_unix_time(),
        };

        debug!(
            channel = %self.channel.description,
            minute = boundary_utc,
            completeness = archive.completeness_pct(),
            gaps = archive.gaps_count,
            "minute closed"
        );

        self.reset_minute_state();
        archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::time_snap::TimeSnapSource;

    const SR: u32 = 16000;
    const SPP: usize = 320;
    const SPM: usize = (SR as usize) * 60;

    fn channel() -> ChannelConfig {
        ChannelConfig {
            ssrc: 5_000_000,
            frequency_hz: 10_000_000.0,
            sample_rate: SR,
            description: "WWV 10 MHz".into(),
        }
    }

    fn anchor(rtp: u32, utc: f64) -> TimeSnap {
        TimeSnap {
            rtp_anchor: rtp,
            utc_anchor: utc,
            source: TimeSnapSource::Wwv,
            confidence: 0.95,
            sample_rate: SR,
        }
    }

    fn writer() -> MinuteWriter {
        // Anchor: rtp 0 is exactly a minute boundary
        MinuteWriter::new(channel(), Arc::new(NtpCache::new()), anchor(0, 1_700_000_040.0))
    }

    fn feed_packets(
        w: &mut MinuteWriter,
        start_rtp: u32,
        count: usize,
        out: &mut Vec<MinuteArchive>,
    ) {
        let payload = vec![Complex32::new(0.5, -0.5); SPP];
        for p in 0..count {
            let rtp = start_rtp.wrapping_add((p * SPP) as u32);
            w.handle_samples(rtp, &payload, out);
        }
    }

    #[test]
    fn test_clean_two_minutes() {
        let mut w = writer();
        let mut out = Vec::new();
        // Two full minutes plus one extra packet to trigger the final close
        feed_packets(&mut w, 0, 2 * SPM / SPP + 1, &mut out);
        assert_eq!(out.len(), 2);
        for (i, a) in out.iter().enumerate() {
            assert_eq!(a.iq.len(), SPM);
            assert_eq!(a.gaps_count, 0);
            assert_eq!(a.gaps_filled, 0);
            assert_eq!(a.packets_received as usize, SPM / SPP);
            assert_eq!(a.packets_expected as usize, SPM / SPP);
            assert_eq!(a.unix_timestamp, 1_700_000_040.0 + 60.0 * i as f64);
            assert_eq!(a.rtp_timestamp, (i * SPM) as u32);
            assert_eq!(a.time_snap_source, "wwv");
            assert!((a.completeness_pct() - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_single_drop_gap_filled() {
        let mut w = writer();
        let mut out = Vec::new();
        // First half of the minute
        feed_packets(&mut w, 0, 100, &mut out);
        // One packet lost: resequencer reports the fill
        w.handle_gap((100 * SPP) as u32, SPP as u32, 1, &mut out);
        // Rest of the minute starting after the hole, plus one packet into
        // the next minute to close it
        feed_packets(&mut w, (101 * SPP) as u32, SPM / SPP - 101 + 1, &mut out);

        assert_eq!(out.len(), 1);
        let a = &out[0];
        assert_eq!(a.gaps_count, 1);
        assert_eq!(a.gaps_filled as usize, SPP);
        assert_eq!(a.gap_sample_indices, vec![(100 * SPP) as u32]);
        assert_eq!(a.gap_packets_lost, vec![1]);
        // The filled range is zeros
        let g = (100 * SPP) as usize;
        assert!(a.iq[g..g + SPP].iter().all(|z| z.re == 0.0 && z.im == 0.0));
        // Provenance closure
        let spp = SPP as u32;
        assert_eq!(a.gaps_filled + a.packets_received * spp, SPM as u32);
    }

    #[test]
    fn test_rtp_wrap_mid_minute() {
        // Anchor the minute so the RTP counter wraps inside it
        let wrap_start = u32::MAX - (30 * SR) + 1; // 30 s before wrap
        let mut w = MinuteWriter::new(
            channel(),
            Arc::new(NtpCache::new()),
            anchor(wrap_start, 1_700_000_040.0),
        );
        let mut out = Vec::new();
        feed_packets(&mut w, wrap_start, SPM / SPP + 1, &mut out);
        assert_eq!(out.len(), 1);
        let a = &out[0];
        assert_eq!(a.iq.len(), SPM);
        assert_eq!(a.gaps_count, 0);
        assert_eq!(a.rtp_timestamp, wrap_start);
    }

    #[test]
    fn test_partial_close_zero_fills_tail() {
        let mut w = writer();
        let mut out = Vec::new();
        // 15 seconds into the minute, then a restart forces a close
        feed_packets(&mut w, 0, (15 * SR as usize) / SPP, &mut out);
        assert!(out.is_empty());
        w.close_partial(&mut out);
        assert_eq!(out.len(), 1);
        let a = &out[0];
        assert_eq!(a.iq.len(), SPM);
        assert_eq!(a.gaps_count, 1);
        let expected_fill = (SPM - 15 * SR as usize) as u32;
        assert_eq!(a.gaps_filled, expected_fill);
        assert!((a.completeness_pct() - 25.0).abs() < 1e-6);
        assert!(!w.is_open());
    }

    #[test]
    fn test_waits_for_minute_boundary() {
        let mut w = writer();
        let mut out = Vec::new();
        // Samples 30 s before the boundary: dropped while ARMED
        let pre_rtp = 0u32.wrapping_sub(30 * SR);
        feed_packets(&mut w, pre_rtp, 10, &mut out);
        assert!(!w.is_open());
        // Crossing the boundary opens the minute at index 0
        feed_packets(&mut w, 0u32.wrapping_sub(SPP as u32 / 2), 2, &mut out);
        assert!(w.is_open());
        assert_eq!(w.samples_written as usize, SPP + SPP / 2);
    }

    #[test]
    fn test_two_time_bases_are_independent() {
        let ntp = Arc::new(NtpCache::new());
        ntp.store(25.0, true);
        let mut w = MinuteWriter::new(channel(), ntp, anchor(0, 1_700_000_040.0));
        let mut out = Vec::new();
        feed_packets(&mut w, 0, SPM / SPP + 1, &mut out);
        let a = &out[0];
        // unix_timestamp comes from the anchor; ntp_wall_clock_time from
        // the wall clock. With a synthetic anchor far in the past the two
        // must disagree wildly.
        assert_eq!(a.unix_timestamp, 1_700_000_040.0);
        assert!((a.ntp_wall_clock_time - a.unix_timestamp).abs() > 1.0);
        assert_eq!(a.ntp_offset_ms, 25.0);
    }

    #[test]
    fn test_anchor_correction_applies_next_minute() {
        let mut w = writer();
        let mut out = Vec::new();
        feed_packets(&mut w, 0, 100, &mut out);
        // Correction of +100 samples (6.25 ms) staged mid-minute
        let mut corrected = *w.anchor();
        corrected.rtp_anchor = corrected.rtp_anchor.wrapping_add(100);
        w.update_anchor(corrected);
        // Current minute still uses the old boundary
        feed_packets(&mut w, (100 * SPP) as u32, SPM / SPP - 100 + 1, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rtp_timestamp, 0);
        assert_eq!(out[0].time_snap_rtp, 0);
        // The new minute's boundary reflects the corrected anchor
        assert_eq!(w.anchor().rtp_anchor, 100);
    }
}
