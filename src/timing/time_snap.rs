//! Time-snap: anchoring a channel's RTP clock to UTC.
//!
//! At startup the channel fills a rolling capture buffer and runs a
//! matched-filter search for the station's minute tone. The detected tone
//! rising edge corresponds to second :00 of some UTC minute; the coarse
//! wall clock identifies which minute, the interpolated peak supplies the
//! fine fractional offset. Peak indices are relative to the START of the
//! buffer.

use std::time::Instant;

use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TimeSnapConfig;
use crate::dsp::tone::{detect_tone, ToneDetection, ToneTemplate};
use crate::dsp::{envelope, remove_dc};
use crate::station::Station;
use crate::timing::ntp::NtpSnapshot;

/// Minimum matched-filter SNR for a tone detection, in dB.
pub const TONE_SNR_THRESHOLD_DB: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSnapSource {
    Wwv,
    Chu,
    Wwvh,
    Ntp,
    Wall,
}

impl TimeSnapSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSnapSource::Wwv => "wwv",
            TimeSnapSource::Chu => "chu",
            TimeSnapSource::Wwvh => "wwvh",
            TimeSnapSource::Ntp => "ntp",
            TimeSnapSource::Wall => "wall",
        }
    }

    pub fn station_label(&self) -> &'static str {
        match self {
            TimeSnapSource::Wwv => "WWV",
            TimeSnapSource::Chu => "CHU",
            TimeSnapSource::Wwvh => "WWVH",
            TimeSnapSource::Ntp => "NTP",
            TimeSnapSource::Wall => "WALL",
        }
    }
}

/// The anchor pair mapping one RTP timestamp to one UTC instant, with
/// quality metadata. Anchors are per-channel: every SDR stream has its own
/// RTP origin, so sharing one across channels is never valid.
#[derive(Debug, Clone, Copy)]
pub struct TimeSnap {
    pub rtp_anchor: u32,
    pub utc_anchor: f64,
    pub source: TimeSnapSource,
    pub confidence: f64,
    pub sample_rate: u32,
}

impl TimeSnap {
    /// UTC seconds of an RTP timestamp; wrap-safe within ±2^31 samples.
    pub fn utc_of(&self, rtp: u32) -> f64 {
        let delta = rtp.wrapping_sub(self.rtp_anchor) as i32 as f64;
        self.utc_anchor + delta / self.sample_rate as f64
    }

    /// RTP timestamp of a UTC instant, reduced mod 2^32.
    pub fn rtp_of(&self, utc: f64) -> u32 {
        let delta = ((utc - self.utc_anchor) * self.sample_rate as f64).round() as i64;
        self.rtp_anchor.wrapping_add(delta as u32)
    }
}

/// Tone powers measured during a search. `None` means not detected.
#[derive(Debug, Clone, Copy, Default)]
pub struct TonePowers {
    pub power_1000_db: Option<f64>,
    pub power_1200_db: Option<f64>,
    /// WWVH minus WWV tone arrival, ms; 0 when not simultaneous.
    pub differential_delay_ms: f64,
}

/// Outcome of a successful tone search.
#[derive(Debug, Clone, Copy)]
pub struct ToneSearchResult {
    pub anchor: TimeSnap,
    pub station: Station,
    pub snr_db: f64,
    pub powers: TonePowers,
}

/// Matched-filter tone searcher for one channel.
pub struct ToneSearcher {
    sample_rate: u32,
    /// Stations plausible for this channel's dial frequency.
    stations: Vec<Station>,
    templates: Vec<ToneTemplate>,
}

impl ToneSearcher {
    pub fn new(sample_rate: u32, frequency_hz: f64) -> Self {
        let stations = stations_for_frequency(frequency_hz);
        let templates = stations
            .iter()
            .filter(|s| s.minute_tone_hz() < 0.45 * sample_rate as f64)
            .map(|s| ToneTemplate::new(s.minute_tone_hz(), s.minute_tone_secs(), sample_rate))
            .collect();
        let stations = stations
            .into_iter()
            .filter(|s| s.minute_tone_hz() < 0.45 * sample_rate as f64)
            .collect();
        Self {
            sample_rate,
            stations,
            templates,
        }
    }

    /// Whether the channel bandwidth can carry the minute tones at all
    /// (narrow carrier channels cannot).
    pub fn usable(&self) -> bool {
        !self.stations.is_empty()
    }

    /// Search a capture buffer for the minute tone and establish an anchor.
    ///
    /// `buffer_start_rtp` is the RTP timestamp of `iq[0]`;
    /// `buffer_start_utc` is the coarse wall-clock UTC of that same sample.
    pub fn search(
        &self,
        iq: &[Complex32],
        buffer_start_rtp: u32,
        buffer_start_utc: f64,
    ) -> Option<ToneSearchResult> {
        let mut env = envelope(iq);
        remove_dc(&mut env);

        let detections: Vec<(Station, ToneDetection)> = self
            .stations
            .iter()
            .zip(self.templates.iter())
            .filter_map(|(s, t)| detect_tone(&env, t).map(|d| (*s, d)))
            .collect();

        let (station, best) = detections
            .iter()
            .filter(|(_, d)| d.snr_db >= TONE_SNR_THRESHOLD_DB)
            .max_by(|a, b| {
                a.1.snr_db
                    .partial_cmp(&b.1.snr_db)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()?;

        let anchor = anchor_from_edge(
            best.index,
            buffer_start_rtp,
            buffer_start_utc,
            self.sample_rate,
            station_source(station),
            confidence_from_snr(best.snr_db),
        );

        let powers = self.tone_powers(&detections);
        debug!(
            station = station.name(),
            snr_db = best.snr_db,
            edge = best.index,
            "minute tone located"
        );

        Some(ToneSearchResult {
            anchor,
            station,
            snr_db: best.snr_db,
            powers,
        })
    }

    /// Re-measure tone alignment over a window around an expected minute
    /// edge. `env` must be DC-removed; the returned index is relative to
    /// the window start. Returns the detection only if the tone clears the
    /// SNR gate.
    pub fn measure_alignment(&self, env: &[f32], station: Station) -> Option<ToneDetection> {
        let idx = self.stations.iter().position(|s| *s == station)?;
        let det = detect_tone(env, &self.templates[idx])?;
        (det.snr_db >= TONE_SNR_THRESHOLD_DB).then_some(det)
    }

    fn tone_powers(&self, detections: &[(Station, ToneDetection)]) -> TonePowers {
        let mut powers = TonePowers::default();
        let mut idx_1000 = None;
        let mut idx_1200 = None;
        for (station, det) in detections {
            let db = 20.0 * (det.peak as f64).max(1e-12).log10();
            match station {
                Station::Wwv | Station::Chu => {
                    if det.snr_db >= TONE_SNR_THRESHOLD_DB {
                        powers.power_1000_db = Some(db);
                        idx_1000 = Some(det.index);
                    }
                }
                Station::Wwvh => {
                    if det.snr_db >= TONE_SNR_THRESHOLD_DB {
                        powers.power_1200_db = Some(db);
                        idx_1200 = Some(det.index);
                    }
                }
            }
        }
        // Simultaneous reception: both peaks within one tone duration
        if let (Some(i0), Some(i1)) = (idx_1000, idx_1200) {
            let tone_samples = Station::Wwv.minute_tone_secs() * self.sample_rate as f64;
            if (i1 - i0).abs() <= tone_samples {
                powers.differential_delay_ms = (i1 - i0) / self.sample_rate as f64 * 1000.0;
            }
        }
        powers
    }
}

/// Stations plausible on a dial frequency: CHU has exclusive allocations,
/// everything else is treated as a shared WWV/WWVH frequency.
pub fn stations_for_frequency(frequency_hz: f64) -> Vec<Station> {
    const CHU_FREQS_HZ: [f64; 3] = [3_330_000.0, 7_850_000.0, 14_670_000.0];
    if CHU_FREQS_HZ
        .iter()
        .any(|f| (frequency_hz - f).abs() < 50_000.0)
    {
        vec![Station::Chu]
    } else {
        vec![Station::Wwv, Station::Wwvh]
    }
}

fn station_source(station: Station) -> TimeSnapSource {
    match station {
        Station::Wwv => TimeSnapSource::Wwv,
        Station::Wwvh => TimeSnapSource::Wwvh,
        Station::Chu => TimeSnapSource::Chu,
    }
}

/// Map a matched-filter SNR to an anchor/detection confidence. Every
/// tone-derived confidence in the crate goes through this one curve.
pub fn confidence_from_snr(snr_db: f64) -> f64 {
    (0.6 + snr_db / 50.0).clamp(0.0, 0.99)
}

/// Build the anchor from a tone edge found at (fractional) `edge` samples
/// after the buffer start. The edge marks second :00 of the UTC minute
/// nearest the coarse estimate.
fn anchor_from_edge(
    edge: f64,
    buffer_start_rtp: u32,
    buffer_start_utc: f64,
    sample_rate: u32,
    source: TimeSnapSource,
    confidence: f64,
) -> TimeSnap {
    let utc_estimate = buffer_start_utc + edge / sample_rate as f64;
    let minute_utc = (utc_estimate / 60.0).round() * 60.0;
    let edge_int = edge.round();
    TimeSnap {
        rtp_anchor: buffer_start_rtp.wrapping_add(edge_int as i64 as u32),
        utc_anchor: minute_utc + (edge_int - edge) / sample_rate as f64,
        source,
        confidence,
        sample_rate,
    }
}

/// Fallback anchor from the NTP cache.
pub fn ntp_anchor(rtp_now: u32, utc_now_corrected: f64, sample_rate: u32) -> TimeSnap {
    TimeSnap {
        rtp_anchor: rtp_now,
        utc_anchor: utc_now_corrected,
        source: TimeSnapSource::Ntp,
        confidence: 0.7,
        sample_rate,
    }
}

/// Last-resort anchor from the raw wall clock.
pub fn wall_anchor(rtp_now: u32, utc_now: f64, sample_rate: u32) -> TimeSnap {
    TimeSnap {
        rtp_anchor: rtp_now,
        utc_anchor: utc_now,
        source: TimeSnapSource::Wall,
        confidence: 0.3,
        sample_rate,
    }
}

/// Choose the best available fallback anchor.
pub fn fallback_anchor(rtp_now: u32, ntp: &NtpSnapshot, sample_rate: u32) -> TimeSnap {
    if ntp.synced {
        ntp_anchor(rtp_now, ntp.corrected_unix_time(), sample_rate)
    } else {
        wall_anchor(rtp_now, crate::timing::ntp::system_unix_time(), sample_rate)
    }
}

/// A correction applied to a live anchor.
#[derive(Debug, Clone, Copy)]
pub struct AppliedCorrection {
    pub error_ms: f64,
    pub rtp_at: u32,
}

/// Owns the live anchor of one channel and applies the correction policy:
/// a candidate replaces the anchor only when it is at least as confident,
/// the implied error exceeds the threshold, and enough time has passed
/// since the previous correction.
pub struct AnchorTracker {
    anchor: TimeSnap,
    config: TimeSnapConfig,
    established_at: Instant,
    last_correction: Option<Instant>,
}

impl AnchorTracker {
    pub fn new(anchor: TimeSnap, config: TimeSnapConfig) -> Self {
        info!(
            source = anchor.source.as_str(),
            confidence = anchor.confidence,
            utc_anchor = anchor.utc_anchor,
            rtp_anchor = anchor.rtp_anchor,
            "time-snap anchor established"
        );
        Self {
            anchor,
            config,
            established_at: Instant::now(),
            last_correction: None,
        }
    }

    pub fn anchor(&self) -> &TimeSnap {
        &self.anchor
    }

    /// Replace the anchor unconditionally (stream restart).
    pub fn reestablish(&mut self, anchor: TimeSnap) {
        info!(
            source = anchor.source.as_str(),
            confidence = anchor.confidence,
            "time-snap anchor re-established"
        );
        self.anchor = anchor;
        self.established_at = Instant::now();
        self.last_correction = None;
    }

    /// Offer a candidate anchor from a fresh tone detection.
    pub fn offer(&mut self, candidate: TimeSnap, now: Instant) -> Option<AppliedCorrection> {
        // Implied error: where the candidate puts a reference RTP instant
        // versus where the current anchor puts it.
        let error_s = candidate.utc_of(candidate.rtp_anchor)
            - self.anchor.utc_of(candidate.rtp_anchor);
        let error_ms = error_s * 1000.0;

        if candidate.confidence + 0.05 < self.anchor.confidence {
            return None;
        }
        if error_ms.abs() <= self.config.correction_threshold_ms {
            return None;
        }
        let since_last = self
            .last_correction
            .unwrap_or(self.established_at);
        if now.duration_since(since_last).as_secs() < self.config.min_interval_s {
            return None;
        }

        info!(
            error_ms,
            source = candidate.source.as_str(),
            "applying time-snap correction"
        );
        self.anchor = candidate;
        self.last_correction = Some(now);
        Some(AppliedCorrection {
            error_ms,
            rtp_at: candidate.rtp_anchor,
        })
    }
}
