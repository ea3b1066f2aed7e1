//! Per-second marker tick analysis.
//!
//! Each second of the minute carries a short 5 ms marker at 1000 Hz (WWV)
//! or 1200 Hz (WWVH). Individual ticks are far below the noise in weak
//! conditions, so they are stacked over a window: coherently (complex sum
//! of per-tick matched-filter outputs, magnitude squared) and incoherently
//! (sum of magnitude squares). The coherent estimate wins only when its
//! measured gain justifies it.

use num_complex::Complex32;
use serde::Serialize;

use crate::capture::archive::MinuteArchive;
use crate::dsp::tone::{complex_template, correlate_complex};
use crate::station::{Station, SILENT_SECONDS, TICK_SECS};

/// Search span around each second mark, seconds.
const TICK_SEARCH_S: f64 = 0.050;

/// Coherent integration must beat incoherent by this much to be chosen.
const COHERENT_GAIN_DB: f64 = 3.0;

/// Sub-window length in seconds for the per-window series.
const SUBWINDOW_S: u32 = 10;

/// Per-tick detection gate over the window noise, dB.
const TICK_DETECT_DB: f64 = 3.0;

#[derive(Debug, Clone, Serialize)]
pub struct TickWindow {
    /// First second of the sub-window.
    pub second: u32,
    pub wwv_snr_db: f64,
    pub wwvh_snr_db: f64,
    pub coherent_wwv_snr_db: f64,
    pub coherent_wwvh_snr_db: f64,
    pub incoherent_wwv_snr_db: f64,
    pub incoherent_wwvh_snr_db: f64,
    pub integration_method: String,
    pub tick_count: u32,
}

#[derive(Debug, Clone)]
pub struct TickResult {
    pub windows: Vec<TickWindow>,
    /// Full-minute stacked SNR per station, by the chosen method.
    pub wwv_snr_db: f64,
    pub wwvh_snr_db: f64,
}

/// Per-tick complex matched-filter output for one station.
struct TickSample {
    z: Complex32,
    noise_power: f32,
}

pub struct TickAnalyzer {
    sample_rate: u32,
    tmpl_wwv: Option<Vec<Complex32>>,
    tmpl_wwvh: Option<Vec<Complex32>>,
}

impl TickAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        let fits = |f: f64| f < 0.45 * sample_rate as f64;
        let wwv_hz = Station::Wwv.tick_hz();
        let wwvh_hz = Station::Wwvh.tick_hz();
        Self {
            sample_rate,
            tmpl_wwv: fits(wwv_hz).then(|| complex_template(wwv_hz, TICK_SECS, sample_rate)),
            tmpl_wwvh: fits(wwvh_hz).then(|| complex_template(wwvh_hz, TICK_SECS, sample_rate)),
        }
    }

    pub fn usable(&self) -> bool {
        self.tmpl_wwv.is_some() && self.tmpl_wwvh.is_some()
    }

    pub fn analyze(&self, archive: &MinuteArchive) -> Option<TickResult> {
        let (tmpl_wwv, tmpl_wwvh) = match (&self.tmpl_wwv, &self.tmpl_wwvh) {
            (Some(a), Some(b)) => (a, b),
            _ => return None,
        };

        let wwv_ticks = self.collect_ticks(&archive.iq, tmpl_wwv);
        let wwvh_ticks = self.collect_ticks(&archive.iq, tmpl_wwvh);

        let mut windows = Vec::new();
        let mut sec = 1u32;
        while sec < 60 {
            let hi = (sec + SUBWINDOW_S).min(60);
            let wwv = stack(&wwv_ticks, sec, hi);
            let wwvh = stack(&wwvh_ticks, sec, hi);
            let coherent_better = wwv.snr_coh_db >= wwv.snr_incoh_db + COHERENT_GAIN_DB
                || wwvh.snr_coh_db >= wwvh.snr_incoh_db + COHERENT_GAIN_DB;
            let method = if coherent_better { "coherent" } else { "incoherent" };
            windows.push(TickWindow {
                second: sec,
                wwv_snr_db: wwv.chosen(coherent_better),
                wwvh_snr_db: wwvh.chosen(coherent_better),
                coherent_wwv_snr_db: wwv.snr_coh_db,
                coherent_wwvh_snr_db: wwvh.snr_coh_db,
                incoherent_wwv_snr_db: wwv.snr_incoh_db,
                incoherent_wwvh_snr_db: wwvh.snr_incoh_db,
                integration_method: method.to_string(),
                tick_count: wwv.detected.max(wwvh.detected),
            });
            sec = hi;
        }

        // Full-minute stack for the voting combiner
        let wwv_all = stack(&wwv_ticks, 1, 60);
        let wwvh_all = stack(&wwvh_ticks, 1, 60);
        let coherent_better = wwv_all.snr_coh_db >= wwv_all.snr_incoh_db + COHERENT_GAIN_DB
            || wwvh_all.snr_coh_db >= wwvh_all.snr_incoh_db + COHERENT_GAIN_DB;

        Some(TickResult {
            windows,
            wwv_snr_db: wwv_all.chosen(coherent_better),
            wwvh_snr_db: wwvh_all.chosen(coherent_better),
        })
    }

    /// Matched-filter every audible second; entry index = second number.
    fn collect_ticks(
        &self,
        iq: &[Complex32],
        template: &[Complex32],
    ) -> Vec<Option<TickSample>> {
        let sr = self.sample_rate as usize;
        let span = (TICK_SEARCH_S * sr as f64) as usize;

        let mut out: Vec<Option<TickSample>> = Vec::with_capacity(60);
        out.push(None); // second 0 is the minute tone, not a tick

        // First pass: find the per-tick peak lags
        let mut corrs: Vec<Option<Vec<Complex32>>> = vec![None];
        let mut peak_lags = Vec::new();
        for s in 1..60u32 {
            if SILENT_SECONDS.contains(&s) {
                corrs.push(None);
                continue;
            }
            let lo = s as usize * sr;
            let hi = (lo + span + template.len()).min(iq.len());
            if lo + template.len() >= hi {
                corrs.push(None);
                continue;
            }
            let corr = correlate_complex(&iq[lo..hi], template);
            if let Some((lag, _)) = corr
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.norm().partial_cmp(&b.1.norm()).unwrap_or(std::cmp::Ordering::Equal))
            {
                peak_lags.push(lag);
            }
            corrs.push(Some(corr));
        }

        // Stack at the consensus lag so per-tick phases stay comparable
        peak_lags.sort_unstable();
        let common_lag = peak_lags.get(peak_lags.len() / 2).copied().unwrap_or(0);

        for corr in corrs.into_iter().skip(1) {
            match corr {
                Some(c) if common_lag < c.len() => {
                    let z = c[common_lag];
                    let noise = c
                        .iter()
                        .map(|v| v.norm_sqr())
                        .sum::<f32>()
                        / c.len() as f32;
                    out.push(Some(TickSample {
                        z,
                        noise_power: noise.max(1e-12),
                    }));
                }
                _ => out.push(None),
            }
        }
        out
    }
}

struct StackedSnr {
    snr_coh_db: f64,
    snr_incoh_db: f64,
    detected: u32,
}

impl StackedSnr {
    fn chosen(&self, coherent: bool) -> f64 {
        if coherent {
            self.snr_coh_db
        } else {
            self.snr_incoh_db
        }
    }
}

/// Stack ticks for seconds `lo..hi`.
fn stack(ticks: &[Option<TickSample>], lo: u32, hi: u32) -> StackedSnr {
    let mut z_sum = Complex32::new(0.0, 0.0);
    let mut p_sum = 0.0f64;
    let mut noise_sum = 0.0f64;
    let mut n = 0u32;
    let mut detected = 0u32;

    for s in lo..hi {
        let Some(Some(t)) = ticks.get(s as usize) else {
            continue;
        };
        z_sum += t.z;
        p_sum += t.z.norm_sqr() as f64;
        noise_sum += t.noise_power as f64;
        n += 1;
        if t.z.norm_sqr() >= t.noise_power * 10f32.powf((TICK_DETECT_DB / 10.0) as f32) {
            detected += 1;
        }
    }

    if n == 0 {
        return StackedSnr {
            snr_coh_db: f64::NEG_INFINITY,
            snr_incoh_db: f64::NEG_INFINITY,
            detected: 0,
        };
    }

    let noise = (noise_sum / n as f64).max(1e-12);
    // Coherent: |sum z|^2 against N-fold noise; phase-aligned ticks gain a
    // factor N over the incoherent mean of |z|^2.
    let coh = (z_sum.norm_sqr() as f64) / (n as f64 * noise);
    let incoh = p_sum / (n as f64 * noise);

    StackedSnr {
        snr_coh_db: 10.0 * coh.max(1e-12).log10(),
        snr_incoh_db: 10.0 * incoh.max(1e-12).log10(),
        detected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::archive::TONE_POWER_SENTINEL;

    const SR: u32 = 8000;

    fn archive_with_iq(iq: Vec<Complex32>) -> MinuteArchive {
        MinuteArchive {
            iq,
            rtp_timestamp: 0,
            rtp_ssrc: 1,
            sample_rate: SR,
            frequency_hz: 10e6,
            channel_name: "t".into(),
            unix_timestamp: 1_700_000_040.0,
            time_snap_rtp: 0,
            time_snap_utc: 1_700_000_040.0,
            time_snap_source: "wwv".into(),
            time_snap_confidence: 0.9,
            time_snap_station: "WWV".into(),
            tone_power_1000_hz_db: TONE_POWER_SENTINEL,
            tone_power_1200_hz_db: TONE_POWER_SENTINEL,
            wwvh_differential_delay_ms: 0.0,
            ntp_wall_clock_time: 0.0,
            ntp_offset_ms: 0.0,
            gaps_count: 0,
            gaps_filled: 0,
            packets_received: 0,
            packets_expected: 0,
            gap_rtp_timestamps: vec![],
            gap_sample_indices: vec![],
            gap_samples_filled: vec![],
            gap_packets_lost: vec![],
            recorder_version: "test".into(),
            created_timestamp: 0.0,
        }
    }

    /// Synthesize a minute with ticks of `freq` at every audible second.
    fn synth_ticks(freq: f64, amp: f32, noise_amp: f32) -> Vec<Complex32> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let n = SR as usize * 60;
        let tick_len = (TICK_SECS * SR as f64) as usize;
        let mut iq: Vec<Complex32> = (0..n)
            .map(|_| {
                Complex32::new(
                    noise_amp * rng.gen_range(-0.5..0.5),
                    noise_amp * rng.gen_range(-0.5..0.5),
                )
            })
            .collect();
        for s in 1..60usize {
            if SILENT_SECONDS.contains(&(s as u32)) {
                continue;
            }
            let start = s * SR as usize;
            for i in 0..tick_len {
                let ph = 2.0 * std::f64::consts::PI * freq * i as f64 / SR as f64;
                iq[start + i] += Complex32::new(ph.cos() as f32, ph.sin() as f32) * amp;
            }
        }
        iq
    }

    #[test]
    fn test_wwv_ticks_beat_wwvh() {
        let analyzer = TickAnalyzer::new(SR);
        let archive = archive_with_iq(synth_ticks(1000.0, 1.0, 0.05));
        let result = analyzer.analyze(&archive).unwrap();
        assert!(
            result.wwv_snr_db > result.wwvh_snr_db + 6.0,
            "wwv {} wwvh {}",
            result.wwv_snr_db,
            result.wwvh_snr_db
        );
        assert_eq!(result.windows.len(), 6);
        // Phase-stable synthetic ticks: coherent stacking must be chosen
        assert!(result
            .windows
            .iter()
            .any(|w| w.integration_method == "coherent"));
    }

    #[test]
    fn test_wwvh_ticks_detected() {
        let analyzer = TickAnalyzer::new(SR);
        let archive = archive_with_iq(synth_ticks(1200.0, 1.0, 0.05));
        let result = analyzer.analyze(&archive).unwrap();
        assert!(result.wwvh_snr_db > result.wwv_snr_db + 6.0);
        let w = &result.windows[0];
        assert!(w.tick_count > 0);
    }

    #[test]
    fn test_noise_only_low_snr() {
        let analyzer = TickAnalyzer::new(SR);
        let archive = archive_with_iq(synth_ticks(1000.0, 0.0, 0.1));
        let result = analyzer.analyze(&archive).unwrap();
        assert!(result.wwv_snr_db < 6.0, "snr {}", result.wwv_snr_db);
    }

    #[test]
    fn test_narrow_channel_unusable() {
        let analyzer = TickAnalyzer::new(200);
        assert!(!analyzer.usable());
        let archive = archive_with_iq(vec![Complex32::new(0.0, 0.0); 200 * 60]);
        let mut archive = archive;
        archive.sample_rate = 200;
        assert!(analyzer.analyze(&archive).is_none());
    }
}
