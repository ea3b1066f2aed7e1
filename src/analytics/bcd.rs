//! 100 Hz BCD time-code correlator.
//!
//! WWV and WWVH transmit the identical BCD minute frame on a 100 Hz
//! subcarrier, so a cross-correlation of the received envelope against the
//! expected frame shows one arrival per station. Two resolvable peaks are
//! separated by the differential propagation delay; their amplitudes come
//! out of a 2x2 joint least-squares solve against the template
//! autocorrelation, which also cancels the subcarrier's cycle ambiguity
//! (a lone station's 10 ms sidelobe solves to a near-zero second
//! amplitude). A single peak is assigned by the geographic time-of-arrival
//! model and left unassigned when both station ranges are compatible with
//! the observed delay.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;

use crate::capture::archive::MinuteArchive;
use crate::config::BcdConfig;
use crate::dsp::{envelope, fft, fir, median, parabolic_offset, remove_dc};
use crate::station::{Station, ToaModel};

/// Internal correlation rate. 100 Hz sits well inside its Nyquist and the
/// 0.625 ms sample spacing leaves sub-millisecond delay resolution after
/// peak interpolation.
const ENV_RATE: u32 = 1600;

/// Pulse envelope starts this long after the second mark, leaving room
/// for the tick.
const PULSE_OFFSET_S: f64 = 0.030;

/// Pulse widths: binary zero, binary one, position marker.
const ZERO_S: f64 = 0.170;
const ONE_S: f64 = 0.470;
const MARKER_S: f64 = 0.770;

/// Arrival search span past nominal alignment, seconds.
const SEARCH_SPAN_S: f64 = 0.100;

/// Dual-peak separation limits, ms.
const PEAK_SEP_MIN_MS: f64 = 5.0;
const PEAK_SEP_MAX_MS: f64 = 30.0;

/// A solved second amplitude below this fraction of the first is a
/// sidelobe artifact, not a station.
const SECONDARY_AMP_FLOOR: f64 = 0.1;

/// One correlation window's result.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BcdWindow {
    pub window_start_sec: f64,
    pub wwv_amplitude: f64,
    pub wwvh_amplitude: f64,
    pub differential_delay_ms: f64,
    pub correlation_quality: f64,
}

/// Minute-level BCD result (best window plus the full series).
#[derive(Debug, Clone)]
pub struct BcdResult {
    pub wwv_amplitude: f64,
    pub wwvh_amplitude: f64,
    pub differential_delay_ms: f64,
    pub correlation_quality: f64,
    pub windows: Vec<BcdWindow>,
}

pub struct BcdCorrelator {
    config: BcdConfig,
    toa: Option<ToaModel>,
}

impl BcdCorrelator {
    pub fn new(config: BcdConfig, toa: Option<ToaModel>) -> Self {
        Self { config, toa }
    }

    pub fn analyze(&self, archive: &MinuteArchive) -> Option<BcdResult> {
        let sr = archive.sample_rate;
        if sr < 2 * ENV_RATE {
            // The subcarrier does not survive a narrow carrier channel
            return None;
        }

        // AM demodulate, keep 0-150 Hz, resample to the correlation rate
        let mut env = envelope(&archive.iq);
        remove_dc(&mut env);
        let taps = fir::low_pass(sr as f64, 150.0, 50.0);
        let factor = (sr / ENV_RATE) as usize;
        let env = fir::filter_decimate_real(&env, &taps, factor);

        let template = BcdTemplate::for_minute(archive.unix_timestamp, ENV_RATE);

        let window_len = (self.config.window_s.max(1) as usize) * ENV_RATE as usize;
        let step = (self.config.step_s.max(1) as usize) * ENV_RATE as usize;
        let margin = (SEARCH_SPAN_S * ENV_RATE as f64) as usize;

        let mut windows = Vec::new();
        let mut start = 0usize;
        while start < env.len() {
            let avail = env.len() - start;
            if avail < window_len.min(env.len()) {
                break;
            }
            if let Some(w) = self.correlate_window(&env, &template, start, window_len, margin) {
                windows.push(w);
            }
            start += step;
        }

        if windows.is_empty() {
            return None;
        }

        // Minute-level figures come from the highest-quality window
        let best = windows
            .iter()
            .cloned()
            .max_by(|a, b| {
                a.correlation_quality
                    .partial_cmp(&b.correlation_quality)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;

        Some(BcdResult {
            wwv_amplitude: best.wwv_amplitude,
            wwvh_amplitude: best.wwvh_amplitude,
            differential_delay_ms: best.differential_delay_ms,
            correlation_quality: best.correlation_quality,
            windows,
        })
    }

    fn correlate_window(
        &self,
        env: &[f32],
        template: &BcdTemplate,
        start: usize,
        window_len: usize,
        margin: usize,
    ) -> Option<BcdWindow> {
        let sig_hi = (start + window_len).min(env.len());
        let signal = &env[start..sig_hi];
        // The template slice is shortened by the search margin so that
        // arrival lags in [0, margin] are observable.
        let t_len = signal.len().saturating_sub(margin);
        if t_len < ENV_RATE as usize {
            return None;
        }
        let t_hi = start + t_len;
        let tmpl = &template.wave[start..t_hi];

        let corr = fft::cross_correlate(signal, tmpl);
        if corr.len() < 3 {
            return None;
        }

        let abs: Vec<f32> = corr.iter().map(|v| v.abs()).collect();
        let med = median(&abs).max(1e-12);
        let (p1_idx, &p1_val) = corr
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        let quality = (p1_val / med) as f64;
        if quality < self.config.quality_threshold {
            return None;
        }

        let p1 = refine_peak(&corr, p1_idx);
        let r0 = template.autocorr(start, t_hi, 0);
        if r0 <= 0.0 {
            return None;
        }

        let lag_to_ms = |lag: f64| lag / ENV_RATE as f64 * 1000.0;

        let secondary = find_secondary_peak(&corr, p1_idx, med, self.config.quality_threshold);
        let resolved = secondary.and_then(|(p2_pos, p2_val)| {
            let sep_samples = p2_pos - p1.0;
            let r_d = template.autocorr(start, t_hi, sep_samples.round() as isize) / r0;
            let (a1, a2) = solve_joint(p1.1 as f64 / r0, p2_val as f64 / r0, r_d);
            // A sidelobe of a lone station solves to a2 near zero
            if a2 < SECONDARY_AMP_FLOOR * a1 {
                return None;
            }
            Some((p2_pos, a1, a2))
        });

        let (wwv_amp, wwvh_amp, diff_ms) = match resolved {
            Some((p2_pos, a1, a2)) => {
                let (early_amp, late_amp) = if p1.0 <= p2_pos {
                    (a1, a2)
                } else {
                    (a2, a1)
                };
                let sep_ms = lag_to_ms((p2_pos - p1.0).abs());
                if self.earlier_is_wwv() {
                    (early_amp, late_amp, sep_ms)
                } else {
                    (late_amp, early_amp, -sep_ms)
                }
            }
            None => {
                let amp = p1.1 as f64 / r0;
                let delay_ms = lag_to_ms(p1.0);
                match self.toa.and_then(|m| m.classify_single_peak(delay_ms)) {
                    Some(Station::Wwv) => (amp, 0.0, 0.0),
                    Some(Station::Wwvh) => (0.0, amp, 0.0),
                    // Both model ranges overlap the observation: abstain
                    _ => (0.0, 0.0, 0.0),
                }
            }
        };

        Some(BcdWindow {
            window_start_sec: start as f64 / ENV_RATE as f64,
            wwv_amplitude: wwv_amp,
            wwvh_amplitude: wwvh_amp,
            differential_delay_ms: diff_ms,
            correlation_quality: quality,
        })
    }

    /// Whether the earlier of two arrivals should be WWV. With no receiver
    /// location the continental default applies: WWV is the closer station.
    fn earlier_is_wwv(&self) -> bool {
        match self.toa {
            Some(model) => model.differential_delay_ms() >= 0.0,
            None => true,
        }
    }
}

/// Solve the normalized symmetric system
/// `[1 r; r 1] [a1; a2] = [c1; c2]` for the two station amplitudes.
fn solve_joint(c1: f64, c2: f64, r: f64) -> (f64, f64) {
    let det = 1.0 - r * r;
    if det.abs() < 1e-9 {
        return (c1 / 2.0, c2 / 2.0);
    }
    let a1 = (c1 - r * c2) / det;
    let a2 = (c2 - r * c1) / det;
    (a1.max(0.0), a2.max(0.0))
}

/// Sub-sample peak position and interpolated value (parabolic vertex).
fn refine_peak(corr: &[f32], idx: usize) -> (f64, f32) {
    if idx == 0 || idx + 1 >= corr.len() {
        return (idx as f64, corr[idx]);
    }
    let (y1, y2, y3) = (corr[idx - 1], corr[idx], corr[idx + 1]);
    let off = parabolic_offset(y1, y2, y3);
    let value = y2 - 0.25 * (y1 - y3) * off;
    (idx as f64 + off as f64, value)
}

/// Strongest local maximum separated from the primary by the dual-peak
/// window and above the quality gate.
fn find_secondary_peak(
    corr: &[f32],
    primary: usize,
    noise_median: f32,
    quality_threshold: f64,
) -> Option<(f64, f32)> {
    let sep_min = ((PEAK_SEP_MIN_MS / 1000.0 * ENV_RATE as f64).round() as usize).max(1);
    let sep_max = (PEAK_SEP_MAX_MS / 1000.0 * ENV_RATE as f64).round() as usize;

    let mut best: Option<(usize, f32)> = None;
    for k in 1..corr.len().saturating_sub(1) {
        let d = k.abs_diff(primary);
        if d < sep_min || d > sep_max {
            continue;
        }
        if corr[k] < corr[k - 1] || corr[k] < corr[k + 1] {
            continue;
        }
        if ((corr[k] / noise_median) as f64) < quality_threshold {
            continue;
        }
        if best.map(|(_, v)| corr[k] > v).unwrap_or(true) {
            best = Some((k, corr[k]));
        }
    }
    best.map(|(k, _)| refine_peak(corr, k))
}

/// The expected 100 Hz BCD frame for one UTC minute. The subcarrier phase
/// is locked to the second mark, so the correlation is phase-sensitive and
/// resolves arrivals finer than a carrier cycle.
pub struct BcdTemplate {
    pub wave: Vec<f32>,
}

impl BcdTemplate {
    /// Generate the frame for the minute containing `unix_timestamp`.
    pub fn for_minute(unix_timestamp: f64, rate: u32) -> Self {
        let dt = DateTime::<Utc>::from_timestamp(unix_timestamp.floor() as i64, 0)
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());
        let symbols = frame_symbols(dt);

        let n = 60 * rate as usize;
        let mut wave = vec![0.0f32; n];
        for (sec, width_s) in symbols.iter().enumerate() {
            let Some(width_s) = width_s else { continue };
            let start = ((sec as f64 + PULSE_OFFSET_S) * rate as f64) as usize;
            let len = (width_s * rate as f64) as usize;
            for i in 0..len {
                let idx = start + i;
                if idx >= n {
                    break;
                }
                let ph = 2.0 * std::f64::consts::PI * 100.0 * i as f64 / rate as f64;
                wave[idx] = ph.sin() as f32;
            }
        }
        Self { wave }
    }

    /// Autocorrelation of the template slice at an integer lag in samples.
    pub fn autocorr(&self, start: usize, end: usize, lag: isize) -> f64 {
        let sig = &self.wave[start..end];
        let mut acc = 0.0f64;
        for i in 0..sig.len() {
            let j = i as isize + lag;
            if j < 0 || j as usize >= sig.len() {
                continue;
            }
            acc += sig[j as usize] as f64 * sig[i] as f64;
        }
        acc
    }
}

/// Per-second pulse widths for the minute frame; `None` means no pulse.
fn frame_symbols(dt: DateTime<Utc>) -> [Option<f64>; 60] {
    let minute = dt.minute();
    let hour = dt.hour();
    let doy = dt.ordinal();
    let year = dt.year() as u32 % 100;

    let mut sym: [Option<f64>; 60] = [Some(ZERO_S); 60];
    sym[0] = None; // minute mark carries the tone, not a BCD pulse

    let mut bit = |sec: usize, set: bool| {
        sym[sec] = Some(if set { ONE_S } else { ZERO_S });
    };

    // Year units (1,2,4,8)
    for (i, sec) in (4..=7).enumerate() {
        bit(sec, (year % 10) >> i & 1 == 1);
    }
    // Minutes
    for (i, sec) in (10..=13).enumerate() {
        bit(sec, (minute % 10) >> i & 1 == 1);
    }
    for (i, sec) in (15..=17).enumerate() {
        bit(sec, (minute / 10) >> i & 1 == 1);
    }
    // Hours
    for (i, sec) in (20..=23).enumerate() {
        bit(sec, (hour % 10) >> i & 1 == 1);
    }
    for (i, sec) in (25..=26).enumerate() {
        bit(sec, (hour / 10) >> i & 1 == 1);
    }
    // Day of year
    for (i, sec) in (30..=33).enumerate() {
        bit(sec, (doy % 10) >> i & 1 == 1);
    }
    for (i, sec) in (35..=38).enumerate() {
        bit(sec, (doy / 10 % 10) >> i & 1 == 1);
    }
    for (i, sec) in (40..=41).enumerate() {
        bit(sec, (doy / 100) >> i & 1 == 1);
    }
    // Year tens (10,20,40,80)
    for (i, sec) in (51..=54).enumerate() {
        bit(sec, (year / 10) >> i & 1 == 1);
    }

    // Position markers
    for sec in [9, 19, 29, 39, 49, 59] {
        sym[sec] = Some(MARKER_S);
    }
    sym
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::archive::TONE_POWER_SENTINEL;
    use num_complex::Complex32;

    const SR: u32 = 16000;

    fn archive_from_env(env: Vec<f32>, minute_utc: f64) -> MinuteArchive {
        // Carrier offset keeps the AM envelope away from zero folding
        MinuteArchive {
            iq: env.iter().map(|&e| Complex32::new(2.5 + e, 0.0)).collect(),
            rtp_timestamp: 0,
            rtp_ssrc: 1,
            sample_rate: SR,
            frequency_hz: 10e6,
            channel_name: "t".into(),
            unix_timestamp: minute_utc,
            time_snap_rtp: 0,
            time_snap_utc: minute_utc,
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

    /// Render the frame at the archive rate with a delay and amplitude.
    fn render_bcd(minute_utc: f64, delay_s: f64, amp: f32) -> Vec<f32> {
        let tmpl = BcdTemplate::for_minute(minute_utc, SR);
        let n = SR as usize * 60;
        let shift = (delay_s * SR as f64) as usize;
        let mut out = vec![0.0f32; n];
        for i in shift..n {
            if i - shift < tmpl.wave.len() {
                out[i] = amp * tmpl.wave[i - shift];
            }
        }
        out
    }

    fn add(a: &mut [f32], b: &[f32]) {
        for (x, y) in a.iter_mut().zip(b.iter()) {
            *x += y;
        }
    }

    #[test]
    fn test_frame_symbols_encode_minute() {
        // 2023-11-14T22:14:00Z: minute 14, hour 22, doy 318, year 23
        let dt = DateTime::<Utc>::from_timestamp(1_700_000_040, 0).unwrap();
        let sym = frame_symbols(dt);
        // Minute units 4 -> pattern (1,2,4,8) = (0,0,1,0) at secs 10-13
        assert_eq!(sym[10], Some(ZERO_S));
        assert_eq!(sym[11], Some(ZERO_S));
        assert_eq!(sym[12], Some(ONE_S));
        assert_eq!(sym[13], Some(ZERO_S));
        // Minute tens 1 at sec 15
        assert_eq!(sym[15], Some(ONE_S));
        // Markers and the silent minute mark
        assert_eq!(sym[9], Some(MARKER_S));
        assert_eq!(sym[59], Some(MARKER_S));
        assert_eq!(sym[0], None);
    }

    #[test]
    fn test_single_station_without_model_abstains() {
        let minute = 1_700_000_040.0;
        let env = render_bcd(minute, 0.004, 1.0);
        let archive = archive_from_env(env, minute);
        let corr = BcdCorrelator::new(BcdConfig::default(), None);
        let result = corr.analyze(&archive).expect("bcd result");
        assert!(result.correlation_quality >= 3.0);
        // No ToA model and one station: no assignment
        assert_eq!(result.wwv_amplitude, 0.0);
        assert_eq!(result.wwvh_amplitude, 0.0);
        assert_eq!(result.differential_delay_ms, 0.0);
    }

    #[test]
    fn test_single_station_with_model_assigns_wwv() {
        let minute = 1_700_000_040.0;
        // FN31 puts WWV at ~8.8 ms; render the frame at that delay
        let toa = ToaModel::from_grid_square("FN31").unwrap();
        let delay_s = toa.delay_ms(Station::Wwv) / 1000.0;
        let env = render_bcd(minute, delay_s, 1.0);
        let archive = archive_from_env(env, minute);
        let corr = BcdCorrelator::new(BcdConfig::default(), Some(toa));
        let result = corr.analyze(&archive).expect("bcd result");
        assert!(result.wwv_amplitude > 0.5, "wwv {}", result.wwv_amplitude);
        assert_eq!(result.wwvh_amplitude, 0.0);
    }

    #[test]
    fn test_dual_peak_amplitudes_and_delay() {
        let minute = 1_700_000_040.0;
        let mut env = render_bcd(minute, 0.004, 1.0);
        let delayed = render_bcd(minute, 0.014, 0.5);
        add(&mut env, &delayed);
        let archive = archive_from_env(env, minute);
        let corr = BcdCorrelator::new(BcdConfig::default(), None);
        let result = corr.analyze(&archive).expect("bcd result");

        assert!(
            (result.wwv_amplitude - 1.0).abs() < 0.2,
            "wwv amp {}",
            result.wwv_amplitude
        );
        assert!(
            (result.wwvh_amplitude - 0.5).abs() < 0.2,
            "wwvh amp {}",
            result.wwvh_amplitude
        );
        assert!(
            (result.differential_delay_ms - 10.0).abs() < 1.0,
            "delay {}",
            result.differential_delay_ms
        );
    }

    #[test]
    fn test_noise_only_yields_nothing() {
        let n = SR as usize * 60;
        let env: Vec<f32> = (0..n)
            .map(|i| ((i as u64).wrapping_mul(2654435761) % 1000) as f32 / 2000.0 - 0.25)
            .collect();
        let archive = archive_from_env(env, 1_700_000_040.0);
        let corr = BcdCorrelator::new(BcdConfig::default(), None);
        assert!(corr.analyze(&archive).is_none());
    }

    #[test]
    fn test_narrow_channel_skipped() {
        let mut archive = archive_from_env(vec![0.0; 200 * 60], 1_700_000_040.0);
        archive.sample_rate = 200;
        archive.iq.truncate(200 * 60);
        let corr = BcdCorrelator::new(BcdConfig::default(), None);
        assert!(corr.analyze(&archive).is_none());
    }
}
