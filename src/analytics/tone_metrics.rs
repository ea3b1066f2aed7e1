//! Per-minute tone metrics.
//!
//! Matched-filter power, SNR and timing error for the 1000 Hz (WWV) and
//! 1200 Hz (WWVH) minute tones at their expected :00 alignment, plus the
//! 440 Hz station-ID check (WWVH on minute 1 of the hour, WWV on minute 2).
//! The noise floor is measured in the 825-875 Hz guard band, which carries
//! no broadcast tone or harmonic.

use crate::capture::archive::MinuteArchive;
use crate::dsp::fft::power_spectrum;
use crate::dsp::tone::{detect_tone, ToneTemplate};
use crate::dsp::{envelope, remove_dc};
use crate::station::{Station, WWVH_440_MINUTE, WWV_440_MINUTE};
use crate::timing::time_snap::confidence_from_snr;

/// Detection gate in dB over the matched-filter median.
const DETECT_SNR_DB: f64 = 6.0;

/// Seconds of the minute searched for the tone onset.
const SEARCH_SECS: usize = 2;

/// Guard band for the noise floor, Hz.
const GUARD_BAND_HZ: (f64, f64) = (825.0, 875.0);

/// 440 Hz measurement band half-width, Hz.
const BAND_440_HALF_HZ: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
pub struct ToneMetric {
    pub detected: bool,
    pub power_db: f64,
    pub snr_db: f64,
    pub timing_error_ms: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Tone440 {
    pub detected: bool,
    pub power_db: f64,
}

/// All tone measurements for one minute.
#[derive(Debug, Clone, Copy)]
pub struct ToneMetrics {
    pub wwv: Option<ToneMetric>,
    pub wwvh: Option<ToneMetric>,
    pub tone_440_wwv: Tone440,
    pub tone_440_wwvh: Tone440,
}

pub struct ToneAnalyzer {
    sample_rate: u32,
    tmpl_wwv: Option<ToneTemplate>,
    tmpl_wwvh: Option<ToneTemplate>,
}

impl ToneAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        let fits = |f: f64| f < 0.45 * sample_rate as f64;
        Self {
            sample_rate,
            tmpl_wwv: fits(1000.0).then(|| {
                ToneTemplate::new(1000.0, Station::Wwv.minute_tone_secs(), sample_rate)
            }),
            tmpl_wwvh: fits(1200.0).then(|| {
                ToneTemplate::new(1200.0, Station::Wwvh.minute_tone_secs(), sample_rate)
            }),
        }
    }

    /// Whether this channel's bandwidth carries the audio tones at all.
    pub fn usable(&self) -> bool {
        self.tmpl_wwv.is_some() || self.tmpl_wwvh.is_some()
    }

    pub fn analyze(&self, archive: &MinuteArchive) -> Option<ToneMetrics> {
        if !self.usable() {
            return None;
        }
        let mut env = envelope(&archive.iq);
        remove_dc(&mut env);

        let sr = self.sample_rate as usize;
        let search = &env[..(SEARCH_SECS * sr).min(env.len())];

        let wwv = self
            .tmpl_wwv
            .as_ref()
            .and_then(|t| self.measure(search, t));
        let wwvh = self
            .tmpl_wwvh
            .as_ref()
            .and_then(|t| self.measure(search, t));

        let minute = archive.minute_number();
        let (t440_wwv, t440_wwvh) = self.measure_440(&env, minute);

        Some(ToneMetrics {
            wwv,
            wwvh,
            tone_440_wwv: t440_wwv,
            tone_440_wwvh: t440_wwvh,
        })
    }

    fn measure(&self, search: &[f32], template: &ToneTemplate) -> Option<ToneMetric> {
        let det = detect_tone(search, template)?;
        let power_db = 20.0 * (det.peak as f64).max(1e-12).log10();
        // The tone is transmitted at :00; sample 0 is the minute boundary,
        // so the onset index is the timing error directly.
        let timing_error_ms = det.index / self.sample_rate as f64 * 1000.0;
        Some(ToneMetric {
            detected: det.snr_db >= DETECT_SNR_DB,
            power_db,
            snr_db: det.snr_db,
            timing_error_ms,
            confidence: confidence_from_snr(det.snr_db),
        })
    }

    /// Band-power check for the 440 Hz hour marker. Only the scheduled
    /// minute can yield a detection; power is measured regardless.
    fn measure_440(&self, env: &[f32], minute: u32) -> (Tone440, Tone440) {
        let sr = self.sample_rate as usize;
        if 440.0 + BAND_440_HALF_HZ >= 0.5 * self.sample_rate as f64 {
            let absent = Tone440 {
                detected: false,
                power_db: f64::NEG_INFINITY,
            };
            return (absent, absent);
        }

        // The 440 Hz segment runs from roughly :02 through :44
        let slice = &env[(2 * sr).min(env.len())..(44 * sr).min(env.len())];
        if slice.is_empty() {
            let absent = Tone440 {
                detected: false,
                power_db: f64::NEG_INFINITY,
            };
            return (absent, absent);
        }

        let spectrum = power_spectrum(slice);
        let sr_hz = self.sample_rate as f64;
        let p440 = spectrum.band_power(
            440.0 - BAND_440_HALF_HZ,
            440.0 + BAND_440_HALF_HZ,
            sr_hz,
        );
        let noise = spectrum.band_power(GUARD_BAND_HZ.0, GUARD_BAND_HZ.1, sr_hz);
        let power_db = 10.0 * p440.max(1e-20).log10();
        let snr_db = crate::dsp::power_db(p440, noise);
        let present = snr_db >= DETECT_SNR_DB;

        let wwv = Tone440 {
            detected: present && minute == WWV_440_MINUTE,
            power_db,
        };
        let wwvh = Tone440 {
            detected: present && minute == WWVH_440_MINUTE,
            power_db,
        };
        (wwv, wwvh)
    }
}
