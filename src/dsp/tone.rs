//! Tone templates and matched-filter detection.
//!
//! The minute tones (1000/1200 Hz), the 440 Hz station ID and the
//! per-second ticks all use the same machinery: a Tukey-windowed
//! unit-energy template correlated against either the AM envelope
//! (phase-invariant sin/cos pair) or the raw I/Q (complex template).

use num_complex::Complex32;

use super::{fft, fir, median, parabolic_offset};

/// Taper fraction used for all tone templates.
const TUKEY_ALPHA: f32 = 0.25;

/// Quadrature pair of real tone templates for envelope correlation.
pub struct ToneTemplate {
    pub sin: Vec<f32>,
    pub cos: Vec<f32>,
    pub freq_hz: f64,
    pub sample_rate: u32,
}

impl ToneTemplate {
    pub fn new(freq_hz: f64, duration_secs: f64, sample_rate: u32) -> Self {
        let len = (duration_secs * sample_rate as f64).round() as usize;
        let mut sin = Vec::with_capacity(len);
        let mut cos = Vec::with_capacity(len);
        for n in 0..len {
            let w = fir::tukey(n, len, TUKEY_ALPHA);
            let phase = 2.0 * std::f64::consts::PI * freq_hz * n as f64 / sample_rate as f64;
            sin.push(w * phase.sin() as f32);
            cos.push(w * phase.cos() as f32);
        }
        normalize_energy(&mut sin);
        normalize_energy(&mut cos);
        Self {
            sin,
            cos,
            freq_hz,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.sin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sin.is_empty()
    }
}

fn normalize_energy(x: &mut [f32]) {
    let energy: f32 = x.iter().map(|v| v * v).sum();
    if energy > 1e-12 {
        let scale = 1.0 / energy.sqrt();
        for v in x.iter_mut() {
            *v *= scale;
        }
    }
}

/// One matched-filter detection on an envelope.
#[derive(Debug, Clone, Copy)]
pub struct ToneDetection {
    /// Template leading-edge position, in (fractional) samples relative to
    /// the START of the input slice.
    pub index: f64,
    /// Peak matched-filter amplitude.
    pub peak: f32,
    /// Median of the matched-filter magnitude (noise reference).
    pub median: f32,
    /// 20*log10(peak/median).
    pub snr_db: f64,
}

/// Run the phase-invariant matched filter over a DC-removed envelope and
/// locate the strongest tone onset. Indices are relative to the start of
/// `env`; the caller adds its own buffer offset.
pub fn detect_tone(env: &[f32], template: &ToneTemplate) -> Option<ToneDetection> {
    if env.len() < template.len() || template.is_empty() {
        return None;
    }
    let mf = fft::quadrature_correlate(env, &template.sin, &template.cos);
    peak_of(&mf)
}

/// Peak + sub-sample refinement + SNR over a matched-filter output.
pub fn peak_of(mf: &[f32]) -> Option<ToneDetection> {
    if mf.is_empty() {
        return None;
    }
    let (peak_idx, &peak) = mf
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;

    let med = median(mf);
    let snr_db = 20.0 * ((peak as f64).max(1e-12) / (med as f64).max(1e-12)).log10();

    let frac = if peak_idx > 0 && peak_idx + 1 < mf.len() {
        parabolic_offset(mf[peak_idx - 1], peak, mf[peak_idx + 1])
    } else {
        0.0
    };

    Some(ToneDetection {
        index: peak_idx as f64 + frac as f64,
        peak,
        median: med,
        snr_db,
    })
}

/// Complex baseband tone template for tick correlation against raw I/Q.
pub fn complex_template(freq_hz: f64, duration_secs: f64, sample_rate: u32) -> Vec<Complex32> {
    let len = (duration_secs * sample_rate as f64).round() as usize;
    let mut t = Vec::with_capacity(len);
    for n in 0..len {
        let w = fir::tukey(n, len, TUKEY_ALPHA);
        let phase = 2.0 * std::f64::consts::PI * freq_hz * n as f64 / sample_rate as f64;
        t.push(Complex32::new(
            w * phase.cos() as f32,
            w * phase.sin() as f32,
        ));
    }
    let energy: f32 = t.iter().map(|z| z.norm_sqr()).sum();
    if energy > 1e-12 {
        let scale = 1.0 / energy.sqrt();
        for z in t.iter_mut() {
            *z *= scale;
        }
    }
    t
}

/// Direct complex correlation over a short search window:
/// `out[k] = sum_i iq[k + i] * conj(template[i])`.
pub fn correlate_complex(iq: &[Complex32], template: &[Complex32]) -> Vec<Complex32> {
    if template.is_empty() || iq.len() < template.len() {
        return Vec::new();
    }
    (0..=iq.len() - template.len())
        .map(|k| {
            template
                .iter()
                .enumerate()
                .map(|(i, t)| iq[k + i] * t.conj())
                .sum()
        })
        .collect()
}
