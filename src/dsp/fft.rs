//! FFT-based cross-correlation.
//!
//! Long matched-filter searches (startup tone search over a two-minute
//! buffer, BCD envelope correlation over a minute) are far too slow as
//! direct convolutions; they run as frequency-domain products instead.

use num_complex::Complex32;
use rustfft::FftPlanner;

/// Valid-mode cross-correlation of a real signal against a real template:
/// `out[k] = sum_i signal[k + i] * template[i]` for
/// `k in 0 ..= signal.len() - template.len()`.
pub fn cross_correlate(signal: &[f32], template: &[f32]) -> Vec<f32> {
    let n = signal.len();
    let m = template.len();
    if m == 0 || n < m {
        return Vec::new();
    }

    let size = (n + m - 1).next_power_of_two();
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(size);
    let ifft = planner.plan_fft_inverse(size);

    let mut a: Vec<Complex32> = signal
        .iter()
        .map(|&v| Complex32::new(v, 0.0))
        .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
        .take(size)
        .collect();
    let mut b: Vec<Complex32> = template
        .iter()
        .map(|&v| Complex32::new(v, 0.0))
        .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
        .take(size)
        .collect();

    fft.process(&mut a);
    fft.process(&mut b);
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x *= y.conj();
    }
    ifft.process(&mut a);

    let scale = 1.0 / size as f32;
    a[..=(n - m)].iter().map(|z| z.re * scale).collect()
}

/// Phase-invariant matched-filter output: the quadrature combination
/// `sqrt(c_sin^2 + c_cos^2)` of the correlations against the sine and
/// cosine templates.
pub fn quadrature_correlate(signal: &[f32], tmpl_sin: &[f32], tmpl_cos: &[f32]) -> Vec<f32> {
    let cs = cross_correlate(signal, tmpl_sin);
    let cc = cross_correlate(signal, tmpl_cos);
    cs.iter()
        .zip(cc.iter())
        .map(|(s, c)| (s * s + c * c).sqrt())
        .collect()
}

/// One-sided power spectrum of a real signal, zero-padded to a power of
/// two. Bin k covers `k * sample_rate / fft_size` Hz.
pub struct Spectrum {
    pub power: Vec<f64>,
    pub fft_size: usize,
}

impl Spectrum {
    /// Mean power over the band `[lo_hz, hi_hz]` at the given sample rate.
    pub fn band_power(&self, lo_hz: f64, hi_hz: f64, sample_rate: f64) -> f64 {
        let bin_hz = sample_rate / self.fft_size as f64;
        let b0 = (lo_hz / bin_hz) as usize;
        let b1 = ((hi_hz / bin_hz) as usize).min(self.power.len().saturating_sub(1));
        if b1 <= b0 {
            return 0.0;
        }
        self.power[b0..=b1].iter().sum::<f64>() / (b1 - b0 + 1) as f64
    }
}

pub fn power_spectrum(x: &[f32]) -> Spectrum {
    let size = x.len().next_power_of_two().max(2);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(size);
    let mut buf: Vec<Complex32> = x
        .iter()
        .map(|&v| Complex32::new(v, 0.0))
        .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
        .take(size)
        .collect();
    fft.process(&mut buf);
    let scale = 1.0 / (x.len().max(1) as f64 * x.len().max(1) as f64);
    Spectrum {
        power: buf[..size / 2]
            .iter()
            .map(|z| z.norm_sqr() as f64 * scale)
            .collect(),
        fft_size: size,
    }
}
