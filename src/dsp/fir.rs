//! FIR filter design: windowed-sinc lowpass and the window functions used
//! for tone templates.

use num_complex::Complex32;

/// Blackman window value at position n of N.
pub fn blackman(n: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }
    let x = n as f32 / (len - 1) as f32;
    0.42 - 0.5 * (2.0 * std::f32::consts::PI * x).cos()
        + 0.08 * (4.0 * std::f32::consts::PI * x).cos()
}

/// Tukey (tapered cosine) window value at position n of N.
/// `alpha` is the fraction of the window inside the cosine tapers.
pub fn tukey(n: usize, len: usize, alpha: f32) -> f32 {
    if len <= 1 {
        return 1.0;
    }
    let x = n as f32 / (len - 1) as f32;
    let a = alpha.clamp(0.0, 1.0);
    if a == 0.0 {
        return 1.0;
    }
    if x < a / 2.0 {
        0.5 * (1.0 + (2.0 * std::f32::consts::PI / a * (x - a / 2.0)).cos())
    } else if x > 1.0 - a / 2.0 {
        0.5 * (1.0 + (2.0 * std::f32::consts::PI / a * (x - 1.0 + a / 2.0)).cos())
    } else {
        1.0
    }
}

/// Design a lowpass FIR by the windowed-sinc method with a Blackman window.
///
/// `cutoff` is the passband edge, `transition` the width to the stopband
/// edge, both in Hz at `sample_rate`. Blackman sidelobes give > 70 dB of
/// stopband rejection. Tap count is odd so the group delay is an integer
/// number of samples.
pub fn low_pass(sample_rate: f64, cutoff: f64, transition: f64) -> Vec<f32> {
    let df = (transition / sample_rate).max(1e-6);
    let mut ntaps = (5.5 / df).ceil() as usize;
    if ntaps % 2 == 0 {
        ntaps += 1;
    }
    // Place the -6 dB point mid-transition
    let fc = (cutoff + transition / 2.0) / sample_rate;
    let mid = (ntaps - 1) as f64 / 2.0;

    let mut taps = Vec::with_capacity(ntaps);
    for n in 0..ntaps {
        let x = n as f64 - mid;
        let sinc = if x == 0.0 {
            2.0 * fc
        } else {
            (2.0 * std::f64::consts::PI * fc * x).sin() / (std::f64::consts::PI * x)
        };
        taps.push(sinc as f32 * blackman(n, ntaps));
    }
    // Unity DC gain
    let sum: f32 = taps.iter().sum();
    if sum.abs() > 1e-12 {
        for t in taps.iter_mut() {
            *t /= sum;
        }
    }
    taps
}

/// Convolve a real signal with `taps`, producing a same-length output with
/// the filter group delay compensated (zero-padded edges).
pub fn filter_same(x: &[f32], taps: &[f32]) -> Vec<f32> {
    let half = (taps.len() - 1) / 2;
    let mut out = vec![0.0f32; x.len()];
    for (i, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for (k, &t) in taps.iter().enumerate() {
            let idx = i as isize + half as isize - k as isize;
            if idx >= 0 && (idx as usize) < x.len() {
                acc += t * x[idx as usize];
            }
        }
        *o = acc;
    }
    out
}

/// Filter and decimate a complex signal in one pass, computing only the
/// retained outputs. Group delay is compensated so output sample m aligns
/// with input sample m*factor.
pub fn filter_decimate(x: &[Complex32], taps: &[f32], factor: usize) -> Vec<Complex32> {
    let half = (taps.len() - 1) / 2;
    let out_len = x.len() / factor;
    let mut out = Vec::with_capacity(out_len);
    for m in 0..out_len {
        let center = m * factor;
        let mut acc = Complex32::new(0.0, 0.0);
        for (k, &t) in taps.iter().enumerate() {
            let idx = center as isize + half as isize - k as isize;
            if idx >= 0 && (idx as usize) < x.len() {
                acc += x[idx as usize] * t;
            }
        }
        out.push(acc);
    }
    out
}

/// Real-valued variant of [`filter_decimate`].
pub fn filter_decimate_real(x: &[f32], taps: &[f32], factor: usize) -> Vec<f32> {
    let half = (taps.len() - 1) / 2;
    let out_len = x.len() / factor;
    let mut out = Vec::with_capacity(out_len);
    for m in 0..out_len {
        let center = m * factor;
        let mut acc = 0.0f32;
        for (k, &t) in taps.iter().enumerate() {
            let idx = center as isize + half as isize - k as isize;
            if idx >= 0 && (idx as usize) < x.len() {
                acc += x[idx as usize] * t;
            }
        }
        out.push(acc);
    }
    out
}
