//! Half-sine amplitude fit: projects a waveform onto the first `K` Fourier
//! coefficients of the five-half-sine pulse shape used by the AFG's
//! "pulse" burst mode, then derives amplitude, pedestal and phase from
//! closed-form formulas over those coefficients rather than a full
//! nonlinear fit.

use super::require_nonempty;
use ess_model::error::{EssError, Result};
use std::f64::consts::PI;

pub struct HalfSineFit {
    pub amplitude: f64,
    pub pedestal: f64,
    pub phase: f64,
}

/// Discrete Fourier coefficient at harmonic `k` of an `N`-sample buffer:
/// `C_k = sum_n x_n * exp(-2*pi*i*k*n/N)`, returned as `(real, imag)`.
fn dft_coeff(samples: &[f64], k: usize) -> (f64, f64) {
    let n = samples.len() as f64;
    let (mut re, mut im) = (0.0, 0.0);
    for (idx, &x) in samples.iter().enumerate() {
        let theta = -2.0 * PI * (k as f64) * (idx as f64) / n;
        re += x * theta.cos();
        im += x * theta.sin();
    }
    (re, im)
}

/// Adjusts each phase by a multiple of `2*pi` so consecutive differences
/// stay within `pi`, matching `numpy.unwrap`'s behavior.
fn unwrap(phases: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phases.len());
    let mut offset = 0.0;
    let mut prev = None;
    for &p in phases {
        let mut adjusted = p + offset;
        if let Some(prev_val) = prev {
            let diff: f64 = adjusted - prev_val;
            if diff > PI {
                offset -= 2.0 * PI;
                adjusted -= 2.0 * PI;
            } else if diff < -PI {
                offset += 2.0 * PI;
                adjusted += 2.0 * PI;
            }
        }
        out.push(adjusted);
        prev = Some(adjusted);
    }
    out
}

/// Ordinary least-squares slope and intercept of `y` against `x`.
fn linregress(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        num += (xi - mean_x) * (yi - mean_y);
        den += (xi - mean_x).powi(2);
    }
    let slope = if den.abs() < 1e-12 { 0.0 } else { num / den };
    let intercept = mean_y - slope * mean_x;
    (slope, intercept)
}

pub fn fit(samples: &[f64], n_coeff: usize) -> Result<HalfSineFit> {
    require_nonempty(samples)?;
    if n_coeff == 0 {
        return Err(EssError::Invariant("half-sine fit requires n_coeff > 0".to_string()));
    }
    let n = samples.len();
    if n_coeff >= n / 2 {
        return Err(EssError::Invariant(format!(
            "n_coeff {n_coeff} leaves too few samples ({n}) for a meaningful projection"
        )));
    }

    let pedestal = samples.iter().sum::<f64>() / n as f64;

    let mut amplitudes = Vec::with_capacity(n_coeff);
    let mut raw_phases = Vec::with_capacity(n_coeff);
    for k in 1..=n_coeff {
        let (re, im) = dft_coeff(samples, k);
        amplitudes.push(2.0 / n as f64 * (re * re + im * im).sqrt());
        raw_phases.push(im.atan2(re));
    }

    let amplitude = (amplitudes.iter().map(|a| a * a).sum::<f64>()).sqrt();

    let harmonics: Vec<f64> = (1..=n_coeff).map(|k| k as f64).collect();
    let unwrapped = unwrap(&raw_phases);
    let (slope, _intercept) = linregress(&harmonics, &unwrapped);

    Ok(HalfSineFit {
        amplitude,
        pedestal,
        phase: slope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_half_sine(n: usize, amplitude: f64, pedestal: f64, periods: f64) -> Vec<f64> {
        (0..n)
            .map(|i| pedestal + amplitude * (2.0 * PI * periods * i as f64 / n as f64).sin().abs())
            .collect()
    }

    #[test]
    fn recovers_pedestal_from_synthetic_pulse() {
        let samples = synth_half_sine(256, 10.0, 5.0, 5.0);
        let fit = fit(&samples, 6).unwrap();
        assert!((fit.pedestal - 5.0).abs() < 0.6);
        assert!(fit.amplitude > 0.0);
    }

    #[test]
    fn rejects_too_few_samples_for_coefficient_count() {
        let err = fit(&[1.0, 2.0, 3.0], 5).unwrap_err();
        assert!(matches!(err, EssError::Invariant(_)));
    }

    #[test]
    fn unwrap_removes_artificial_jumps() {
        let phases = vec![3.0, -3.1, -3.0];
        let unwrapped = unwrap(&phases);
        assert!((unwrapped[1] - 3.183185307).abs() < 1e-6);
    }
}
