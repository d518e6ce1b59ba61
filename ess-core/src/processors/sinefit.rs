//! Sine amplitude fit: for a known excitation frequency, fits the waveform
//! against a harmonic-plus-polynomial basis (`cos`, `sin`, constant, linear
//! drift) via ordinary least squares on the normal equations.

use super::require_nonempty;
use ess_model::error::{EssError, Result};
use std::f64::consts::PI;

const BASIS_SIZE: usize = 4; // cos, sin, constant, linear drift

pub struct SineFit {
    pub amplitude: f64,
    pub pedestal: f64,
}

/// Solves the small dense system `a * x = b` in place via Gaussian
/// elimination with partial pivoting. `a` is `n*n` row-major.
fn solve(mut a: Vec<f64>, mut b: Vec<f64>, n: usize) -> Result<Vec<f64>> {
    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&r1, &r2| a[r1 * n + col].abs().partial_cmp(&a[r2 * n + col].abs()).unwrap())
            .unwrap();
        if a[pivot_row * n + col].abs() < 1e-12 {
            return Err(EssError::Invariant("singular normal-equations matrix in sine fit".to_string()));
        }
        if pivot_row != col {
            for k in 0..n {
                a.swap(col * n + k, pivot_row * n + k);
            }
            b.swap(col, pivot_row);
        }
        for row in (col + 1)..n {
            let factor = a[row * n + col] / a[col * n + col];
            for k in col..n {
                a[row * n + k] -= factor * a[col * n + k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in (row + 1)..n {
            sum -= a[row * n + k] * x[k];
        }
        x[row] = sum / a[row * n + row];
    }
    Ok(x)
}

pub fn fit(samples: &[f64], sample_rate_hz: f64, frequency_hz: f64) -> Result<SineFit> {
    require_nonempty(samples)?;
    if sample_rate_hz <= 0.0 || frequency_hz <= 0.0 {
        return Err(EssError::Invariant("sine fit requires positive sample rate and frequency".to_string()));
    }

    let n = samples.len();
    let omega = 2.0 * PI * frequency_hz / sample_rate_hz;

    let basis: Vec<[f64; BASIS_SIZE]> = (0..n)
        .map(|i| {
            let t = i as f64;
            [(omega * t).cos(), (omega * t).sin(), 1.0, t]
        })
        .collect();

    let mut ata = vec![0.0; BASIS_SIZE * BASIS_SIZE];
    let mut atb = vec![0.0; BASIS_SIZE];
    for (i, row) in basis.iter().enumerate() {
        for r in 0..BASIS_SIZE {
            atb[r] += row[r] * samples[i];
            for c in 0..BASIS_SIZE {
                ata[r * BASIS_SIZE + c] += row[r] * row[c];
            }
        }
    }

    let coeffs = solve(ata, atb, BASIS_SIZE)?;
    let amplitude = (coeffs[0] * coeffs[0] + coeffs[1] * coeffs[1]).sqrt();
    let pedestal = coeffs[2];

    Ok(SineFit { amplitude, pedestal })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_amplitude_and_pedestal_from_synthetic_sine() {
        let sample_rate = 1000.0;
        let freq = 50.0;
        let amplitude = 3.0;
        let pedestal = 1.5;
        let samples: Vec<f64> = (0..2000)
            .map(|i| pedestal + amplitude * (2.0 * PI * freq * i as f64 / sample_rate).sin())
            .collect();
        let fit = fit(&samples, sample_rate, freq).unwrap();
        assert!((fit.amplitude - amplitude).abs() < 1e-6);
        assert!((fit.pedestal - pedestal).abs() < 1e-6);
    }

    #[test]
    fn rejects_non_positive_frequency() {
        let err = fit(&[1.0, 2.0, 3.0], 1000.0, 0.0).unwrap_err();
        assert!(matches!(err, EssError::Invariant(_)));
    }
}
