//! Derived filters computed over already-reduced scalar measurements
//! rather than raw waveforms: linearity, cutoff frequency, and
//! repeated-measurement statistics.

use ess_model::error::{EssError, Result};

use super::mean_stdev;

/// Gain (slope) and Pearson correlation coefficient of `gain = f(voltage)`
/// over a swept-voltage series.
pub struct Linearity {
    pub gain: f64,
    pub correlation: f64,
}

pub fn linearity(voltages: &[f64], amplitudes: &[f64]) -> Result<Linearity> {
    if voltages.len() != amplitudes.len() || voltages.len() < 2 {
        return Err(EssError::Invariant(
            "linearity requires matching voltage/amplitude series of at least two points".to_string(),
        ));
    }
    let n = voltages.len() as f64;
    let mean_v = voltages.iter().sum::<f64>() / n;
    let mean_a = amplitudes.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_v = 0.0;
    let mut var_a = 0.0;
    for (v, a) in voltages.iter().zip(amplitudes) {
        cov += (v - mean_v) * (a - mean_a);
        var_v += (v - mean_v).powi(2);
        var_a += (a - mean_a).powi(2);
    }

    if var_v.abs() < 1e-12 {
        return Err(EssError::Invariant("linearity requires voltage variation across the sweep".to_string()));
    }

    let gain = cov / var_v;
    let correlation = if var_a.abs() < 1e-12 { 0.0 } else { cov / (var_v.sqrt() * var_a.sqrt()) };

    Ok(Linearity { gain, correlation })
}

/// First frequency in `(frequency_hz, gain)` pairs (assumed ascending in
/// frequency) at which gain falls below `threshold`, interpolated linearly
/// between the bracketing points. `None` if gain never falls below
/// threshold within the sweep.
pub fn cutoff(frequency_gain: &[(f64, f64)], threshold: f64) -> Option<f64> {
    for pair in frequency_gain.windows(2) {
        let (f0, g0) = pair[0];
        let (f1, g1) = pair[1];
        if g0 >= threshold && g1 < threshold {
            if (g0 - g1).abs() < 1e-12 {
                return Some(f1);
            }
            let frac = (g0 - threshold) / (g0 - g1);
            return Some(f0 + frac * (f1 - f0));
        }
    }
    None
}

/// Mean and stdev across repeated measurements of the same quantity.
pub fn statistics(values: &[f64]) -> Result<(f64, f64)> {
    if values.is_empty() {
        return Err(EssError::Invariant("statistics requires at least one sample".to_string()));
    }
    Ok(mean_stdev(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linearity_recovers_exact_gain_and_perfect_correlation() {
        let voltages = vec![0.0, 1.0, 2.0, 3.0];
        let amplitudes: Vec<f64> = voltages.iter().map(|v| 2.5 * v + 1.0).collect();
        let fit = linearity(&voltages, &amplitudes).unwrap();
        assert!((fit.gain - 2.5).abs() < 1e-9);
        assert!((fit.correlation - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cutoff_interpolates_between_bracketing_points() {
        let sweep = vec![(10.0, 1.0), (20.0, 0.8), (30.0, 0.4), (40.0, 0.1)];
        let f = cutoff(&sweep, 0.5).unwrap();
        assert!((f - 25.0).abs() < 1e-9);
    }

    #[test]
    fn cutoff_is_none_when_never_crossed() {
        let sweep = vec![(10.0, 1.0), (20.0, 0.9)];
        assert!(cutoff(&sweep, 0.5).is_none());
    }

    #[test]
    fn statistics_matches_mean_stdev() {
        let (mean, stdev) = statistics(&[1.0, 2.0, 3.0]).unwrap();
        assert!((mean - 2.0).abs() < 1e-9);
        assert!(stdev > 0.0);
    }
}
