//! Pedestal reduction: mean and stdev over a configured bin window at the
//! start of a waveform, the baseline offset against which an amplitude fit
//! is later measured.

use super::{mean_stdev, require_nonempty};
use ess_model::error::{EssError, Result};

pub fn pedestal(samples: &[f64], bin_window: usize) -> Result<(f64, f64)> {
    require_nonempty(samples)?;
    if bin_window == 0 {
        return Err(EssError::Invariant("pedestal bin_window must be non-zero".to_string()));
    }
    let window = bin_window.min(samples.len());
    Ok(mean_stdev(&samples[..window]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pedestal_over_leading_window() {
        let samples = vec![1.0, 1.0, 1.0, 1.0, 100.0, 100.0];
        let (mean, stdev) = pedestal(&samples, 4).unwrap();
        assert_eq!(mean, 1.0);
        assert_eq!(stdev, 0.0);
    }

    #[test]
    fn window_larger_than_buffer_clamps() {
        let samples = vec![2.0, 4.0];
        let (mean, _) = pedestal(&samples, 100).unwrap();
        assert_eq!(mean, 3.0);
    }

    #[test]
    fn zero_window_is_an_invariant_violation() {
        let err = pedestal(&[1.0], 0).unwrap_err();
        assert!(matches!(err, EssError::Invariant(_)));
    }
}
