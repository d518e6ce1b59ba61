//! Data-processor worker pool: numerical reductions over raw waveform
//! buffers, consumed from a dedicated queue and pushed back as scalar
//! records onto the response queue. Pool sizing and the fixed-worker-pool
//! shape are grounded on `ferrex-server/src/transcoding/queue.rs`'s
//! `JobQueue`/`JobQueueHandle`.

pub mod derived;
pub mod halfsine;
pub mod pedestal;
pub mod sinefit;

use std::sync::Arc;

use ess_model::error::{EssError, Result};
use ess_model::record::PartialRecord;
use tokio::sync::mpsc;
use tracing::error;

/// A raw waveform capture for one UUB/channel pair, ready for numerical
/// reduction. `samples` is row-major `(n_points, n_channels)`, matching the
/// oscilloscope's `CURVE?` transfer shape after unit conversion.
#[derive(Debug, Clone)]
pub struct WaveformJob {
    pub uubnum: u32,
    pub chan: u32,
    pub label_prefix: String,
    pub samples: Arc<Vec<f64>>,
    pub sample_rate_hz: f64,
    pub kind: ReductionKind,
}

#[derive(Debug, Clone)]
pub enum ReductionKind {
    Pedestal { bin_window: usize },
    HalfSine { n_coeff: usize },
    Sine { frequency_hz: f64 },
}

fn label(prefix: &str, uubnum: u32, chan: u32, suffix: &str) -> String {
    format!("{prefix}_u{uubnum:04}_c{chan}_{suffix}")
}

fn reduce(job: &WaveformJob) -> Result<PartialRecord> {
    let mut record = PartialRecord::new();
    match &job.kind {
        ReductionKind::Pedestal { bin_window } => {
            let (mean, stdev) = pedestal::pedestal(&job.samples, *bin_window)?;
            record.insert(label(&job.label_prefix, job.uubnum, job.chan, "ped"), mean);
            record.insert(label(&job.label_prefix, job.uubnum, job.chan, "pedstdev"), stdev);
        }
        ReductionKind::HalfSine { n_coeff } => {
            let fit = halfsine::fit(&job.samples, *n_coeff)?;
            record.insert(label(&job.label_prefix, job.uubnum, job.chan, "amp"), fit.amplitude);
            record.insert(label(&job.label_prefix, job.uubnum, job.chan, "ped"), fit.pedestal);
            record.insert(label(&job.label_prefix, job.uubnum, job.chan, "phase"), fit.phase);
        }
        ReductionKind::Sine { frequency_hz } => {
            let fit = sinefit::fit(&job.samples, job.sample_rate_hz, *frequency_hz)?;
            record.insert(label(&job.label_prefix, job.uubnum, job.chan, "amp"), fit.amplitude);
            record.insert(label(&job.label_prefix, job.uubnum, job.chan, "ped"), fit.pedestal);
        }
    }
    Ok(record)
}

/// Fixed-size pool of Tokio tasks draining `rx`, pushing each job's scalar
/// result onto `response_tx`. Pool size defaults to `num_cpus::get() - 2`,
/// clamped to at least one worker.
pub fn spawn_pool(worker_count: Option<usize>, rx: mpsc::Receiver<WaveformJob>, response_tx: mpsc::Sender<PartialRecord>) -> Vec<tokio::task::JoinHandle<()>> {
    let count = worker_count.unwrap_or_else(default_pool_size);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..count)
        .map(|_| {
            let rx = rx.clone();
            let response_tx = response_tx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else { return };
                    match reduce(&job) {
                        Ok(record) => {
                            if response_tx.send(record).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => error!(uubnum = job.uubnum, chan = job.chan, error = %err, "waveform reduction failed"),
                    }
                }
            })
        })
        .collect()
}

pub fn default_pool_size() -> usize {
    num_cpus::get().saturating_sub(2).max(1)
}

pub(crate) fn mean_stdev(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

pub(crate) fn require_nonempty(samples: &[f64]) -> Result<()> {
    if samples.is_empty() {
        return Err(EssError::Invariant("empty waveform buffer".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_stdev_matches_hand_computation() {
        let (mean, stdev) = mean_stdev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((stdev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn default_pool_size_is_at_least_one() {
        assert!(default_pool_size() >= 1);
    }
}
