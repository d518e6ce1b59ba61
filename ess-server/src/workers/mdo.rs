//! MDO oscilloscope waveform capture worker, grounded on `MDO.readWFM` in
//! `original_source/mdo.py`.
//!
//! The waveform preamble (`WFMOUTPRE?`) is text and newline-framed, so it
//! goes through `TekTransport::send_query`. The sample block itself is a
//! binary IEEE-488.2 definite-length block (`#<d><len><bytes>`) that can
//! legitimately contain `\n`, so it is read with
//! `StreamTekTransport::read_raw` instead.

use std::collections::HashMap;
use std::sync::Arc;

use ess_core::processors::{ReductionKind, WaveformJob};
use ess_core::scheduler::STOP_FLAG;
use ess_core::transport::tek::{StreamTekTransport, TekTransport};
use ess_model::error::{EssError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::warn;

use super::WorkerContext;

#[derive(Debug, Clone, Copy)]
struct WfmPreamble {
    byt_nr: usize,
    x_zero: f64,
    x_incr: f64,
    y_zero: f64,
    y_mult: f64,
    y_off: f64,
}

/// Parses `WFMOUTPRE?`'s `key value` / `key value;key value` reply. The
/// scope answers with semicolon-separated `KEY VALUE` pairs after `HEADER
/// 1` is set; only the fields needed for unit conversion are extracted.
fn parse_preamble(reply: &str) -> Result<WfmPreamble> {
    let mut fields: HashMap<String, String> = HashMap::new();
    for part in reply.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((key, value)) = part.split_once(' ') {
            fields.insert(key.trim().to_uppercase(), value.trim().to_string());
        }
    }

    let get = |key: &str| -> Result<String> {
        fields
            .get(key)
            .cloned()
            .ok_or_else(|| EssError::Protocol {
                transport: "mdo".to_string(),
                code: 0,
                message: format!("WFMOUTPRE? reply missing {key}"),
            })
    };
    let get_f64 = |key: &str| -> Result<f64> {
        get(key)?.parse::<f64>().map_err(|e| EssError::Protocol {
            transport: "mdo".to_string(),
            code: 0,
            message: format!("WFMOUTPRE? field {key} is not numeric: {e}"),
        })
    };

    Ok(WfmPreamble {
        byt_nr: get_f64("BYT_NR")? as usize,
        x_zero: get_f64("XZERO")?,
        x_incr: get_f64("XINCR")?,
        y_zero: get_f64("YZERO")?,
        y_mult: get_f64("YMULT")?,
        y_off: get_f64("YOFF")?,
    })
}

/// Decodes the `CURVE?` binary block into physical-unit samples.
/// `y = YZERO + YMULT * (raw - YOFF)`, matching `readWFM`'s conversion.
fn decode_samples(raw: &[u8], preamble: &WfmPreamble) -> Vec<f64> {
    raw.chunks_exact(preamble.byt_nr.max(1))
        .map(|chunk| {
            let raw_val = match preamble.byt_nr {
                1 => chunk[0] as i64 as f64,
                2 => i16::from_be_bytes([chunk[0], chunk[1]]) as f64,
                _ => i16::from_be_bytes([chunk[0], chunk[1]]) as f64,
            };
            preamble.y_zero + preamble.y_mult * (raw_val - preamble.y_off)
        })
        .collect()
}

/// Reads one channel's waveform: issues `DATA:SOURCE`, fetches the
/// preamble, then the binary curve block per the `#<d><len>` header that
/// `readWFM` parses with two raw single-byte reads before the length
/// digits and data payload.
pub async fn read_waveform<S>(transport: &mut StreamTekTransport<S>, chan: u32) -> Result<(WfmPreamble, Vec<f64>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    transport.send(&format!("data:source ch{chan}")).await?;
    transport.send("header 1").await?;
    let preamble_reply = transport.send_query("wfmoutpre?").await?;
    transport.send("header 0").await?;
    let preamble = parse_preamble(&preamble_reply)?;

    transport.send("curve?").await?;
    let header = transport.read_raw(2).await?;
    if header.first() != Some(&b'#') {
        return Err(EssError::Protocol {
            transport: "mdo".to_string(),
            code: 0,
            message: format!("CURVE? reply missing '#' block header, got {header:?}"),
        });
    }
    let ndigits = (header[1] as char)
        .to_digit(10)
        .ok_or_else(|| EssError::Protocol {
            transport: "mdo".to_string(),
            code: 0,
            message: "CURVE? block length-digit-count is not a digit".to_string(),
        })? as usize;

    let len_digits = transport.read_raw(ndigits).await?;
    let len: usize = std::str::from_utf8(&len_digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EssError::Protocol {
            transport: "mdo".to_string(),
            code: 0,
            message: "CURVE? block length is not valid decimal".to_string(),
        })?;

    let raw = transport.read_raw(len).await?;
    let _eol = transport.read_raw(1).await?;

    let samples = decode_samples(&raw, &preamble);
    Ok((preamble, samples))
}

/// Captures waveforms on `channels` and pushes one `WaveformJob` per
/// channel whenever a tick carries the `meas.pulse` flag, matching
/// `AnalyzerThread`'s per-trigger capture-and-reduce cycle for the
/// ESS oscilloscope.
pub async fn run<S>(
    ctx: WorkerContext,
    mut transport: StreamTekTransport<S>,
    uubnum: u32,
    channels: Vec<u32>,
    sample_rate_hz: f64,
    job_tx: mpsc::Sender<WaveformJob>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut rx = ctx.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "mdo worker lagged behind tick broadcast");
                continue;
            }
        };
        if event.has_flag(STOP_FLAG) {
            return Ok(());
        }
        if !event.has_flag("meas.pulse") {
            continue;
        }

        for &chan in &channels {
            match read_waveform(&mut transport, chan).await {
                Ok((_preamble, samples)) => {
                    let job = WaveformJob {
                        uubnum,
                        chan,
                        label_prefix: "scope".to_string(),
                        samples: Arc::new(samples),
                        sample_rate_hz,
                        kind: ReductionKind::HalfSine { n_coeff: 4 },
                    };
                    if job_tx.send(job).await.is_err() {
                        return Ok(());
                    }
                }
                Err(err) => warn!(uubnum, chan, error = %err, "waveform capture failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_preamble_extracts_unit_conversion_fields() {
        let reply = "BYT_NR 2;BIT_NR 16;ENCDG BIN;BYT_OR MSB;XUNIT \"s\";XZERO -1.0E-6;XINCR 4.0E-10;YUNIT \"V\";YZERO 0.0;YMULT 3.125E-4;YOFF 0.0";
        let preamble = parse_preamble(reply).unwrap();
        assert_eq!(preamble.byt_nr, 2);
        assert!((preamble.x_incr - 4.0e-10).abs() < 1e-15);
        assert!((preamble.y_mult - 3.125e-4).abs() < 1e-9);
    }

    #[test]
    fn decode_samples_applies_yzero_ymult_yoff() {
        let preamble = WfmPreamble {
            byt_nr: 2,
            x_zero: 0.0,
            x_incr: 1.0,
            y_zero: 1.0,
            y_mult: 0.5,
            y_off: 10.0,
        };
        let raw = 20i16.to_be_bytes();
        let samples = decode_samples(&raw, &preamble);
        assert_eq!(samples.len(), 1);
        assert!((samples[0] - (1.0 + 0.5 * (20.0 - 10.0))).abs() < 1e-9);
    }
}
