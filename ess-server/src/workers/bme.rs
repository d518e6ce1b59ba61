//! BME280/DS18B20 thermal-hygrometer worker, grounded on `BME.run` in
//! `original_source/BME.py`: on `meas.thp` (and the pulse/freq measurement
//! flags) it writes a single-byte measure command and parses the reply
//! line against a fixed regex.

use std::sync::Arc;

use ess_model::error::Result;
use ess_model::record::PartialRecord;
use ess_model::tick::TickEvent;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::workers::WorkerContext;
use ess_core::scheduler::STOP_FLAG;
use ess_core::transport::read_until;

static RE_BMEMEAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s).*(?P<dt>20\d{2}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}) +(?P<temp1>-?\d+(\.\d*)?).* +(?P<humid1>\d+(\.\d*)?).* +(?P<press1>\d+(\.\d*)?).* +(?P<temp2>-?\d+(\.\d*)?).* +(?P<humid2>\d+(\.\d*)?).* +(?P<press2>\d+(\.\d*)?)[\r\n]*",
    )
    .expect("static BME regex")
});

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const MEASURE_FLAGS: [&str; 3] = ["meas.thp", "meas.pulse", "meas.freq"];

fn parse_bme_line(line: &[u8]) -> Option<PartialRecord> {
    let caps = RE_BMEMEAS.captures(line)?;
    let mut record = PartialRecord::new();
    for name in ["temp1", "humid1", "press1", "temp2", "humid2", "press2"] {
        let value: f64 = std::str::from_utf8(&caps[name]).ok()?.parse().ok()?;
        record.insert(format!("bme_{name}"), value);
    }
    Some(record)
}

/// Runs until the tick broadcast closes (campaign stop). `stream` is the
/// Arduino's serial line, already opened and time-synced by the caller.
pub async fn run<S>(ctx: WorkerContext, mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut rx = ctx.subscribe();
    loop {
        let event: Arc<TickEvent> = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "bme worker lagged behind tick broadcast");
                continue;
            }
        };
        if event.has_flag(STOP_FLAG) {
            return Ok(());
        }
        if !MEASURE_FLAGS.iter().any(|f| event.has_flag(f)) {
            continue;
        }
        if let Err(err) = stream.write_all(b"m").await {
            warn!(error = %err, "bme write failed");
            continue;
        }
        let deadline = Instant::now() + READ_TIMEOUT;
        let resp = match read_until(&mut stream, &RE_BMEMEAS, deadline).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(error = %err, "bme read timed out");
                continue;
            }
        };
        let Some(mut record) = parse_bme_line(&resp) else {
            warn!("bme response did not match expected measurement line");
            continue;
        };
        record.insert("timestamp", ess_model::FieldValue::Timestamp(event.timestamp));
        debug!(?event.timestamp, "bme measurement");
        if ctx.response_tx.send(record).await.is_err() {
            return Ok(());
        }
    }
}
