//! UUB Zynq-temperature + slow-control readout, grounded on `UUBtsc.run` in
//! `original_source/UUB.py`.
//!
//! `readSlowControl`'s regex in the source is textually identical to
//! `readZynqTemp`'s — both match only `Zynq temperature: <float> degrees`.
//! This is reproduced verbatim here rather than "fixed": the slow-control
//! parse only ever succeeds against a Zynq-temperature-shaped response,
//! per the documented Open Question.

use once_cell::sync::Lazy;
use regex::Regex;

use ess_core::scheduler::STOP_FLAG;
use ess_model::error::{EssError, Result};
use ess_model::record::PartialRecord;
use tracing::warn;

use crate::workers::WorkerContext;

/// Plain (non-mTLS) HTTP GET to a UUB's `cgi-bin/getdata.cgi` endpoint,
/// matching `httplib.HTTPConnection` in `UUBtsc.run` — a different wire
/// interface from the central database's mutual-TLS upload client.
async fn uub_get(client: &reqwest::Client, ip: &str, query: &str) -> Result<String> {
    let url = format!("http://{ip}:8080/cgi-bin/getdata.cgi?{query}");
    let resp = client.get(&url).send().await.map_err(|e| EssError::Transient {
        transport: "uub-http".to_string(),
        message: format!("GET {url} failed: {e}"),
    })?;
    resp.text().await.map_err(|e| EssError::Transient {
        transport: "uub-http".to_string(),
        message: format!("reading body from {url} failed: {e}"),
    })
}

static RE_ZYNQTEMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Zynq temperature: (?P<zt>[+-]?\d+(\.\d*)?) degrees").unwrap());
/// Identical pattern to `RE_ZYNQTEMP` — see module docs.
static RE_SLOWCONTROL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Zynq temperature: (?P<zt>[+-]?\d+(\.\d*)?) degrees").unwrap());

fn ip_for_uubnum(uubnum: u32) -> String {
    format!("192.168.{}.{}", 31 + (uubnum >> 8), uubnum & 0xFF)
}

fn parse_zynq_temp(uubnum: u32, body: &str) -> Option<PartialRecord> {
    let caps = RE_ZYNQTEMP.captures(body)?;
    let value: f64 = caps["zt"].parse().ok()?;
    let mut record = PartialRecord::new();
    record.insert(format!("zynq{uubnum:04}_temp"), value);
    Some(record)
}

/// Reproduces `readSlowControl` exactly: same regex, so the only field
/// ever extracted is `zt`, prefixed `sc<uubnum>_zt` instead of the
/// per-variable keys a correct slow-control parse would produce.
fn parse_slow_control(uubnum: u32, body: &str) -> Option<PartialRecord> {
    let caps = RE_SLOWCONTROL.captures(body)?;
    let value: f64 = caps["zt"].parse().ok()?;
    let mut record = PartialRecord::new();
    record.insert(format!("sc{uubnum:04}_zt"), value);
    Some(record)
}

/// Runs the per-UUB HTTP poll loop until the tick broadcast closes.
pub async fn run(ctx: WorkerContext, uubnum: u32, client: reqwest::Client) -> Result<()> {
    let ip = ip_for_uubnum(uubnum);
    let mut rx = ctx.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(uubnum, skipped, "uub worker lagged behind tick broadcast");
                continue;
            }
        };
        if event.has_flag(STOP_FLAG) {
            return Ok(());
        }
        let want_temp = event.has_flag("meas.thp");
        let want_sc = event.has_flag("meas.sc");
        if !want_temp && !want_sc {
            continue;
        }

        let mut record = PartialRecord::with_timestamp(event.timestamp);
        let mut got_anything = false;

        if want_temp {
            match uub_get(&client, &ip, "action=xadc").await {
                Ok(text) => {
                    if let Some(parsed) = parse_zynq_temp(uubnum, &text) {
                        for (k, v) in parsed.fields {
                            record.fields.insert(k, v);
                        }
                        got_anything = true;
                    } else {
                        warn!(uubnum, "xadc response did not match Zynq temperature pattern");
                    }
                }
                Err(err) => warn!(uubnum, error = %err, "xadc request failed"),
            }
        }

        if want_sc {
            match uub_get(&client, &ip, "action=slowc&arg1=-a").await {
                Ok(text) => {
                    if let Some(parsed) = parse_slow_control(uubnum, &text) {
                        for (k, v) in parsed.fields {
                            record.fields.insert(k, v);
                        }
                        got_anything = true;
                    } else {
                        warn!(uubnum, "slowc response did not match the (Zynq-temperature-shaped) parse pattern");
                    }
                }
                Err(err) => warn!(uubnum, error = %err, "slowc request failed"),
            }
        }

        if got_anything && ctx.response_tx.send(record).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_control_regex_is_identical_to_zynq_temp_regex() {
        assert_eq!(RE_ZYNQTEMP.as_str(), RE_SLOWCONTROL.as_str());
    }

    #[test]
    fn slow_control_only_parses_zynq_temperature_shaped_bodies() {
        let real_slowcontrol_dump = "sc_voltage: 3.3V\nsc_current: 120mA\n";
        assert!(parse_slow_control(12, real_slowcontrol_dump).is_none());

        let zynq_shaped = "Zynq temperature: 42.5 degrees\n";
        let rec = parse_slow_control(12, zynq_shaped).unwrap();
        assert_eq!(rec.fields.get("sc0012_zt").and_then(|v| v.as_f64()), Some(42.5));
    }

    #[test]
    fn ip_derivation_matches_reserved_offset_scheme() {
        assert_eq!(ip_for_uubnum(12), "192.168.31.12");
        assert_eq!(ip_for_uubnum(300), "192.168.32.44");
    }
}
