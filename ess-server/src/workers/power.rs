//! Programmable power supply driver: identity-probes a serial line for a
//! TTi CPX400SP or Rohde&Schwarz HMP4040 and dispatches channel
//! configuration/readback through the matching command dialect, grounded
//! on `PowerSupply` in `original_source/power.py`.

use ess_model::error::{EssError, Result};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use ess_core::transport::read_until;

static RE_CPX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s).*CPX400").unwrap());
static RE_HMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s).*HMP4040").unwrap());
static RE_IDN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s).*(CPX400|HMP4040)").unwrap());
static RE_FLOAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?[0-9]+(\.[0-9]*)?").unwrap());

const IDN_TIMEOUT: Duration = Duration::from_millis(500);
const READBACK_TIMEOUT: Duration = Duration::from_millis(100);

/// The two wire dialects this orchestrator knows how to speak. `PSU::connect`
/// probes `*IDN?` and picks the one that matches, per the design note on
/// instrument-variant polymorphism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsuDialect {
    Cpx400,
    Hmp4040,
}

impl PsuDialect {
    pub fn channel_count(self) -> u8 {
        match self {
            PsuDialect::Cpx400 => 1,
            PsuDialect::Hmp4040 => 4,
        }
    }
}

/// Per-channel configuration delta; any field left `None` is left
/// untouched, mirroring `config(**kwargs)`'s "only act on explicit args".
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub voltage: Option<f64>,
    pub curr_lim: Option<f64>,
    pub on: bool,
    pub off: bool,
}

pub struct PowerSupply<S> {
    stream: Mutex<S>,
    pub dialect: PsuDialect,
    pub uubch: Option<u8>,
}

impl<S> PowerSupply<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Sends `*IDN?` and dispatches on the response, matching `__init__`'s
    /// `re_cpx`/`re_hmp` branch.
    pub async fn connect(mut stream: S) -> Result<Self> {
        stream.write_all(b"*IDN?\n").await?;
        let deadline = Instant::now() + IDN_TIMEOUT;
        let resp = match read_until(&mut stream, &RE_IDN, deadline).await {
            Ok(resp) => resp,
            Err(_) => {
                // identity string didn't match within the timeout; fall
                // back to whatever plain bytes arrived so the error below
                // can still report something useful.
                let mut buf = [0u8; 128];
                let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await.unwrap_or(0);
                buf[..n].to_vec()
            }
        };
        let dialect = if RE_CPX.is_match(&resp) {
            PsuDialect::Cpx400
        } else if RE_HMP.is_match(&resp) {
            PsuDialect::Hmp4040
        } else {
            return Err(EssError::Configuration(
                "unknown power supply identity string".to_string(),
            ));
        };
        info!(?dialect, "power supply connected");
        let uubch = match dialect {
            PsuDialect::Cpx400 => Some(1),
            PsuDialect::Hmp4040 => None,
        };
        Ok(Self {
            stream: Mutex::new(stream),
            dialect,
            uubch,
        })
    }

    async fn write_cmd(&self, cmd: &str) -> Result<()> {
        let mut guard = self.stream.lock().await;
        guard.write_all(cmd.as_bytes()).await?;
        Ok(())
    }

    /// `config(**kwargs)`: channel 0 is the "default" row copied onto
    /// `uubch` wherever the caller left that channel's fields unset.
    pub async fn config(&self, mut by_channel: std::collections::HashMap<u8, ChannelConfig>) -> Result<()> {
        let default = by_channel.remove(&0).unwrap_or_default();
        if let Some(ch) = self.uubch {
            let entry = by_channel.entry(ch).or_default();
            if entry.voltage.is_none() {
                entry.voltage = default.voltage;
            }
            if entry.curr_lim.is_none() {
                entry.curr_lim = default.curr_lim;
            }
            if !entry.on {
                entry.on = default.on;
            }
            if !entry.off {
                entry.off = default.off;
            }
        }

        let off_chans: Vec<u8> = by_channel.iter().filter(|(_, c)| c.off).map(|(ch, _)| *ch).collect();
        self.output(&off_chans, false).await?;

        for (ch, cfg) in &by_channel {
            match (cfg.voltage, cfg.curr_lim) {
                (Some(v), Some(i)) => self.set_volt_curr_lim(*ch, v, i).await?,
                (Some(v), None) => self.set_voltage(*ch, v).await?,
                (None, Some(i)) => self.set_curr_lim(*ch, i).await?,
                (None, None) => {}
            }
        }

        let on_chans: Vec<u8> = by_channel.iter().filter(|(_, c)| c.on).map(|(ch, _)| *ch).collect();
        self.output(&on_chans, true).await?;
        Ok(())
    }

    async fn output(&self, chans: &[u8], state: bool) -> Result<()> {
        match self.dialect {
            PsuDialect::Hmp4040 => {
                for &ch in chans {
                    self.write_cmd(&format!("INST OUT{ch}\n")).await?;
                    self.write_cmd(&format!("OUTP:STATE {}\n", if state { "ON" } else { "OFF" })).await?;
                }
            }
            PsuDialect::Cpx400 => {
                if chans.contains(&1) {
                    self.write_cmd(&format!("OP1 {}\n", state as u8)).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn set_voltage(&self, ch: u8, value: f64) -> Result<()> {
        debug!(ch, value, "set voltage");
        match self.dialect {
            PsuDialect::Hmp4040 => {
                self.write_cmd(&format!("INST OUT{ch}\n")).await?;
                self.write_cmd(&format!("VOLT {value}\n")).await
            }
            PsuDialect::Cpx400 => self.write_cmd(&format!("V1 {value}\n")).await,
        }
    }

    pub async fn set_curr_lim(&self, ch: u8, value: f64) -> Result<()> {
        match self.dialect {
            PsuDialect::Hmp4040 => {
                self.write_cmd(&format!("INST OUT{ch}\n")).await?;
                self.write_cmd(&format!("CURR {value}\n")).await
            }
            PsuDialect::Cpx400 => self.write_cmd(&format!("I1 {value}\n")).await,
        }
    }

    pub async fn set_volt_curr_lim(&self, ch: u8, voltage: f64, curr_lim: f64) -> Result<()> {
        match self.dialect {
            PsuDialect::Hmp4040 => {
                self.write_cmd(&format!("INST OUT{ch}\n")).await?;
                self.write_cmd(&format!("APPL {voltage}, {curr_lim}\n")).await
            }
            PsuDialect::Cpx400 => {
                self.write_cmd(&format!("V1 {voltage}\n")).await?;
                self.write_cmd(&format!("I1 {curr_lim}\n")).await
            }
        }
    }

    /// Reads `(voltage, current)` for the UUB channel (or every channel
    /// when `chans` is given), matching `_readVoltCurr_{hmp,cpx}`.
    pub async fn read_volt_curr(&self, ch: u8) -> Result<(f64, f64)> {
        match self.dialect {
            PsuDialect::Hmp4040 => {
                self.write_cmd(&format!("INST OUT{ch}\n")).await?;
                self.write_cmd("MEAS:VOLT?\n").await?;
                let voltage = self.read_float_reply().await?;
                self.write_cmd("MEAS:CURR?\n").await?;
                let current = self.read_float_reply().await?;
                Ok((voltage, current))
            }
            PsuDialect::Cpx400 => {
                self.write_cmd("V1O?\n").await?;
                let voltage = self.read_float_reply().await?;
                self.write_cmd("I1O?\n").await?;
                let current = self.read_float_reply().await?;
                Ok((voltage, current))
            }
        }
    }

    async fn read_float_reply(&self) -> Result<f64> {
        let mut guard = self.stream.lock().await;
        let deadline = Instant::now() + READBACK_TIMEOUT;
        let resp = read_until(&mut *guard, &RE_FLOAT, deadline).await?;
        let text = String::from_utf8_lossy(&resp);
        let m = RE_FLOAT.find(resp.as_slice()).ok_or_else(|| {
            EssError::Transient {
                transport: "power".to_string(),
                message: format!("no float in reply {text:?}"),
            }
        })?;
        std::str::from_utf8(&resp[m.start()..m.end()])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EssError::Transient {
                transport: "power".to_string(),
                message: format!("malformed float in reply {text:?}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn connect_dispatches_hmp_dialect() {
        let (mut client_side, server_side) = duplex(256);
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            tokio::io::AsyncReadExt::read(&mut client_side, &mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut client_side, b"HMP4040, v1.0\n").await.unwrap();
        });
        let psu = PowerSupply::connect(server_side).await.unwrap();
        responder.await.unwrap();
        assert_eq!(psu.dialect, PsuDialect::Hmp4040);
        assert_eq!(psu.uubch, None);
    }
}
