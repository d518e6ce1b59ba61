//! Relay-bank power-control driver, grounded on `PowerControl` in
//! `original_source/BME.py`: a line-oriented serial protocol addressing up
//! to ten channels by port index, switched on/off with a single ASCII
//! command and acknowledged with a trailing `OK`.

use std::collections::HashMap;

use async_trait::async_trait;
use ess_contracts::power_control::PowerControlDriver;
use ess_model::error::{EssError, Result};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, Instant};

use crate::transport::read_until;

/// Matches `PowerControl.NCHANS` in the source.
pub const NCHANS: usize = 10;

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CURRENTS_TIMEOUT: Duration = Duration::from_secs(8);

static RE_SET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s).*OK").expect("static power-control regex"));
static RE_READCURR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?s).*?{}OK", r"(-?\d+\.?\d*)\s+".repeat(NCHANS))).expect("static power-control regex")
});
static RE_READRELAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s).*?([01]{10})\s*OK").expect("static power-control regex"));

/// Serial-backed relay bank. `uubnums` fixes which campaign UUB sits on
/// which physical port, in connection order, matching the constructor's
/// `{uubnum: port for port, uubnum in enumerate(uubnums)}` mapping.
pub struct SerialPowerControl<S> {
    serial: S,
    ports: HashMap<u32, u8>,
}

impl<S> SerialPowerControl<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `serial` must already be time-synced and past the Arduino's reset
    /// delay; the source sleeps 0.5s post-open for the same reason, which
    /// is the caller's responsibility here rather than the driver's.
    pub fn new(serial: S, uubnums: &[Option<u32>]) -> Result<Self> {
        if uubnums.len() > NCHANS {
            return Err(EssError::Configuration(format!("power control supports at most {NCHANS} channels, got {}", uubnums.len())));
        }
        let ports = uubnums
            .iter()
            .enumerate()
            .filter_map(|(port, uubnum)| uubnum.map(|n| (n, port as u8)))
            .collect();
        Ok(Self { serial, ports })
    }

    fn portmask_for(&self, uubnums: &[u32]) -> Result<u16> {
        let mut mask: u16 = 0;
        for uubnum in uubnums {
            let port = self.ports.get(uubnum).ok_or_else(|| EssError::Configuration(format!("unknown uubnum {uubnum} in power control")))?;
            mask |= 1 << port;
        }
        Ok(mask)
    }

    async fn send_command(&mut self, cmd: String, pattern: &Regex, timeout: Duration) -> Result<Vec<u8>> {
        self.serial.write_all(cmd.as_bytes()).await.map_err(EssError::Io)?;
        let deadline = Instant::now() + timeout;
        read_until(&mut self.serial, pattern, deadline).await
    }

    /// Reads currents [mA] for all ten channels, matching `_readCurrents`.
    pub async fn read_currents(&mut self) -> Result<[f64; NCHANS]> {
        let resp = self.send_command("r\r".to_string(), &RE_READCURR, READ_CURRENTS_TIMEOUT).await?;
        let caps = RE_READCURR.captures(&resp).ok_or_else(|| EssError::Protocol {
            transport: "power-control".to_string(),
            code: 0,
            message: "currents reply did not match expected format".to_string(),
        })?;
        let mut out = [0.0; NCHANS];
        for (i, slot) in out.iter_mut().enumerate() {
            let text = std::str::from_utf8(&caps[i + 1]).map_err(|_| EssError::Protocol {
                transport: "power-control".to_string(),
                code: 0,
                message: "non-UTF8 current reading".to_string(),
            })?;
            *slot = text.parse().map_err(|_| EssError::Protocol {
                transport: "power-control".to_string(),
                code: 0,
                message: format!("unparseable current reading {text:?}"),
            })?;
        }
        Ok(out)
    }

    /// Reads relay state, returning `(uubsOn, uubsOff)` matching `relays`.
    pub async fn relays(&mut self) -> Result<(Vec<u32>, Vec<u32>)> {
        let resp = self.send_command("d\r".to_string(), &RE_READRELAY, READ_TIMEOUT).await?;
        let caps = RE_READRELAY.captures(&resp).ok_or_else(|| EssError::Protocol {
            transport: "power-control".to_string(),
            code: 0,
            message: "relay reply did not match expected format".to_string(),
        })?;
        let states = &caps[1];
        let mut on = Vec::new();
        let mut off = Vec::new();
        for (&uubnum, &port) in &self.ports {
            match states.get(port as usize) {
                Some(b'1') => on.push(uubnum),
                Some(b'0') => off.push(uubnum),
                _ => {}
            }
        }
        Ok((on, off))
    }
}

#[async_trait]
impl<S> PowerControlDriver for SerialPowerControl<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn switch(&mut self, on: bool, uubnums: Option<&[u32]>) -> Result<()> {
        let portmask = match uubnums {
            Some(list) => self.portmask_for(list)?,
            None => (1u16 << NCHANS) - 1,
        };
        self.switch_raw(on, portmask).await
    }

    async fn switch_raw(&mut self, on: bool, portmask: u16) -> Result<()> {
        let cmd = if on { 'n' } else { 'f' };
        self.send_command(format!("{cmd} {portmask:o}\r"), &RE_SET, READ_TIMEOUT).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn switch_sends_octal_portmask_for_named_uubs() {
        let (client_side, mut device_side) = duplex(256);
        let uubnums = vec![Some(100), Some(200), None];
        let mut driver = SerialPowerControl::new(client_side, &uubnums).unwrap();

        let device = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = device_side.read(&mut buf).await.unwrap();
            let cmd = String::from_utf8_lossy(&buf[..n]).to_string();
            device_side.write_all(b"OK").await.unwrap();
            cmd
        });

        driver.switch(true, Some(&[100, 200])).await.unwrap();
        let cmd = device.await.unwrap();
        // ports 0 and 1 -> mask 0b11 -> octal "3"
        assert_eq!(cmd, "n 3\r");
    }

    #[tokio::test]
    async fn switch_raw_uses_command_char_for_state() {
        let (client_side, mut device_side) = duplex(256);
        let uubnums = vec![Some(1)];
        let mut driver = SerialPowerControl::new(client_side, &uubnums).unwrap();

        let device = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = device_side.read(&mut buf).await.unwrap();
            let cmd = String::from_utf8_lossy(&buf[..n]).to_string();
            device_side.write_all(b"OK").await.unwrap();
            cmd
        });

        driver.switch_raw(false, 0b101).await.unwrap();
        let cmd = device.await.unwrap();
        assert_eq!(cmd, "f 5\r");
    }
}
