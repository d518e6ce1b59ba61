//! AFG 3102C/3252C function-generator driver: pulse (five-half-sine burst)
//! and sine excitation modes, grounded on `AFG.setParams`/`switchOn`/
//! `trigger` in `original_source/afg.py`.

use ess_core::transport::tek::TekTransport;
use ess_model::error::Result;

/// `functype` in the source: `P` (pulse, user-function burst) or `F`
/// (continuous sinusoid).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncType {
    Pulse,
    Sine,
}

#[derive(Debug, Clone, Copy)]
pub struct AfgParams {
    pub functype: FuncType,
    /// per-channel gain; `None` means the channel is off.
    pub gains: [Option<f64>; 2],
    pub offsets: [f64; 2],
    /// half-sine pulse width in seconds (functype P).
    pub hswidth_secs: f64,
    pub pulse_voltage: f64,
    /// excitation frequency in Hz (functype F).
    pub freq_hz: f64,
    pub sine_voltage: f64,
}

impl Default for AfgParams {
    fn default() -> Self {
        Self {
            functype: FuncType::Pulse,
            gains: [Some(1.0), Some(1.0)],
            offsets: [0.0, 0.0],
            hswidth_secs: 0.625e-6,
            pulse_voltage: 1.6,
            freq_hz: 1e6,
            sine_voltage: 0.5,
        }
    }
}

/// Duration of the triggered burst window; used to derive `ncycles` for
/// functype F, matching `self.DURATION = 22e-6`.
const BURST_DURATION_SECS: f64 = 22e-6;

pub struct Afg<T> {
    transport: T,
    params: AfgParams,
}

impl<T: TekTransport> Afg<T> {
    pub async fn connect(mut transport: T, params: AfgParams) -> Result<Self> {
        transport.send("trigger:sequence:source ext").await?;
        let mut afg = Self { transport, params };
        afg.apply_params().await?;
        Ok(afg)
    }

    /// Reapplies the full parameter set to the device, mirroring
    /// `setParams` being called with the complete dict at construction
    /// time (the source's incremental diffing against `self.param` is not
    /// reproduced — every call here is a full reconfiguration).
    pub async fn apply_params(&mut self) -> Result<()> {
        for (ch, gain) in self.params.gains.into_iter().enumerate() {
            let Some(gain) = gain else { continue };
            self.set_channel(ch, gain, self.params.offsets[ch]).await?;
        }

        match self.params.functype {
            FuncType::Pulse => {
                let pulse_freq_hz = 1.0 / (2.0 * self.params.hswidth_secs);
                for ch in 0..2 {
                    if self.params.gains[ch].is_none() {
                        continue;
                    }
                    self.transport
                        .send(&format!("source{}:function:shape:user usr4", ch + 1))
                        .await?;
                    self.transport
                        .send(&format!("source{}:burst:state on", ch + 1))
                        .await?;
                    self.transport.send(&format!("source{}:frequency {pulse_freq_hz}Hz", ch + 1)).await?;
                    self.set_amplitude(ch, self.params.pulse_voltage).await?;
                }
            }
            FuncType::Sine => {
                let ncycles = (BURST_DURATION_SECS * self.params.freq_hz).ceil() as u32;
                for ch in 0..2 {
                    if self.params.gains[ch].is_none() {
                        continue;
                    }
                    self.transport.send(&format!("source{}:function:shape sinusoid", ch + 1)).await?;
                    self.transport.send(&format!("source{}:frequency {}Hz", ch + 1, self.params.freq_hz)).await?;
                    self.transport.send(&format!("source{}:burst:ncycles {ncycles}", ch + 1)).await?;
                    self.set_amplitude(ch, 2.0 * self.params.sine_voltage).await?;
                }
            }
        }
        Ok(())
    }

    async fn set_channel(&mut self, ch: usize, gain: f64, offset: f64) -> Result<()> {
        self.transport.send(&format!("source{}:voltage:amplitude {gain}", ch + 1)).await?;
        self.transport.send(&format!("source{}:voltage:offset {offset}", ch + 1)).await
    }

    async fn set_amplitude(&mut self, ch: usize, voltage: f64) -> Result<()> {
        self.transport.send(&format!("source{}:voltage:amplitude {voltage}", ch + 1)).await
    }

    pub async fn switch_on(&mut self, on: bool, chans: &[usize]) -> Result<()> {
        let state = if on { "on" } else { "off" };
        for &ch in chans {
            if self.params.gains[ch].is_some() {
                self.transport.send(&format!("output{}:state {state}", ch + 1)).await?;
            }
        }
        Ok(())
    }

    pub async fn trigger(&mut self) -> Result<()> {
        self.transport.send("trigger").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_core::transport::tek::StreamTekTransport;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pulse_mode_derives_frequency_from_half_sine_width() {
        let (client, mut device) = duplex(8192);
        let transport = StreamTekTransport::new(client);
        let mut params = AfgParams::default();
        params.functype = FuncType::Pulse;
        params.hswidth_secs = 0.625e-6;

        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 512];
            for _ in 0..6 {
                let n = tokio::io::AsyncReadExt::read(&mut device, &mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            buf
        });

        let _afg = Afg::connect(transport, params).await.unwrap();
        let written = tokio::time::timeout(std::time::Duration::from_secs(1), reader).await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&written);
        assert!(text.contains("frequency 800000Hz"));
    }
}
