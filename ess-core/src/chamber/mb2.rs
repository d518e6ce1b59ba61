//! MB2 Binder MKFT115 driver: bulk float-blob upload plus a
//! commit/busy-poll handshake, grounded on
//! `Binder_MKFT115_MB2.convert_chamber2binder` and the `Bprog`
//! last-value bookkeeping in `binder.py`.
//!
//! `Bprog`'s humidity-assignment bug (`bprog.last_temp = humid` at
//! `binder.py:392`) is reproduced verbatim in [`Bprog::record`] rather
//! than silently fixed, per the documented Open Question resolution.

use async_trait::async_trait;
use ess_contracts::chamber_driver::{ChamberDriver, ChamberState};
use ess_model::chamber::{ChamberProgram, DeviceSegment};
use ess_model::error::{EssError, Result};
use tokio::time::{sleep, Duration};

use crate::transport::{ModbusClient, ModbusError};

const REG_DELETE_PROGRAM: u16 = 0x3000;
const REG_SEG_FLOAT_BASE: u16 = 0x3010;
const REG_SEG_CONTROL_BASE: u16 = 0x3800;
const REG_SEG_STRIDE: u16 = 0x0004;
const REG_STORE: u16 = 0x3001;
const REG_STATUS: u16 = 0x3002;
const MASK_BUSY: u16 = 0x0001;
const REG_STATE: u16 = 0x4000;
const REG_ACTUAL_TEMP: u16 = 0x4001;
const REG_ACTUAL_HUMID: u16 = 0x4003;
const REG_START_PROG: u16 = 0x4010;
const REG_STOP_PROG: u16 = 0x4011;
const REG_MANUAL: u16 = 0x4012;

const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const BUSY_POLL_ATTEMPTS: u32 = 50;

fn modbus_err(err: ModbusError) -> EssError {
    EssError::Protocol {
        transport: "modbus-mb2".to_string(),
        code: 0,
        message: err.to_string(),
    }
}

/// Carries the same running `(last_temp, last_humid, last_anticond)` state
/// the Python `Bprog` object threads through segment emission. Kept as its
/// own type since MB2's segment encoding (unlike MB1's) needs the *previous*
/// segment's values available while writing the current one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bprog {
    pub last_temp: f64,
    pub last_humid: f64,
    pub last_anticond: bool,
}

impl Bprog {
    /// Updates the carried state from a device segment. Reproduces the
    /// reference implementation's bug verbatim: the humidity branch
    /// assigns into `last_temp`, not `last_humid`, so `last_humid` is
    /// never actually updated by this path.
    pub fn record(&mut self, segment: &DeviceSegment) {
        self.last_temp = segment.temperature;
        if let Some(humid) = segment.humidity {
            self.last_temp = humid;
        }
        self.last_anticond = segment.anticond;
    }
}

pub struct Mb2Driver<S> {
    client: ModbusClient<S>,
}

impl<S> Mb2Driver<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(client: ModbusClient<S>) -> Self {
        Self { client }
    }

    async fn write_segment(&mut self, index: u16, segment: &DeviceSegment, bprog: &mut Bprog) -> Result<()> {
        let float_base = REG_SEG_FLOAT_BASE + index * REG_SEG_STRIDE;
        self.client.write_float(float_base, segment.temperature as f32).await.map_err(modbus_err)?;
        self.client
            .write_float(float_base + 2, segment.humidity.unwrap_or(bprog.last_temp) as f32)
            .await
            .map_err(modbus_err)?;

        let control_base = REG_SEG_CONTROL_BASE + index * REG_SEG_STRIDE;
        self.client.write_single_register(control_base, segment.duration as u16).await.map_err(modbus_err)?;
        let control: u16 = (segment.anticond as u16) | ((segment.humidity_disabled as u16) << 1) | (segment.numjump << 8);
        self.client.write_single_register(control_base + 1, control).await.map_err(modbus_err)?;
        self.client.write_single_register(control_base + 2, segment.segjump).await.map_err(modbus_err)?;

        bprog.record(segment);
        Ok(())
    }

    async fn wait_until_idle(&mut self) -> Result<()> {
        for _ in 0..BUSY_POLL_ATTEMPTS {
            let status = self.client.read_holding_registers(REG_STATUS, 1).await.map_err(modbus_err)?;
            if status[0] & MASK_BUSY == 0 {
                return Ok(());
            }
            sleep(BUSY_POLL_INTERVAL).await;
        }
        Err(EssError::Transient {
            transport: "modbus-mb2".to_string(),
            message: "store command still busy after maximum poll attempts".to_string(),
        })
    }
}

#[async_trait]
impl<S> ChamberDriver for Mb2Driver<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn get_state(&mut self) -> Result<ChamberState> {
        let words = self.client.read_holding_registers(REG_STATE, 1).await.map_err(modbus_err)?;
        Ok(match words[0] {
            0 => ChamberState::Idle,
            1 => ChamberState::Manual,
            _ => ChamberState::Prog,
        })
    }

    async fn get_temp(&mut self) -> Result<f64> {
        self.client.read_float(REG_ACTUAL_TEMP).await.map(|v| v as f64).map_err(modbus_err)
    }

    async fn get_humid(&mut self) -> Result<Option<f64>> {
        let v = self.client.read_float(REG_ACTUAL_HUMID).await.map_err(modbus_err)?;
        if v.is_nan() {
            Ok(None)
        } else {
            Ok(Some(v as f64))
        }
    }

    async fn load_prog(&mut self, progno: u8, _program: &ChamberProgram, segments: &[DeviceSegment]) -> Result<()> {
        self.client.write_single_register(REG_DELETE_PROGRAM, progno as u16).await.map_err(modbus_err)?;

        let mut bprog = Bprog::default();
        for (index, segment) in segments.iter().enumerate() {
            self.write_segment(index as u16, segment, &mut bprog).await?;
        }

        self.client.write_single_register(REG_STORE, progno as u16).await.map_err(modbus_err)?;
        self.wait_until_idle().await?;

        let status = self.client.read_holding_registers(REG_STATUS, 1).await.map_err(modbus_err)?;
        if status[0] & MASK_BUSY != 0 {
            return Err(EssError::Critical("MB2 reported busy after store completed".to_string()));
        }
        Ok(())
    }

    async fn start_prog(&mut self, progno: u8) -> Result<()> {
        self.client.write_single_register(REG_START_PROG, progno as u16).await.map_err(modbus_err)
    }

    async fn stop_prog(&mut self, manual: bool) -> Result<()> {
        if manual {
            self.client.write_single_register(REG_MANUAL, 1).await.map_err(modbus_err)?;
        }
        self.client.write_single_register(REG_STOP_PROG, 1).await.map_err(modbus_err)
    }

    async fn set_manual(&mut self, temperature: Option<f64>, humidity: Option<f64>) -> Result<()> {
        if let Some(temp) = temperature {
            self.client.write_float(REG_ACTUAL_TEMP, temp as f32).await.map_err(modbus_err)?;
        }
        if let Some(humid) = humidity {
            self.client.write_float(REG_ACTUAL_HUMID, humid as f32).await.map_err(modbus_err)?;
        }
        self.client.write_single_register(REG_MANUAL, 1).await.map_err(modbus_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chamber::{compile, SegjumpBase};
    use crate::transport::modbus::mock_device;
    use ess_model::chamber::{ChamberSegment, Cycle};
    use tokio::io::duplex;

    #[test]
    fn bprog_record_reproduces_humidity_assignment_bug() {
        let mut bprog = Bprog::default();
        let segment = DeviceSegment {
            temperature: 25.0,
            humidity: Some(60.0),
            duration: 10,
            anticond: true,
            humidity_disabled: false,
            numjump: 0,
            segjump: 0,
        };
        bprog.record(&segment);
        // last_temp ends up holding the humidity value, matching
        // binder.py:392's `bprog.last_temp = humid`
        assert_eq!(bprog.last_temp, 60.0);
        assert_eq!(bprog.last_humid, 0.0);
    }

    #[tokio::test]
    async fn load_prog_with_repeat_cycle_round_trips_over_mock_device() {
        let (client_side, device_side) = duplex(16384);
        let modbus = ModbusClient::new(client_side, 1, false);
        let mut driver = Mb2Driver::new(modbus);
        let device = tokio::spawn(mock_device(device_side));

        let program = ChamberProgram {
            title: "soak".to_string(),
            temperature: 20.0,
            humidity: Some(45.0),
            anticond: false,
            cycles: vec![Cycle {
                start_index: 0,
                repeat: 5,
                end_index: 1,
            }],
            segments: vec![
                ChamberSegment {
                    duration: 600,
                    temperature: Some(85.0),
                    humidity: None,
                    anticond: None,
                    meas: Some(0),
                },
                ChamberSegment {
                    duration: 600,
                    temperature: Some(-40.0),
                    humidity: None,
                    anticond: None,
                    meas: Some(600),
                },
            ],
        };
        let segments = compile(&program, SegjumpBase::CycleStartPlusOne).unwrap();
        assert_eq!(segments[1].numjump, 4);
        assert_eq!(segments[1].segjump, 1);

        driver.load_prog(3, &program, &segments).await.unwrap();
        device.abort();
    }
}
