//! MB1 Binder MKFT115 driver: a register-poking upload sequence over
//! Modbus-RTU, grounded on `Binder_MKFT115_MB1.convert_chamber2binder` and
//! the surrounding upload loop in `binder.py`.

use async_trait::async_trait;
use ess_contracts::chamber_driver::{ChamberDriver, ChamberState};
use ess_model::chamber::{ChamberProgram, DeviceSegment};
use ess_model::error::{EssError, Result};

use crate::transport::{ModbusClient, ModbusError};

// Register addresses mirror the MB1 map in the reference driver: program
// select, segment type, segment count, per-segment block base, and the
// state/actual-value block.
const REG_PROG_SELECT: u16 = 0x1000;
const REG_SEG_TYPE: u16 = 0x1001;
const REG_SEG_COUNT: u16 = 0x1002;
const REG_SEG_BASE: u16 = 0x1010;
const REG_SEG_STRIDE: u16 = 0x0008;
const REG_RESET: u16 = 0x1003;
const REG_END_OF_PROGRAM: u16 = 0x1004;
const REG_STATE: u16 = 0x2000;
const REG_ACTUAL_TEMP: u16 = 0x2001;
const REG_ACTUAL_HUMID: u16 = 0x2003;
const REG_START_PROG: u16 = 0x2010;
const REG_STOP_PROG: u16 = 0x2011;

fn modbus_err(err: ModbusError) -> EssError {
    EssError::Protocol {
        transport: "modbus-mb1".to_string(),
        code: 0,
        message: err.to_string(),
    }
}

pub struct Mb1Driver<S> {
    client: ModbusClient<S>,
}

impl<S> Mb1Driver<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(client: ModbusClient<S>) -> Self {
        Self { client }
    }

    async fn write_segment(&mut self, index: u16, segment: &DeviceSegment) -> Result<()> {
        let base = REG_SEG_BASE + index * REG_SEG_STRIDE;
        self.client.write_float(base, segment.temperature as f32).await.map_err(modbus_err)?;
        if let Some(humid) = segment.humidity {
            self.client.write_float(base + 2, humid as f32).await.map_err(modbus_err)?;
        }
        self.client.write_single_register(base + 4, segment.duration as u16).await.map_err(modbus_err)?;
        let control: u16 = (segment.anticond as u16) | ((segment.humidity_disabled as u16) << 1) | (segment.numjump << 8);
        self.client.write_single_register(base + 5, control).await.map_err(modbus_err)?;
        self.client.write_single_register(base + 6, segment.segjump).await.map_err(modbus_err)?;
        // reset between segments, matching the upload loop in binder.py
        self.client.write_single_register(REG_RESET, 1).await.map_err(modbus_err)?;
        Ok(())
    }
}

#[async_trait]
impl<S> ChamberDriver for Mb1Driver<S>
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
        self.client.write_single_register(REG_PROG_SELECT, progno as u16).await.map_err(modbus_err)?;
        self.client.write_single_register(REG_SEG_TYPE, 0).await.map_err(modbus_err)?;
        self.client.write_single_register(REG_SEG_COUNT, segments.len() as u16).await.map_err(modbus_err)?;
        for (index, segment) in segments.iter().enumerate() {
            self.write_segment(index as u16, segment).await?;
        }
        self.client.write_single_register(REG_END_OF_PROGRAM, 1).await.map_err(modbus_err)?;
        Ok(())
    }

    async fn start_prog(&mut self, progno: u8) -> Result<()> {
        self.client.write_single_register(REG_START_PROG, progno as u16).await.map_err(modbus_err)
    }

    async fn stop_prog(&mut self, manual: bool) -> Result<()> {
        if manual {
            return Err(EssError::Invariant(
                "MB1 manual-mode stop references an undefined controller mode in the reference driver; not implemented".to_string(),
            ));
        }
        self.client.write_single_register(REG_STOP_PROG, 1).await.map_err(modbus_err)
    }

    /// Left unimplemented: the reference driver's manual-mode branch
    /// references a `MODE_MANUAL` constant that is never defined anywhere
    /// in the source tree it ships in.
    async fn set_manual(&mut self, _temperature: Option<f64>, _humidity: Option<f64>) -> Result<()> {
        Err(EssError::Invariant(
            "MB1 manual mode is not implemented: the reference driver's MODE_MANUAL constant is undefined".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chamber::{compile, SegjumpBase};
    use crate::transport::modbus::mock_device;
    use ess_model::chamber::ChamberSegment;
    use tokio::io::duplex;

    #[tokio::test]
    async fn load_prog_writes_program_select_then_segments() {
        let (client_side, device_side) = duplex(8192);
        let modbus = ModbusClient::new(client_side, 1, false);
        let mut driver = Mb1Driver::new(modbus);

        let program = ChamberProgram {
            title: "t".to_string(),
            temperature: 20.0,
            humidity: Some(40.0),
            anticond: false,
            cycles: vec![],
            segments: vec![ChamberSegment {
                duration: 30,
                temperature: Some(25.0),
                humidity: None,
                anticond: None,
                meas: None,
            }],
        };
        let segments = compile(&program, SegjumpBase::CycleStart).unwrap();

        let device = tokio::spawn(mock_device(device_side));

        driver.load_prog(1, &program, &segments).await.unwrap();
        driver.start_prog(1).await.unwrap();
        driver.stop_prog(false).await.unwrap();
        drop(driver);
        device.abort();
    }

    #[tokio::test]
    async fn manual_mode_is_rejected_as_unimplemented() {
        let (client_side, device_side) = duplex(256);
        let modbus = ModbusClient::new(client_side, 1, false);
        let mut driver = Mb1Driver::new(modbus);
        let device = tokio::spawn(mock_device(device_side));

        let err = driver.set_manual(Some(20.0), None).await.unwrap_err();
        assert!(matches!(err, EssError::Invariant(_)));
        device.abort();
    }
}
