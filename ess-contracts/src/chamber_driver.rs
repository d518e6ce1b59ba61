use async_trait::async_trait;
use ess_model::chamber::{ChamberProgram, DeviceSegment};
use ess_model::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChamberState {
    Idle,
    Manual,
    Prog,
}

/// Capability trait shared by the two Binder MKFT115 wire dialects (MB1,
/// MB2). `load_prog` takes already-lowered segments — compilation from a
/// declarative `ChamberProgram` lives in `ess-core::chamber` and is shared
/// between drivers; only the wire encoding differs.
#[async_trait]
pub trait ChamberDriver: Send + Sync {
    async fn get_state(&mut self) -> Result<ChamberState>;
    async fn get_temp(&mut self) -> Result<f64>;
    async fn get_humid(&mut self) -> Result<Option<f64>>;
    async fn load_prog(&mut self, progno: u8, program: &ChamberProgram, segments: &[DeviceSegment]) -> Result<()>;
    async fn start_prog(&mut self, progno: u8) -> Result<()>;
    async fn stop_prog(&mut self, manual: bool) -> Result<()>;

    /// MB1's manual-mode branch references an undefined `MODE_MANUAL`
    /// constant in the reference implementation; left unimplemented here,
    /// matching the documented Open Question resolution.
    async fn set_manual(&mut self, temperature: Option<f64>, humidity: Option<f64>) -> Result<()>;
}
