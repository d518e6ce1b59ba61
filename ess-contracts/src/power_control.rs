use async_trait::async_trait;
use ess_model::Result;

/// Relay bank gating UUB power rails, grounded on `PowerControl` in
/// `original_source/BME.py`. `switch_raw` addresses physical port bits
/// directly (a `portmask`), as used by the UUB plug-order probe, distinct
/// from `switch`'s per-uubnum addressing used by the rest of the campaign.
#[async_trait]
pub trait PowerControlDriver: Send + Sync {
    async fn switch(&mut self, on: bool, uubnums: Option<&[u32]>) -> Result<()>;
    async fn switch_raw(&mut self, on: bool, portmask: u16) -> Result<()>;
}
