use async_trait::async_trait;
use ess_model::record::PartialRecord;
use ess_model::Result;

/// A handler that receives a flushed record, possibly after a chain of
/// filters has transformed it. Implementations own their own I/O (file,
/// HTTPS upload, in-memory ring buffer for the remote console) and decide
/// how to surface write failures; the aggregator logs but does not retry.
#[async_trait]
pub trait Sink: Send + Sync {
    fn label(&self) -> &str;

    async fn write_rec(&mut self, record: &PartialRecord) -> Result<()>;

    /// Called once, when the handler is removed (UUB removal or shutdown).
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
