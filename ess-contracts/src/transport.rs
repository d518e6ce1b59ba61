use async_trait::async_trait;
use ess_model::error::EssError;
use tokio::io::AsyncRead;
use tokio::time::Instant;

/// Accumulates bytes from an async byte stream until a pattern matches or a
/// deadline passes. Polls at a bounded interval; never retries internally.
#[async_trait]
pub trait FramedRead: AsyncRead + Unpin + Send {
    async fn read_until(
        &mut self,
        pattern: &regex::bytes::Regex,
        deadline: Instant,
    ) -> Result<Vec<u8>, EssError>;
}
