use ess_model::error::EssError;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Instant, Duration};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Accumulates bytes from `stream` until `pattern` matches, subject to a
/// wall-clock `deadline`. Polls at [`POLL_INTERVAL`]; no internal retries.
/// On expiry, fails with `ReadTimeout` carrying the partial buffer.
pub async fn read_until<S>(stream: &mut S, pattern: &Regex, deadline: Instant) -> Result<Vec<u8>, EssError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        if pattern.is_match(&buf) {
            return Ok(buf);
        }
        if Instant::now() >= deadline {
            return Err(EssError::Transient {
                transport: "framed".to_string(),
                message: format!("read timeout, partial buffer: {:?}", buf),
            });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let poll_wait = POLL_INTERVAL.min(remaining);
        match tokio::time::timeout(poll_wait, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                // stream closed with no data this round; keep polling until deadline
                tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
            }
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => {
                return Err(EssError::Transient {
                    transport: "framed".to_string(),
                    message: err.to_string(),
                });
            }
            Err(_elapsed) => {} // poll interval elapsed, loop and re-check deadline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_until_pattern_matches() {
        let (mut writer, mut reader) = duplex(64);
        let pattern = Regex::new(r"\n").unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        let write_task = tokio::spawn(async move {
            writer.write_all(b"hello\n").await.unwrap();
        });
        let result = read_until(&mut reader, &pattern, deadline).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(result, b"hello\n");
    }

    #[tokio::test]
    async fn times_out_with_partial_buffer() {
        let (writer, mut reader) = duplex(64);
        let pattern = Regex::new(r"\n").unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = read_until(&mut reader, &pattern, deadline).await.unwrap_err();
        drop(writer);
        assert!(matches!(err, EssError::Transient { .. }));
    }
}
