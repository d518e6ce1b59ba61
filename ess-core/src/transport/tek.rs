//! Transport for Tektronix-style SCPI instruments (AFG, MDO scopes): USBTMC
//! character devices and newline-framed TCP/VXI-11-ish sockets share the
//! same `send`/`send_query` surface used by the instrument workers.

use std::time::Duration;

use ess_model::error::EssError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// A SCPI command channel: write a command, optionally read back a query
/// response up to the next newline.
#[async_trait::async_trait]
pub trait TekTransport: Send + Sync {
    async fn send(&mut self, cmd: &str) -> Result<(), EssError>;
    async fn send_query(&mut self, cmd: &str) -> Result<String, EssError>;
}

/// Newline-framed transport over any `AsyncRead + AsyncWrite` stream: a
/// USBTMC character device opened as a file, or a raw TCP socket.
pub struct StreamTekTransport<S> {
    stream: S,
    query_timeout: Duration,
}

impl<S> StreamTekTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, d: Duration) -> Self {
        self.query_timeout = d;
        self
    }

    /// Reads exactly `n` raw bytes, bypassing the newline-framing `send_query`
    /// relies on — needed for the scope's binary `CURVE?` block, which can
    /// legitimately contain `\n` bytes inside the data.
    pub async fn read_raw(&mut self, n: usize) -> Result<Vec<u8>, EssError> {
        let mut buf = vec![0u8; n];
        timeout(self.query_timeout, self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| EssError::Transient {
                transport: "tek".to_string(),
                message: "raw read timed out".to_string(),
            })?
            .map_err(|e| EssError::Transient {
                transport: "tek".to_string(),
                message: e.to_string(),
            })?;
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl<S> TekTransport for StreamTekTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, cmd: &str) -> Result<(), EssError> {
        let mut line = cmd.as_bytes().to_vec();
        line.push(b'\n');
        self.stream.write_all(&line).await.map_err(|e| EssError::Transient {
            transport: "tek".to_string(),
            message: e.to_string(),
        })
    }

    async fn send_query(&mut self, cmd: &str) -> Result<String, EssError> {
        self.send(cmd).await?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        let deadline = Instant::now() + self.query_timeout;
        loop {
            if buf.last() == Some(&b'\n') {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EssError::Transient {
                    transport: "tek".to_string(),
                    message: "query timed out waiting for response".to_string(),
                });
            }
            match timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(EssError::Transient {
                        transport: "tek".to_string(),
                        message: "stream closed mid-query".to_string(),
                    })
                }
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    return Err(EssError::Transient {
                        transport: "tek".to_string(),
                        message: e.to_string(),
                    })
                }
                Err(_) => continue,
            }
        }
        String::from_utf8(buf)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| EssError::Protocol {
                transport: "tek".to_string(),
                code: 0,
                message: e.to_string(),
            })
    }
}

pub async fn connect_tcp(addr: &str, port: u16) -> Result<StreamTekTransport<TcpStream>, EssError> {
    let stream = TcpStream::connect((addr, port)).await.map_err(|e| EssError::Transient {
        transport: "tek".to_string(),
        message: e.to_string(),
    })?;
    Ok(StreamTekTransport::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_query_reads_up_to_newline() {
        let (client, mut device) = duplex(128);
        let mut transport = StreamTekTransport::new(client);

        let device_task = tokio::spawn(async move {
            let mut req = [0u8; 6];
            device.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, b"*IDN?\n");
            device.write_all(b"TEKTRONIX,AFG3252\n").await.unwrap();
        });

        let resp = transport.send_query("*IDN?").await.unwrap();
        device_task.await.unwrap();
        assert_eq!(resp, "TEKTRONIX,AFG3252");
    }
}
