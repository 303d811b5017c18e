use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scanner connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("scanner timed out")]
    Timeout,
    #[error("scanner error: {0}")]
    Scanner(String),
}

#[async_trait]
pub trait MalwareScanner: Send + Sync {
    /// Signature names found in `content`; empty when clean.
    async fn scan(&self, content: &[u8]) -> Result<Vec<String>, ScanError>;
}

/// Scanning disabled: everything is clean.
pub struct DisabledScanner;

#[async_trait]
impl MalwareScanner for DisabledScanner {
    async fn scan(&self, _content: &[u8]) -> Result<Vec<String>, ScanError> {
        Ok(Vec::new())
    }
}

/// clamd over TCP using the INSTREAM command.
pub struct ClamdScanner {
    address: String,
    timeout: Duration,
}

impl ClamdScanner {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        ClamdScanner {
            address: address.into(),
            timeout,
        }
    }

    async fn stream(&self, content: &[u8]) -> Result<String, ScanError> {
        log::debug!("Streaming {} bytes to clamd at {}", content.len(), self.address);
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.write_all(b"zINSTREAM\0").await?;
        for chunk in content.chunks(CHUNK_SIZE) {
            stream.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
            stream.write_all(chunk).await?;
        }
        stream.write_all(&0u32.to_be_bytes()).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response)
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }
}

/// `stream: OK`, `stream: Eicar-Signature FOUND`, or `... ERROR`.
pub(crate) fn parse_clamd_reply(reply: &str) -> Result<Vec<String>, ScanError> {
    let body = reply.strip_prefix("stream:").unwrap_or(reply).trim();
    if body == "OK" {
        return Ok(Vec::new());
    }
    if let Some(signature) = body.strip_suffix("FOUND") {
        return Ok(vec![signature.trim().to_string()]);
    }
    Err(ScanError::Scanner(body.to_string()))
}

#[async_trait]
impl MalwareScanner for ClamdScanner {
    async fn scan(&self, content: &[u8]) -> Result<Vec<String>, ScanError> {
        let reply = timeout(self.timeout, self.stream(content))
            .await
            .map_err(|_| ScanError::Timeout)??;
        parse_clamd_reply(&reply)
    }
}
