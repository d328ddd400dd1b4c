use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Error types for batch delivery
#[derive(Debug, Error)]
pub enum TransportError {
    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Remote or connection-level failure
    #[error("transport error: {0}")]
    Transport(String),
    /// Delivery did not finish within the send timeout
    #[error("send timed out after {0:?}")]
    TimedOut(std::time::Duration),
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries")]
    RetriesExhausted { attempts: u32 },
}

/// An encoded batch ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    /// MIME type of `bytes`
    pub content_type: &'static str,
}

impl Payload {
    pub fn new(bytes: Vec<u8>, content_type: &'static str) -> Self {
        Self {
            bytes,
            content_type,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Trait for delivering encoded batches.
///
/// Uses native async fn in traits. `send` returning `Ok` means the receiver
/// has the batch, including any string tables it carried.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Box<dyn TransportBoxed>`.
pub trait Transport: Send + Sync {
    /// Delivers one payload.
    fn send(&self, payload: Payload) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the transport name for logging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    fn send_boxed(
        &self,
        payload: Payload,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any Transport can be used as TransportBoxed
impl<T: Transport> TransportBoxed for T {
    fn send_boxed(
        &self,
        payload: Payload,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.send(payload))
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// Discards every payload (for benchmarking)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl NullTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for NullTransport {
    async fn send(&self, _payload: Payload) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Logs a summary of each payload through `tracing`.
#[derive(Debug, Default)]
pub struct LogTransport {
    /// Also log the payload body at debug level
    verbose: bool,
    sent: AtomicU64,
}

impl LogTransport {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            sent: AtomicU64::new(0),
        }
    }

    /// Payloads logged so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for LogTransport {
    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let seq = self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            seq,
            bytes = payload.len(),
            content_type = payload.content_type,
            "batch delivered"
        );

        if self.verbose {
            match std::str::from_utf8(&payload.bytes) {
                Ok(text) => debug!(seq, body = text, "batch body"),
                Err(_) => debug!(seq, body = ?payload.bytes, "batch body"),
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Writes each payload to its own file in a directory.
///
/// Files are named `batch-000000.bin`, `batch-000001.json`, ... by
/// content type.
#[derive(Debug)]
pub struct FileTransport {
    dir: PathBuf,
    seq: AtomicU64,
}

impl FileTransport {
    /// Creates a transport writing into `dir`, which must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn extension(content_type: &str) -> &'static str {
        if content_type.ends_with("json") {
            "json"
        } else {
            "bin"
        }
    }
}

impl Transport for FileTransport {
    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(
            "batch-{:06}.{}",
            seq,
            Self::extension(payload.content_type)
        ));

        tokio::fs::write(&path, &payload.bytes).await?;
        debug!(path = %path.display(), bytes = payload.len(), "batch written");
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Test transport that records every payload for verification
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingTransport {
    payloads: std::sync::Mutex<Vec<Payload>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
