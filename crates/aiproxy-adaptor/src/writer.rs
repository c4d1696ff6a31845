//! The client writer abstraction and the "first byte written" guard that
//! makes retries safe: a retry is only safe before any byte has been
//! written to the client.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use aiproxy_core::ProxyError;

/// Sink for bytes destined for the inbound HTTP client. Adaptors write
/// normalised response bytes here; the relay controller wraps the real
/// transport writer with [`FirstByteGuard`] so it can tell whether a retry
/// is still safe.
pub trait ClientWriter: Send {
    fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError>;
}

/// Wraps an inner [`ClientWriter`] and records whether any byte has been
/// written yet. Once set, the relay controller treats the current attempt
/// as committed irrevocably: once the first byte of a successful (2xx)
/// stream reaches the client, there is no going back to a different
/// channel.
pub struct FirstByteGuard<'a> {
    inner: &'a mut dyn ClientWriter,
    written: AtomicBool,
}

impl<'a> FirstByteGuard<'a> {
    pub fn new(inner: &'a mut dyn ClientWriter) -> Self {
        Self {
            inner,
            written: AtomicBool::new(false),
        }
    }

    pub fn has_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }
}

impl<'a> ClientWriter for FirstByteGuard<'a> {
    fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.written.store(true, Ordering::Release);
        self.inner.write(chunk)
    }
}

/// A `ClientWriter` that records everything written to it, for tests.
#[derive(Default)]
pub struct RecordingWriter {
    pub chunks: Vec<Bytes>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_string(&self) -> String {
        let mut s = String::new();
        for chunk in &self.chunks {
            s.push_str(&String::from_utf8_lossy(chunk));
        }
        s
    }
}

impl ClientWriter for RecordingWriter {
    fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError> {
        self.chunks.push(chunk);
        Ok(())
    }
}
