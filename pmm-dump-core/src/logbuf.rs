//! In-memory capture of the structured log.
//!
//! The CLI installs a JSON `tracing` layer whose writer appends to this
//! buffer; the export path snapshots it into the archive as `log.json`.

use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// Shared, append-only log buffer. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the captured bytes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().map(|b| b.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|b| b.is_empty()).unwrap_or(true)
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_snapshot() {
        let buf = LogBuffer::new();
        let mut writer = buf.clone();
        writer.write_all(b"{\"level\":\"info\"}\n").unwrap();
        writer.write_all(b"{\"level\":\"debug\"}\n").unwrap();

        let snap = buf.snapshot();
        assert_eq!(snap.iter().filter(|&&b| b == b'\n').count(), 2);
        assert!(!buf.is_empty());
    }
}
