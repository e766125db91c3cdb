//! Per-build append-only log buffer.
//!
//! Every executed command line, all merged child stdout/stderr bytes, and
//! orchestrator annotations land here. The buffer is returned verbatim in
//! error responses and is otherwise discarded with the build environment.

use std::sync::{Arc, Mutex};

use derive_more::Debug;

/// Shared append-only buffer for one build environment.
#[derive(Clone, Debug, Default)]
pub struct BuildLog {
    #[debug("{} bytes", buf.lock().map(|b| b.len()).unwrap_or(0))]
    buf: Arc<Mutex<Vec<u8>>>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes, typically child process output.
    pub fn append(&self, bytes: &[u8]) {
        if let Ok(mut buf) = self.buf.lock() {
            buf.extend_from_slice(bytes);
        }
    }

    /// Append an annotation line.
    pub fn line(&self, text: impl AsRef<str>) {
        if let Ok(mut buf) = self.buf.lock() {
            buf.extend_from_slice(text.as_ref().as_bytes());
            buf.push(b'\n');
        }
    }

    /// Copy out the buffer contents, replacing invalid UTF-8.
    pub fn snapshot(&self) -> String {
        self.buf
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().map(|buf| buf.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_interleave() {
        let log = BuildLog::new();
        log.line("$ go build");
        log.append(b"out");
        log.append(b"put\n");
        assert_eq!(log.snapshot(), "$ go build\noutput\n");
    }

    #[test]
    fn clones_share_the_buffer() {
        let log = BuildLog::new();
        let clone = log.clone();
        clone.line("from the clone");
        assert_eq!(log.snapshot(), "from the clone\n");
    }
}
