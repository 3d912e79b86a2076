//! Bounded capture of child process output.

use std::collections::VecDeque;

/// Cap for captured build output.
pub const BUILD_OUTPUT_CAP: usize = 64 * 1024;

/// Cap for the rolling tail kept for a running application.
pub const APP_OUTPUT_CAP: usize = 16 * 1024;

/// Which pipe a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One read from a child process pipe.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: Stream,
    pub bytes: Vec<u8>,
}

/// Ring buffer of bytes: once `cap` is reached the oldest bytes are dropped
/// and the buffer is flagged as truncated.
#[derive(Debug, Clone)]
pub struct BoundedOutput {
    buf: VecDeque<u8>,
    cap: usize,
    truncated: bool,
}

impl BoundedOutput {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(8 * 1024)),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.cap == 0 {
            self.truncated |= !bytes.is_empty();
            return;
        }
        let bytes = if bytes.len() > self.cap {
            self.truncated = true;
            &bytes[bytes.len() - self.cap..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.truncated = true;
        }
        self.buf.extend(bytes);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Lossy UTF-8 view of the retained bytes, prefixed with a notice when
    /// older output was dropped.
    pub fn to_text(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        let text = String::from_utf8_lossy(&bytes);
        if self.truncated {
            format!("[output truncated]\n{}", text)
        } else {
            text.into_owned()
        }
    }
}
