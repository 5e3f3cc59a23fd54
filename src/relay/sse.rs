//! Incremental SSE frame parsing for the upstream provider stream.
//!
//! Provider bytes arrive in arbitrary chunk boundaries; frames are complete
//! only at a blank line.

/// Accumulates raw bytes and yields complete event frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: String,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);
    }

    /// Pop the next complete frame, if one has fully arrived.
    pub fn next_frame(&mut self) -> Option<String> {
        let boundary = self.buffer.find("\n\n")?;
        let remaining = self.buffer.split_off(boundary + 2);
        let frame = std::mem::take(&mut self.buffer);
        self.buffer = remaining;
        Some(frame)
    }
}

/// Extract the `data:` payloads from a frame.
pub fn data_payloads(frame: &str) -> Vec<&str> {
    frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect()
}
