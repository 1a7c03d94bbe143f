//! Splits the event-source byte stream into complete lines.
//!
//! Chunk boundaries fall wherever the pipe delivers them, so a line may
//! arrive across any number of chunks. Unterminated data is buffered up to
//! a fixed ceiling; past that the oldest bytes are discarded, trading the
//! events they carried for bounded memory.

/// Upper bound on buffered, not-yet-terminated data.
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct LineParser {
    buffer: Vec<u8>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it terminates.
    ///
    /// Lines are trimmed of a trailing carriage return; lines that are empty
    /// after trimming are dropped. The newline-free remainder stays buffered
    /// for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.buffer.len() > MAX_BUFFER_BYTES {
            let keep_from = self.buffer.len() - MAX_BUFFER_BYTES / 2;
            self.buffer.drain(..keep_from);
            log::warn!(
                "Event stream buffer exceeded {} bytes without a newline, dropped the oldest {} bytes",
                MAX_BUFFER_BYTES,
                keep_from
            );
        }

        lines
    }

    /// Discard any buffered partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
