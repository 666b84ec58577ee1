//! Newline framing for the agent's stdout.
//!
//! Stdout arrives in arbitrary byte chunks. [`FrameDecoder`] reassembles them
//! into complete lines and keeps whatever trails the last newline for the
//! next call.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("agent output ended with {bytes} bytes of an unterminated line")]
    Truncated { bytes: usize },
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.buffer.extend_from_slice(chunk);
        Lines {
            buffer: &mut self.buffer,
            start: 0,
        }
    }

    /// Bytes received after the last newline.
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the decoder at end of stream. A non-blank remainder means the
    /// process stopped in the middle of a line.
    pub fn finish(self) -> Result<(), FrameError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(FrameError::Truncated {
                bytes: self.buffer.len(),
            })
        }
    }
}

/// Lines completed by one [`FrameDecoder::push`]. Dropping the iterator early
/// keeps the unvisited lines buffered for the next push.
#[derive(Debug)]
pub struct Lines<'a> {
    buffer: &'a mut Vec<u8>,
    start: usize,
}

impl Iterator for Lines<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.buffer[self.start..]
            .iter()
            .position(|byte| *byte == b'\n')?;
        let end = self.start + offset;
        let mut line = self.buffer[self.start..end].to_vec();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.start = end + 1;
        Some(line)
    }
}

impl Drop for Lines<'_> {
    fn drop(&mut self) {
        self.buffer.drain(..self.start);
    }
}
