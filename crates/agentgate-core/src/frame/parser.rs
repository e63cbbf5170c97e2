//! Line framing and frame decoding.
//!
//! Implements tolerant reader pattern: unknown fields ignored, partial lines
//! carried over to the next read.

use tracing::warn;

use super::types::WorkerResponse;
use crate::error::{Error, Result};

/// Longest partial line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Accumulates raw stdout bytes and yields complete lines.
///
/// Output arrives in arbitrary chunks; a chunk may end mid-line or contain
/// several lines at once. Anything after the last newline stays buffered until
/// the next `push`. A partial line that grows past the limit is dropped, along
/// with the rest of that line when it arrives.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    /// Append a chunk and drain every complete line from the buffer.
    ///
    /// Line terminators (`\n`, optionally preceded by `\r`) are stripped.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        let mut chunk = chunk;
        if self.discarding {
            let Some(pos) = chunk.iter().position(|&b| b == b'\n') else {
                return lines;
            };
            self.discarding = false;
            chunk = &chunk[pos + 1..];
        }
        self.buf.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            let line = &self.buf[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line {
            warn!(
                bytes = self.buf.len(),
                max_bytes = self.max_line,
                "Discarding overlong output line"
            );
            self.buf.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        lines
    }

    /// Bytes received after the last newline.
    #[cfg(test)]
    fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Take whatever partial line is left, e.g. when the stream hits EOF.
    pub fn take_remainder(&mut self) -> Option<String> {
        self.scanned = 0;
        self.discarding = false;
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

/// Whether `line` is the worker's readiness sentinel.
pub fn is_ready_line(line: &str, sentinel: &str) -> bool {
    line.trim() == sentinel
}

/// Decode one complete stdout line from the persistent worker.
pub fn parse_response_line(line: &str) -> Result<WorkerResponse> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Err(Error::FrameParse(format!(
            "expected a JSON object, got {:?}",
            truncate(trimmed, 80)
        )));
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Locate the payload in free-form transient worker output.
///
/// The first line that, once trimmed, both starts with `{` and ends with `}`
/// is taken as the payload; every other line is diagnostic noise. A JSON
/// object split over several lines is never found.
pub fn extract_json_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('{') && line.ends_with('}'))
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
