//! Incremental Server-Sent-Events framing.
//!
//! Both chat dialects stream responses as SSE: `data:` lines grouped into
//! events by blank lines, with OpenAI-compatible endpoints closing the
//! stream with a literal `[DONE]` payload. Network chunks split anywhere,
//! including mid-line and mid-codepoint, so the parser carries unfinished
//! bytes between [`feed`](SseParser::feed) calls and never assumes chunk
//! alignment.

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A complete event payload. Multi-line data fields are joined with `\n`.
    Data(String),
    /// The `[DONE]` sentinel used by OpenAI-compatible streams.
    Done,
}

/// Stateful SSE decoder fed raw body chunks.
#[derive(Debug, Default)]
pub struct SseParser {
    /// Unfinished trailing line bytes from the previous chunk.
    carry: Vec<u8>,
    /// Data lines of the event currently being accumulated.
    data_lines: Vec<String>,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk, returning every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        self.carry.extend_from_slice(chunk);

        while let Some(newline) = self.carry.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.carry.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            self.take_line(line, &mut frames);
        }

        frames
    }

    /// Flush at end of stream: an event without a trailing blank line still
    /// counts.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.carry.is_empty() {
            let rest: Vec<u8> = std::mem::take(&mut self.carry);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            self.take_line(&line, &mut frames);
        }
        self.flush_event(&mut frames);
        frames
    }

    fn take_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.flush_event(frames);
            return;
        }

        // Comment lines and non-data fields (event:, id:, retry:) carry no
        // payload for either chat dialect.
        if line.starts_with(':') {
            return;
        }

        if let Some(payload) = line.strip_prefix("data:") {
            self.data_lines
                .push(payload.strip_prefix(' ').unwrap_or(payload).to_string());
        }
    }

    fn flush_event(&mut self, frames: &mut Vec<SseFrame>) {
        if self.data_lines.is_empty() {
            return;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        if payload == "[DONE]" {
            frames.push(SseFrame::Done);
        } else {
            frames.push(SseFrame::Data(payload));
        }
    }
}
