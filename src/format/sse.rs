//! Usage: Server-sent-events framing (incremental line parser + frame serializer).

use axum::body::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(event) = self.event.as_deref() {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Accumulates arbitrary byte chunks and yields complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<u8>,
    has_data: bool,
}

impl SseDecoder {
    pub fn ingest_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let buf = std::mem::take(&mut self.buffer);
        let mut frames = Vec::new();
        let mut start = 0usize;

        for (idx, b) in buf.iter().enumerate() {
            if *b != b'\n' {
                continue;
            }

            let mut line = &buf[start..idx];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len().saturating_sub(1)];
            }
            if let Some(frame) = self.ingest_line(line) {
                frames.push(frame);
            }
            start = idx + 1;
        }

        if start < buf.len() {
            self.buffer.extend_from_slice(&buf[start..]);
        }
        frames
    }

    /// Flushes a trailing frame when the upstream closes without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        let mut pending = None;
        if !rest.is_empty() {
            let line = rest.strip_suffix(b"\r").unwrap_or(&rest);
            pending = self.ingest_line(line);
        }
        pending.or_else(|| self.flush_frame())
    }

    fn ingest_line(&mut self, line: &[u8]) -> Option<SseFrame> {
        if line.is_empty() {
            return self.flush_frame();
        }

        if line[0] == b':' {
            return None;
        }

        if let Some(rest) = line.strip_prefix(b"event:") {
            let name = String::from_utf8_lossy(rest).trim().to_string();
            self.current_event = (!name.is_empty()).then_some(name);
            return None;
        }

        if let Some(rest) = line.strip_prefix(b"data:") {
            let rest = rest.strip_prefix(b" ").unwrap_or(rest);
            if self.has_data {
                self.current_data.push(b'\n');
            }
            self.current_data.extend_from_slice(rest);
            self.has_data = true;
        }
        None
    }

    fn flush_frame(&mut self) -> Option<SseFrame> {
        let event = self.current_event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        let data = String::from_utf8_lossy(&std::mem::take(&mut self.current_data)).into_owned();
        Some(SseFrame { event, data })
    }
}

#[cfg(test)]
mod tests;
