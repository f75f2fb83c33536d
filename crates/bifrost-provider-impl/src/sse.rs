/// One decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder. Feed raw body chunks as they arrive; complete
/// frames come out as soon as their terminating blank line is seen.
/// Comment lines and `retry:` hints are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.flush_frame(&mut frames);
            } else {
                self.consume_line(&line);
            }
        }
        frames
    }

    /// Drain any partially-buffered frame at end of body. Upstreams that
    /// omit the final blank line still yield their last event.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            if !line.is_empty() {
                self.consume_line(&line);
            }
        }
        let mut frames = Vec::new();
        self.flush_frame(&mut frames);
        frames
    }

    fn consume_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_frame(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}
