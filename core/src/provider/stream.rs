//! Incremental parsing of streamed (`data:` framed) provider responses.

use serde_json::Value;

/// Splits a byte stream into complete lines, keeping the partial tail.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line completed by it (without `\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Remaining unterminated text at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// Consumes stream lines and yields the final response.
pub trait StreamAccumulator {
    fn consume_line(&mut self, line: &str);
}

/// Chat-completions style: concatenate `choices[0].delta.content` and `reasoning_content`.
#[derive(Debug, Default)]
pub struct DeltaTextAccumulator {
    text: String,
}

impl DeltaTextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

impl StreamAccumulator for DeltaTextAccumulator {
    fn consume_line(&mut self, line: &str) {
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim_start();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        let Some(delta) = value.pointer("/choices/0/delta") else {
            return;
        };
        for field in ["content", "reasoning_content"] {
            if let Some(piece) = delta.get(field).and_then(Value::as_str) {
                self.text.push_str(piece);
            }
        }
    }
}

/// generateContent style: every frame is a full JSON document; keep the last one.
#[derive(Debug, Default)]
pub struct LastJsonAccumulator {
    last: Option<Value>,
}

impl LastJsonAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_last(self) -> Option<Value> {
        self.last
    }
}

fn strip_data_prefix(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() >= 5 && bytes[..5].eq_ignore_ascii_case(b"data:") {
        line[5..].trim_start()
    } else {
        line
    }
}

impl StreamAccumulator for LastJsonAccumulator {
    fn consume_line(&mut self, line: &str) {
        let payload = strip_data_prefix(line.trim()).trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(payload) {
            self.last = Some(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        assert_eq!(buf.push(b":1}\r\ndata: x\n"), vec!["data: {\"a\":1}\r", "data: x"]);
        assert!(buf.push(b"tail").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("tail"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_delta_accumulator() {
        let mut acc = DeltaTextAccumulator::new();
        acc.consume_line(r#"data: {"choices":[{"delta":{"content":"![img]("}}]}"#);
        acc.consume_line(r#"data:{"choices":[{"delta":{"reasoning_content":"http://x/y.png"}}]}"#);
        acc.consume_line(": keep-alive");
        acc.consume_line("data: not json");
        acc.consume_line(r#"data: {"choices":[{"delta":{"content":")"}}]}"#);
        acc.consume_line("data: [DONE]");
        assert_eq!(acc.into_text(), "![img](http://x/y.png)");
    }

    #[test]
    fn test_last_json_accumulator() {
        let mut acc = LastJsonAccumulator::new();
        acc.consume_line(r#"DATA: {"n":1}"#);
        acc.consume_line("");
        acc.consume_line(r#"  {"n":2}  "#);
        acc.consume_line("data: [DONE]");
        assert_eq!(acc.into_last(), Some(serde_json::json!({"n": 2})));
    }
}
