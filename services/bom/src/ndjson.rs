//! Newline-delimited JSON decoding for supplier streams.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Splits a chunked byte stream into complete lines.
///
/// Bytes after the last newline are held until the next chunk, so a line
/// (or a multi-byte character) split across chunks is reassembled intact.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed. Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(clean_line)
            .collect()
    }

    /// Flush a trailing line that had no newline
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        clean_line(&rest)
    }
}

fn clean_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// One `{event, data}` line from a supplier stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Event reported to the client when the upstream breaks
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: "error".to_string(),
            data: serde_json::json!({ "message": message.into() }),
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"event":"error","data":{"message":"unencodable event"}}"#.to_string()
        });
        line.push('\n');
        line
    }

    pub fn mpn(&self) -> Option<&str> {
        self.data.get("mpn").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = NdjsonDecoder::new();

        assert!(decoder.push(br#"{"event":"rea"#).is_empty());
        assert_eq!(decoder.push(b"dy\"}\n{\"event\""), vec![r#"{"event":"ready"}"#]);
        assert_eq!(
            decoder.push(b":\"progress\"}\n\n   \n{\"event\":\"complete\"}"),
            vec![r#"{"event":"progress"}"#]
        );
        assert_eq!(decoder.finish().as_deref(), Some(r#"{"event":"complete"}"#));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_multibyte_character_split() {
        let line = "{\"event\":\"found\",\"data\":{\"mpn\":\"Ω-100\"}}\n".as_bytes();
        let split = line.iter().position(|b| *b >= 0x80).unwrap() + 1;

        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(&line[..split]).is_empty());
        let lines = decoder.push(&line[split..]);

        let event = StreamEvent::parse(&lines[0]).unwrap();
        assert_eq!(event.mpn(), Some("Ω-100"));
    }

    #[test]
    fn test_crlf_and_data_default() {
        let mut decoder = NdjsonDecoder::new();
        let lines = decoder.push(b"{\"event\":\"complete\"}\r\n");
        let event = StreamEvent::parse(&lines[0]).unwrap();
        assert_eq!(event.event, "complete");
        assert!(event.data.is_null());
    }

    #[test]
    fn test_error_line() {
        let line = StreamEvent::error("connection reset").to_line();
        assert_eq!(
            line,
            "{\"event\":\"error\",\"data\":{\"message\":\"connection reset\"}}\n"
        );
    }
}
