//! Server-sent events framing for build event streams.
//!
//! Every envelope becomes one frame:
//!
//! ```text
//! id: <sequence>
//! event: event
//! data: {"data":<payload>,"event":"<type>","version":"<version>"}
//!
//! ```
//!
//! The stream ends with [`END_FRAME`]. Frames are produced here rather than
//! through `axum::response::Sse` because the bytes on the wire are part of the
//! protocol.

use axum::body::Bytes;
use pipeliner_events::{Envelope, OwnedMessage, Sequence};

/// Terminal frame; nothing follows it on the connection.
pub const END_FRAME: &[u8] = b"event: end\ndata: \n\n";

/// Event name carried by envelope frames.
pub const EVENT_NAME: &str = "event";

/// Event name of the terminal frame.
pub const END_EVENT_NAME: &str = "end";

/// Encodes one envelope as a frame.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(&envelope.message())?;
    Ok(Bytes::from(format!(
        "id: {}\nevent: {EVENT_NAME}\ndata: {data}\n\n",
        envelope.sequence
    )))
}

pub fn end_frame() -> Bytes {
    Bytes::from_static(END_FRAME)
}

/// A decoded frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_end(&self) -> bool {
        self.event.as_deref() == Some(END_EVENT_NAME)
    }

    /// The envelope sequence carried in `id`, if numeric.
    pub fn sequence(&self) -> Option<Sequence> {
        self.id.as_deref()?.trim().parse().ok()
    }

    /// Decodes the envelope carried by an `event` frame.
    pub fn envelope(&self) -> Result<Option<Envelope>, serde_json::Error> {
        let Some(sequence) = self.sequence() else {
            return Ok(None);
        };
        let message: OwnedMessage = serde_json::from_str(&self.data)?;
        Ok(Some(message.into_envelope(sequence)))
    }
}

/// Incremental frame decoder.
///
/// Input may be split anywhere, including inside a line or a UTF-8 code
/// point. Unlike browsers, frames with empty data are still emitted so the
/// terminal `end` frame is observable.
#[derive(Debug, Default)]
pub struct SseReader {
    pending: Vec<u8>,
    frame: SseFrame,
    data_lines: Vec<String>,
    has_fields: bool,
}

impl SseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns every frame completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => self.frame.id = Some(value.to_string()),
            "event" => self.frame.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => return None,
        }
        self.has_fields = true;
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if !self.has_fields {
            return None;
        }
        self.has_fields = false;

        let mut frame = std::mem::take(&mut self.frame);
        frame.data = std::mem::take(&mut self.data_lines).join("\n");
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeliner_events::Event;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn envelope(sequence: Sequence, value: &str) -> Envelope {
        Event::new("fake", "42.0", json!({ "value": value })).sequenced(sequence)
    }

    #[test]
    fn test_encode_envelope_bytes() {
        let frame = encode_envelope(&envelope(0, "e1")).unwrap();
        assert_eq!(
            std::str::from_utf8(&frame).unwrap(),
            "id: 0\nevent: event\ndata: {\"data\":{\"value\":\"e1\"},\"event\":\"fake\",\"version\":\"42.0\"}\n\n"
        );
    }

    #[test]
    fn test_end_frame_bytes() {
        assert_eq!(&end_frame()[..], b"event: end\ndata: \n\n");
    }

    #[test]
    fn test_reader_decodes_encoded_stream() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_envelope(&envelope(4, "x")).unwrap());
        wire.extend_from_slice(END_FRAME);

        let frames = SseReader::new().push(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence(), Some(4));
        assert_eq!(frames[0].envelope().unwrap(), Some(envelope(4, "x")));
        assert!(frames[1].is_end());
        assert_eq!(frames[1].data, "");
    }

    #[test]
    fn test_reader_handles_split_input() {
        let wire = encode_envelope(&envelope(1, "日本")).unwrap();
        let mut reader = SseReader::new();

        let mut frames = Vec::new();
        for byte in wire.iter() {
            frames.extend(reader.push(std::slice::from_ref(byte)));
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].envelope().unwrap(), Some(envelope(1, "日本")));
    }

    #[test]
    fn test_reader_multiline_data_and_comments() {
        let mut reader = SseReader::new();
        let frames = reader.push(b": keepalive\r\ndata: first\r\ndata:second\r\n\r\n\n");

        assert_eq!(
            frames,
            vec![SseFrame {
                id: None,
                event: None,
                data: "first\nsecond".to_string(),
            }]
        );
    }
}
