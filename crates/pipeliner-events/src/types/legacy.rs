//! Compatibility for builds that predate the event stream.
//!
//! Those builds only stored raw log bytes. To replay them through the same
//! endpoint, the bytes are cut into `log` events of version `1.0`.

use serde_json::json;

use super::envelope::Event;

/// Maximum payload size of one legacy log event, in bytes.
pub const LEGACY_CHUNK_SIZE: usize = 1024;

/// Splits raw log output into events of at most [`LEGACY_CHUNK_SIZE`] bytes.
///
/// A chunk boundary never falls inside a UTF-8 code point. Invalid UTF-8 is
/// replaced rather than rejected, since legacy logs were never validated.
pub fn chunk_legacy_log(raw: &[u8]) -> Vec<Event> {
    let mut events = Vec::with_capacity(raw.len() / LEGACY_CHUNK_SIZE + 1);
    let mut start = 0;

    while start < raw.len() {
        let end = chunk_end(raw, start);
        let payload = String::from_utf8_lossy(&raw[start..end]);

        events.push(Event::new(
            "log",
            "1.0",
            json!({
                "origin": { "type": "run", "name": "" },
                "payload": payload,
            }),
        ));

        start = end;
    }

    events
}

fn chunk_end(raw: &[u8], start: usize) -> usize {
    let limit = (start + LEGACY_CHUNK_SIZE).min(raw.len());
    if limit == raw.len() {
        return limit;
    }

    // Back off over continuation bytes so the next chunk starts on a
    // code point boundary. A code point is at most 4 bytes.
    let mut end = limit;
    while end > start && end + 3 >= limit && is_continuation(raw[end]) {
        end -= 1;
    }

    if end == start { limit } else { end }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payloads(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|e| e.payload["payload"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_empty_log_has_no_chunks() {
        assert!(chunk_legacy_log(b"").is_empty());
    }

    #[test]
    fn test_short_log_is_one_chunk() {
        let events = chunk_legacy_log(b"hello world");
        assert_eq!(payloads(&events), vec!["hello world".to_string()]);
        assert_eq!(events[0].version.as_str(), "1.0");
        assert_eq!(events[0].event_type.as_str(), "log");
    }

    #[test]
    fn test_ascii_splits_at_chunk_size() {
        let raw = vec![b'a'; LEGACY_CHUNK_SIZE * 2 + 10];
        let events = chunk_legacy_log(&raw);
        let sizes: Vec<usize> = payloads(&events).iter().map(String::len).collect();
        assert_eq!(sizes, vec![LEGACY_CHUNK_SIZE, LEGACY_CHUNK_SIZE, 10]);
    }

    #[test]
    fn test_multibyte_never_split() {
        // 1023 ASCII bytes followed by a 3-byte code point straddling the limit.
        let mut raw = vec![b'a'; LEGACY_CHUNK_SIZE - 1];
        raw.extend_from_slice("€".as_bytes());
        raw.extend_from_slice(b"tail");

        let events = chunk_legacy_log(&raw);
        let chunks = payloads(&events);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), LEGACY_CHUNK_SIZE - 1);
        assert_eq!(chunks[1], "€tail");
        assert_eq!(chunks.concat().as_bytes(), raw.as_slice());
    }

    #[test]
    fn test_all_multibyte_reassembles() {
        let text = "日本語".repeat(1000);
        let events = chunk_legacy_log(text.as_bytes());
        let chunks = payloads(&events);

        assert!(chunks.iter().all(|c| c.len() <= LEGACY_CHUNK_SIZE));
        assert_eq!(chunks.concat(), text);
    }
}
