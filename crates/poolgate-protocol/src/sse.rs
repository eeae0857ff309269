use bytes::Bytes;

/// One wire-level SSE frame: the raw bytes exactly as received (terminator
/// included) plus the parsed `event`/`data` fields. Frames that only carry a
/// comment line parse to `event: None, data: ""` but keep their raw bytes so
/// they can be relayed untouched.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub raw: Bytes,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental scanner that splits an SSE byte stream into frames at blank
/// lines without normalizing anything in between.
#[derive(Debug, Default)]
pub struct SseFrameScanner {
    buffer: Vec<u8>,
}

impl SseFrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(end) = frame_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end).collect();
            frames.push(parse_frame(Bytes::from(raw)));
        }
        frames
    }

    /// Flush a trailing frame that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            self.buffer.clear();
            return None;
        }
        let raw: Vec<u8> = std::mem::take(&mut self.buffer);
        Some(parse_frame(Bytes::from(raw)))
    }
}

fn frame_end(buffer: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (i, byte) in buffer.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let mut line = &buffer[line_start..i];
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return Some(i + 1);
        }
        line_start = i + 1;
    }
    None
}

fn parse_frame(raw: Bytes) -> SseFrame {
    let mut event = None;
    let mut data_lines: Vec<String> = Vec::new();

    let text = String::from_utf8_lossy(&raw);
    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            continue;
        }
        if line == "event" {
            event = None;
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start().to_string());
            continue;
        }
        if line == "data" {
            data_lines.push(String::new());
        }
    }

    SseFrame {
        raw,
        event,
        data: data_lines.join("\n"),
    }
}

/// Serialize an event back to wire form. Used for frames whose payload was
/// rewritten; untouched frames are relayed via `SseFrame::raw` instead.
pub fn encode_event(event: Option<&str>, data: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(data.len() + 32);
    if let Some(name) = event {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b"\n");
    }
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\n\n");
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_named_events() {
        let mut scanner = SseFrameScanner::new();
        let frames = scanner.push(b"event: message_start\ndata: {\"a\":1}\n\nevent: ping\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].event.as_deref(), Some("ping"));
    }

    #[test]
    fn raw_bytes_are_preserved_exactly() {
        let mut scanner = SseFrameScanner::new();
        let wire = b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0}\n\n";
        let frames = scanner.push(wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].raw.as_ref(), wire.as_slice());
    }

    #[test]
    fn handles_split_chunks() {
        let mut scanner = SseFrameScanner::new();
        assert!(scanner.push(b"data: {\"par").is_empty());
        assert!(scanner.push(b"tial\":true}").is_empty());
        let frames = scanner.push(b"\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"partial\":true}");
    }

    #[test]
    fn crlf_lines_parse() {
        let mut scanner = SseFrameScanner::new();
        let frames = scanner.push(b"event: message_stop\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn comment_frame_keeps_raw_and_parses_empty() {
        let mut scanner = SseFrameScanner::new();
        let frames = scanner.push(b": ping\n\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].event.is_none());
        assert!(frames[0].data.is_empty());
        assert_eq!(frames[0].raw.as_ref(), b": ping\n\n");
    }

    #[test]
    fn multiline_data_joined_with_newline() {
        let mut scanner = SseFrameScanner::new();
        let frames = scanner.push(b"data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut scanner = SseFrameScanner::new();
        assert!(scanner.push(b"data: tail").is_empty());
        let frame = scanner.finish().unwrap();
        assert_eq!(frame.data, "tail");
        assert!(scanner.finish().is_none());
    }

    #[test]
    fn encode_event_round_trips_through_scanner() {
        let encoded = encode_event(Some("message_delta"), b"{\"usage\":{\"output_tokens\":5}}");
        let mut scanner = SseFrameScanner::new();
        let frames = scanner.push(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_delta"));
        assert_eq!(frames[0].data, "{\"usage\":{\"output_tokens\":5}}");
    }
}
