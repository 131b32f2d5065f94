use super::TransportMessage;

/// Incremental server-sent-events decoder; tolerates events split across chunks.
///
/// The `data:` lines of one event are joined with `data_joiner`. Joining with
/// the frame separator makes every data line its own frame.
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    data_joiner: String,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new("\n")
    }
}

impl SseDecoder {
    pub fn new(data_joiner: impl Into<String>) -> Self {
        Self {
            buf: Vec::new(),
            data_joiner: data_joiner.into(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<TransportMessage> {
        self.buf.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some((idx, delim_len)) = find_event_delimiter(&self.buf) {
            let event_bytes = self.buf[..idx].to_vec();
            self.buf.drain(..idx + delim_len);
            if let Some(message) = parse_sse_event(&event_bytes, &self.data_joiner) {
                messages.push(message);
            }
        }
        messages
    }

    /// Flushes a trailing event the server did not terminate with a blank line.
    pub fn finish(&mut self) -> Option<TransportMessage> {
        let rest = std::mem::take(&mut self.buf);
        parse_sse_event(&rest, &self.data_joiner)
    }
}

fn find_event_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_event(bytes: &[u8], data_joiner: &str) -> Option<TransportMessage> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        // Comments double as keep-alives.
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(TransportMessage {
        event,
        data: data_lines.join(data_joiner),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let part1 = b"event: message\ndata: {\"type\":\"streaming_chunk\",\"contentChunk\":\"hel";
        let part2 = b"lo\"}\n\n";
        assert!(decoder.push_chunk(part1).is_empty());
        let messages = decoder.push_chunk(part2);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event.as_deref(), Some("message"));
        assert!(messages[0].data.ends_with("\"hello\"}"));
    }

    #[test]
    fn keep_alive_comments_produce_nothing() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b": ping\n\n").is_empty());
    }

    #[test]
    fn multi_line_data_is_joined_and_crlf_accepted() {
        let mut decoder = SseDecoder::default();
        let messages = decoder.push_chunk(b"data: first\r\ndata: second\r\n\r\ndata: [DONE]\n\n");
        assert_eq!(
            messages,
            vec![
                TransportMessage::data("first\nsecond"),
                TransportMessage::data("[DONE]")
            ]
        );
    }

    #[test]
    fn data_lines_become_separate_frames_with_frame_joiner() {
        let mut decoder = SseDecoder::new("\n\n");
        let messages = decoder.push_chunk(
            b"data: {\"type\":\"done\"}\ndata: {\"type\":\"connection_ack\"}\n\n",
        );
        let frames = crate::frame::FrameParser::default().split(&messages[0].data);
        assert_eq!(
            frames,
            vec!["{\"type\":\"done\"}", "{\"type\":\"connection_ack\"}"]
        );
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some(TransportMessage::data("tail")));
        assert_eq!(decoder.finish(), None);
    }
}
