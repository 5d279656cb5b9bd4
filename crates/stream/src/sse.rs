use std::collections::VecDeque;

use futures::{Stream, StreamExt, stream};

use crate::event::StreamEvent;

/// Blank line terminating one frame.
pub const FRAME_SEPARATOR: &[u8] = b"\n\n";
pub const DATA_FIELD: &str = "data:";
pub const COMMENT_SENTINEL: char = ':';

/// Incremental SSE frame decoder.
///
/// Bytes are buffered until a complete frame is available; frames are cut on
/// raw bytes before UTF-8 decoding, so a character split across chunks is
/// reassembled intact. At most one partial frame is held at a time.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    // Offset before which the buffer is known to hold no separator.
    scanned: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every event completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.next_separator() {
            let frame = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
            self.buffer.drain(..end + FRAME_SEPARATOR.len());
            self.scanned = 0;
            events.extend(parse_frame(&frame));
        }
        // A separator may straddle the next chunk boundary by one byte.
        self.scanned = self.buffer.len().saturating_sub(FRAME_SEPARATOR.len() - 1);
        events
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.push(chunk.as_bytes())
    }

    /// Bytes of the pending, unterminated frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Ends the input. An unterminated trailing frame is discarded and
    /// returned for diagnostics.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return None;
        }

        let partial = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        tracing::debug!(
            pending_bytes = partial.len(),
            "discarding unterminated trailing sse frame"
        );
        Some(partial)
    }

    fn next_separator(&self) -> Option<usize> {
        let start = self.scanned.min(self.buffer.len());
        self.buffer[start..]
            .windows(FRAME_SEPARATOR.len())
            .position(|window| window == FRAME_SEPARATOR)
            .map(|offset| start + offset)
    }
}

/// Decodes the `data:` lines of one frame.
///
/// Comment lines (heartbeats) and other fields are ignored; a payload that is
/// not a valid [`StreamEvent`] is dropped without affecting its neighbours.
pub fn parse_frame(frame: &str) -> Vec<StreamEvent> {
    frame
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_SENTINEL))
        .filter_map(|line| line.strip_prefix(DATA_FIELD))
        .map(str::trim)
        .filter(|payload| !payload.is_empty())
        .filter_map(|payload| match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::debug!(error = %error, payload, "dropping malformed sse data line");
                None
            }
        })
        .collect()
}

struct DecodeState<S> {
    chunks: S,
    decoder: SseDecoder,
    ready: VecDeque<StreamEvent>,
    exhausted: bool,
}

/// Adapts a stream of byte chunks into a stream of decoded events.
///
/// A chunk error is yielded once and ends the stream.
pub fn decode_stream<S, B, E>(chunks: S) -> impl Stream<Item = Result<StreamEvent, E>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    let state = DecodeState {
        chunks,
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.exhausted {
                return None;
            }

            match state.chunks.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(chunk.as_ref());
                    state.ready.extend(events);
                }
                Some(Err(error)) => {
                    state.exhausted = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.exhausted = true;
                    let _ = state.decoder.finish();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    const TRANSCRIPT: &str = concat!(
        "data: {\"type\":\"start\"}\n\n",
        ": ping\n\n",
        "data: {\"type\":\"token\",\"delta\":\"基站\"}\n\n",
        "data: {\"type\":\"log\",\"channel\":\"router\",\"message\":\"hit\"}\n\n",
        "data: not json at all\n\n",
        "data: {\"type\":\"token\",\"delta\":\" ok\"}\n\n",
        "data: {\"type\":\"end\"}\n\n",
    );

    fn expected() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start,
            StreamEvent::token("基站"),
            StreamEvent::log(Some("router"), "hit"),
            StreamEvent::token(" ok"),
            StreamEvent::End,
        ]
    }

    #[test]
    fn heartbeat_only_frame_yields_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push_str(": ping\n\n").is_empty());
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn malformed_payload_does_not_stop_later_frames() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push_str("data: {broken\n\n").is_empty());
        assert_eq!(
            decoder.push_str("data: {\"type\":\"token\",\"delta\":\"x\"}\n\n"),
            vec![StreamEvent::token("x")]
        );
    }

    #[test]
    fn decodes_transcript_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push_str(TRANSCRIPT), expected());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn any_split_point_yields_the_same_events() {
        let bytes = TRANSCRIPT.as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = SseDecoder::new();
            let mut events = decoder.push(&bytes[..split]);
            events.extend(decoder.push(&bytes[split..]));
            assert_eq!(events, expected(), "split at byte {split}");
        }
    }

    #[test]
    fn byte_at_a_time_keeps_multibyte_text_intact() {
        let mut decoder = SseDecoder::new();
        let events = TRANSCRIPT
            .as_bytes()
            .iter()
            .flat_map(|byte| decoder.push(std::slice::from_ref(byte)))
            .collect::<Vec<_>>();
        assert_eq!(events, expected());
    }

    #[test]
    fn frame_lines_are_trimmed_and_non_data_fields_ignored() {
        let frame = concat!(
            "  event: message\r\n",
            "  data:   {\"type\":\"token\",\"delta\":\"a\"}  \r\n\r\n",
            "id: 7\n:comment\ndata:\n",
        );
        assert_eq!(parse_frame(frame), vec![StreamEvent::token("a")]);
    }

    #[test]
    fn multiple_data_lines_in_one_frame_decode_in_order() {
        let frame = concat!(
            "data: {\"type\":\"token\",\"delta\":\"a\"}\n",
            "data: {\"type\":\"token\",\"delta\":\"b\"}",
        );
        assert_eq!(
            parse_frame(frame),
            vec![StreamEvent::token("a"), StreamEvent::token("b")]
        );
    }

    #[test]
    fn finish_reports_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push_str("data: {\"type\":\"end\"}").is_empty());
        assert_eq!(
            decoder.finish().as_deref(),
            Some("data: {\"type\":\"end\"}")
        );
        assert_eq!(decoder.pending_len(), 0);
    }

    #[tokio::test]
    async fn decode_stream_adapts_chunked_bodies() {
        let chunks = TRANSCRIPT
            .as_bytes()
            .chunks(7)
            .map(|chunk| Ok::<_, Infallible>(chunk.to_vec()))
            .collect::<Vec<_>>();
        let events = decode_stream(stream::iter(chunks))
            .map(|event| event.unwrap())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events, expected());
    }

    #[tokio::test]
    async fn decode_stream_surfaces_chunk_errors_once() {
        let chunks = vec![
            Ok(b"data: {\"type\":\"token\",\"delta\":\"a\"}\n\n".to_vec()),
            Err("connection reset"),
            Ok(b"data: {\"type\":\"end\"}\n\n".to_vec()),
        ];
        let items = decode_stream(stream::iter(chunks)).collect::<Vec<_>>().await;
        assert_eq!(items, vec![Ok(StreamEvent::token("a")), Err("connection reset")]);
    }
}
