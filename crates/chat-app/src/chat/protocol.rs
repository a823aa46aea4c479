//! Wire format for generation events.
//!
//! Every event is one server-sent-events frame:
//!
//! ```text
//! event: chunk
//! data: {"type":"chunk","part":"text","delta":"Hel"}
//!
//! ```
//!
//! The JSON body carries its own `type` tag, so consumers that ignore the `event:` line
//! still decode correctly. Decoders skip event types they do not know.

use arbor_storage::{MessageId, MessageRecord};
use serde::{Deserialize, Serialize};

/// Which accumulation channel a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPart {
    Text,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    UserMessage {
        message: MessageRecord,
    },
    GenerationStarted {
        handle_id: u64,
        message_id: MessageId,
    },
    Chunk {
        part: ChunkPart,
        delta: String,
    },
    Complete {
        message: MessageRecord,
    },
    NoOutput {
        message_id: MessageId,
    },
    Error {
        message: String,
        #[serde(default)]
        partial: Option<MessageRecord>,
    },
    Aborted {
        #[serde(default)]
        partial: Option<MessageRecord>,
    },
    /// Any event type this build does not recognise.
    #[serde(other)]
    Unknown,
}

impl ChatEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Chunk {
            part: ChunkPart::Text,
            delta: delta.into(),
        }
    }

    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self::Chunk {
            part: ChunkPart::Reasoning,
            delta: delta.into(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::GenerationStarted { .. } => "generation_started",
            Self::Chunk { .. } => "chunk",
            Self::Complete { .. } => "complete",
            Self::NoOutput { .. } => "no_output",
            Self::Error { .. } => "error",
            Self::Aborted { .. } => "aborted",
            Self::Unknown => "unknown",
        }
    }

    /// True for the events that end a generation stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. }
                | Self::NoOutput { .. }
                | Self::Error { .. }
                | Self::Aborted { .. }
        )
    }
}

/// Encodes one event as an SSE frame.
pub fn encode_frame(event: &ChatEvent) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(event)?;
    Ok(format!("event: {}\ndata: {data}\n\n", event.event_type()))
}

/// Incremental SSE decoder; feed it arbitrary byte slices as they arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames dropped so far because they were unknown or unreadable.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Appends `chunk` and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ChatEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((frame_end, separator_len)) = find_frame_end(&self.buffer) {
            let frame = self.buffer.drain(..frame_end + separator_len).collect::<Vec<_>>();
            match decode_frame(&frame[..frame_end]) {
                Some(ChatEvent::Unknown) | None => self.skipped += 1,
                Some(event) => events.push(event),
            }
        }
        events
    }

    /// True when a partial frame is still buffered.
    pub fn has_pending(&self) -> bool {
        self.buffer.iter().any(|byte| !byte.is_ascii_whitespace())
    }
}

/// Returns the index where the first complete frame ends and the separator length.
fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|window| window == b"\n\n");
    let crlf = buffer.windows(4).position(|window| window == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

fn decode_frame(frame: &[u8]) -> Option<ChatEvent> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(error) => {
            tracing::warn!(error = %error, "dropping non utf-8 sse frame");
            return None;
        }
    };

    let data = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        // Comment or keep-alive frame.
        return None;
    }

    match serde_json::from_str::<ChatEvent>(&data) {
        Ok(event) => Some(event),
        Err(error) => {
            tracing::warn!(error = %error, "dropping unreadable sse frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_event_name_and_tagged_json() {
        let frame = encode_frame(&ChatEvent::text("Hel")).unwrap();
        assert_eq!(
            frame,
            "event: chunk\ndata: {\"type\":\"chunk\",\"part\":\"text\",\"delta\":\"Hel\"}\n\n"
        );

        let started = ChatEvent::GenerationStarted {
            handle_id: 7,
            message_id: MessageId::new_v7(),
        };
        assert!(
            encode_frame(&started)
                .unwrap()
                .starts_with("event: generation_started\ndata: {\"type\":\"generation_started\"")
        );
    }

    #[test]
    fn decoder_reassembles_frames_split_across_chunks() {
        let mut wire = String::new();
        wire.push_str(&encode_frame(&ChatEvent::reasoning("think")).unwrap());
        wire.push_str(&encode_frame(&ChatEvent::text("héllo")).unwrap());
        let bytes = wire.as_bytes();

        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        // Single-byte pushes split the multi-byte character as well.
        for byte in bytes {
            events.extend(decoder.push(std::slice::from_ref(byte)));
        }

        assert_eq!(
            events,
            vec![ChatEvent::reasoning("think"), ChatEvent::text("héllo")]
        );
        assert!(!decoder.has_pending());
    }

    #[test]
    fn decoder_skips_unknown_event_types() {
        let mut decoder = FrameDecoder::new();
        let wire = concat!(
            "event: usage\ndata: {\"type\":\"usage\",\"tokens\":12}\n\n",
            ": keep-alive\n\n",
            "event: no_output\r\n",
        );
        let mut events = decoder.push(wire.as_bytes());
        assert!(events.is_empty());
        assert!(decoder.has_pending());

        let message_id = MessageId::new_v7();
        let tail = format!(
            "data: {{\"type\":\"no_output\",\"message_id\":\"{message_id}\"}}\r\n\r\n"
        );
        events.extend(decoder.push(tail.as_bytes()));

        assert_eq!(events, vec![ChatEvent::NoOutput { message_id }]);
        assert_eq!(decoder.skipped(), 2);
    }

    #[test]
    fn error_and_aborted_default_partial_to_none() {
        let error: ChatEvent =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(
            error,
            ChatEvent::Error {
                message: "boom".to_string(),
                partial: None
            }
        );
        assert!(error.is_terminal());

        let aborted: ChatEvent = serde_json::from_str(r#"{"type":"aborted"}"#).unwrap();
        assert_eq!(aborted, ChatEvent::Aborted { partial: None });
    }
}
