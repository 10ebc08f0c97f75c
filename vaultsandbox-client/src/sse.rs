// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoder for the server-sent event stream announcing new emails.
use futures_util::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;
use tracing::trace;
use vaultsandbox_core::EncryptedPayload;

use crate::transport::EventStream;

/// Name of the event announcing a new email.
pub const EMAIL_EVENT: &str = "email";

/// Lines longer than this are treated as a broken stream.
const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Upper bound for the joined data of one event.
const MAX_EVENT_SIZE: usize = 4 * 1024 * 1024;

/// One dispatched server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name, `message` when the server did not set one.
    pub event: String,
    /// Payload, multiple `data:` lines are joined with a line feed.
    pub data: String,
    /// Last event id seen on the stream.
    pub id: Option<String>,
}

/// Notification about a new email in one of the subscribed inboxes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    /// Hash of the inbox which received the email.
    pub inbox_id: String,
    pub email_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_metadata: Option<EncryptedPayload>,
}

impl TryFrom<&SseEvent> for PushEvent {
    type Error = SseError;

    fn try_from(value: &SseEvent) -> Result<Self, Self::Error> {
        serde_json::from_str(&value.data).map_err(SseError::InvalidPayload)
    }
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Accepts LF and CRLF line endings, ignores comments and unknown fields. An event which is not
/// terminated by an empty line when the stream ends is discarded.
#[derive(Debug, Default)]
pub struct SseCodec {
    event: Option<String>,
    data: Option<String>,
    last_id: Option<String>,
}

impl SseCodec {
    fn process_line(&mut self, line: &[u8]) -> Result<Option<SseEvent>, SseError> {
        if line.is_empty() {
            return Ok(self.dispatch());
        }

        let line = String::from_utf8_lossy(line);
        if line.starts_with(':') {
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    let size = data.len() + 1 + value.len();
                    if size > MAX_EVENT_SIZE {
                        self.data = None;
                        return Err(SseError::EventTooLarge(size));
                    }
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" => self.last_id = Some(value.to_string()),
            _ => trace!(field, "ignore sse field"),
        }

        Ok(None)
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let data = self.data.take()?;
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}

impl Decoder for SseCodec {
    type Item = SseEvent;
    type Error = SseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(position) = src.iter().position(|byte| *byte == b'\n') {
            let line = src.split_to(position + 1);
            let line = &line[..position];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if let Some(event) = self.process_line(line)? {
                return Ok(Some(event));
            }
        }

        if src.len() > MAX_LINE_LENGTH {
            return Err(SseError::LineTooLong(src.len()));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None => {
                src.clear();
                self.event = None;
                self.data = None;
                Ok(None)
            }
        }
    }
}

/// Decodes the raw bytes of an event stream into server-sent events.
pub fn decode_events(
    stream: EventStream,
) -> impl Stream<Item = Result<SseEvent, SseError>> + Send + Unpin {
    let reader = StreamReader::new(stream.map_err(std::io::Error::other));
    FramedRead::new(reader, SseCodec::default())
}

#[derive(Debug, Error)]
pub enum SseError {
    #[error("event stream failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("line of {0} bytes exceeds the maximum length")]
    LineTooLong(usize),

    #[error("event data of {0} bytes exceeds the maximum size")]
    EventTooLarge(usize),

    #[error("invalid event payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures_util::StreamExt;
    use futures_util::stream;
    use tokio_util::bytes::{Bytes, BytesMut};
    use tokio_util::codec::Decoder;

    use crate::transport::TransportError;

    use super::{PushEvent, SseCodec, SseError, SseEvent, decode_events};

    fn decode_all(input: &str) -> Vec<SseEvent> {
        let mut codec = SseCodec::default();
        let mut buffer = BytesMut::from(input.as_bytes());
        let mut events = Vec::new();
        while let Some(event) = codec.decode_eof(&mut buffer).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn single_event() {
        let events = decode_all(
            "event: email\ndata: {\"inboxId\":\"h\",\"emailId\":\"e\"}\n\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "email");

        let push = PushEvent::try_from(&events[0]).unwrap();
        assert_eq!(push.inbox_id, "h");
        assert_eq!(push.email_id, "e");
        assert!(push.encrypted_metadata.is_none());
    }

    #[test]
    fn line_endings_comments_and_fields() {
        let events = decode_all(
            ": keep-alive\r\nretry: 1000\r\nid: 7\r\nevent: email\r\ndata: a\r\ndata:b\r\n\r\ndata: c\n\n",
        );
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "email".into(),
                    data: "a\nb".into(),
                    id: Some("7".into()),
                },
                SseEvent {
                    event: "message".into(),
                    data: "c".into(),
                    id: Some("7".into()),
                },
            ]
        );
    }

    #[test]
    fn empty_events_and_trailing_data() {
        // An event without data lines is not dispatched, unterminated events are dropped.
        let events = decode_all("event: ping\n\ndata: unterminated\n");
        assert!(events.is_empty());
    }

    #[test]
    fn invalid_payload() {
        let event = SseEvent {
            event: "email".into(),
            data: "{not json".into(),
            id: None,
        };
        assert_matches!(PushEvent::try_from(&event), Err(SseError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn chunks_split_mid_line() {
        let chunks: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"event: em")),
            Ok(Bytes::from_static(b"ail\r")),
            Ok(Bytes::from_static(b"\ndata: {\"inboxId\":\"h\",")),
            Ok(Bytes::from_static(b"\"emailId\":\"e\"}\r\n\r\nevent: email\n")),
            Ok(Bytes::from_static(b"data: {}\n\n")),
        ];
        let mut events = decode_events(stream::iter(chunks).boxed());

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.event, "email");
        assert_eq!(PushEvent::try_from(&first).unwrap().email_id, "e");

        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.data, "{}");

        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_error() {
        let chunks: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Err(TransportError::Network("connection reset".into())),
        ];
        let mut events = decode_events(stream::iter(chunks).boxed());

        assert_eq!(events.next().await.unwrap().unwrap().data, "1");
        assert_matches!(events.next().await, Some(Err(SseError::Io(_))));
    }

    #[test]
    fn oversized_event_is_rejected() {
        let line = format!("data: {}\n", "x".repeat(1024 * 1024));
        let mut codec = SseCodec::default();
        let mut buffer = BytesMut::from(line.repeat(5).as_bytes());

        assert_matches!(
            codec.decode(&mut buffer),
            Err(SseError::EventTooLarge(size)) if size > 4 * 1024 * 1024
        );

        // Within the limit many data lines are fine.
        let mut codec = SseCodec::default();
        let mut buffer = BytesMut::from(format!("{}\n", line.repeat(3)).as_bytes());
        let event = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(event.data.len(), 3 * 1024 * 1024 + 2);
    }
}
