//! Server-Sent Events (SSE) decoding for the chat subscription.
//!
//! This module turns the raw byte stream of a subscribe response into a
//! stream of [`StreamEvent`]s, handling buffering across chunk boundaries and
//! malformed frames.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::observability::{STREAM_BYTES, STREAM_EVENTS};
use crate::{Error, MessageEvent, Result, StreamEvent};

/// Decode a stream of bytes into a stream of named chat events.
///
/// Frames are delimited by double newlines; each frame carries an
/// `event:` name line and a `data:` payload line. Malformed or unknown
/// frames yield error items without terminating the stream.
pub fn process_sse<S>(byte_stream: S) -> impl Stream<Item = Result<StreamEvent>>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin + 'static,
{
    let stream = byte_stream.map(|result| {
        result
            .map_err(|e| Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e))))
    });

    let buffer = String::new();

    stream::unfold(
        (stream, buffer),
        move |(mut stream, mut buffer)| async move {
            loop {
                if let Some((event, remaining)) = extract_event(&buffer) {
                    buffer = remaining;
                    if event.is_ok() {
                        STREAM_EVENTS.click();
                    }
                    return Some((event, (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        STREAM_BYTES.count(bytes.len() as u64);
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => buffer.push_str(&text),
                            Err(e) => {
                                return Some((
                                    Err(Error::encoding(
                                        format!("Invalid UTF-8 in stream: {e}"),
                                        Some(Box::new(e)),
                                    )),
                                    (stream, buffer),
                                ));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(e), (stream, buffer)));
                    }
                    None => {
                        // End of stream; flush any complete trailing frame.
                        if !buffer.is_empty() {
                            if let Some((event, _)) = extract_event(&buffer) {
                                return Some((event, (stream, buffer)));
                            }
                        }
                        return None;
                    }
                }
            }
        },
    )
}

/// Extract a complete SSE frame from the buffer, if one is present.
fn extract_event(buffer: &str) -> Option<(Result<StreamEvent>, String)> {
    let (frame, rest) = buffer.split_once("\n\n")?;
    let rest = rest.to_string();

    let Some((name_line, data_line)) = frame.split_once('\n') else {
        return Some((
            Err(Error::serialization(
                format!("Malformed SSE frame: missing newline separator in '{frame}'"),
                None,
            )),
            rest,
        ));
    };

    let Some(name) = name_line.strip_prefix("event:").map(str::trim) else {
        return Some((
            Err(Error::serialization(
                format!("Malformed SSE frame: missing 'event:' prefix in '{name_line}'"),
                None,
            )),
            rest,
        ));
    };

    let Some(data) = data_line.strip_prefix("data:").map(str::trim) else {
        return Some((
            Err(Error::serialization(
                format!("Malformed SSE frame: missing 'data:' prefix in '{data_line}'"),
                None,
            )),
            rest,
        ));
    };

    Some((parse_event(name, data), rest))
}

/// Dispatch a frame by event name.
fn parse_event(name: &str, data: &str) -> Result<StreamEvent> {
    match name {
        "connected" => Ok(StreamEvent::Connected),
        "heartbeat" => Ok(StreamEvent::Heartbeat),
        "done" => Ok(StreamEvent::Done),
        "message" => match serde_json::from_str::<MessageEvent>(data) {
            Ok(event) => Ok(StreamEvent::Message(event)),
            Err(e) => Err(e.into()),
        },
        "error" => Err(Error::api(
            500,
            Some("stream_error".to_string()),
            data.to_string(),
            None,
        )),
        _ => Err(Error::serialization(
            format!("Unknown SSE event type: {name}"),
            None,
        )),
    }
}
