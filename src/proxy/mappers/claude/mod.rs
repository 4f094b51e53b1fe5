pub mod collector;
pub mod models;
pub mod request;
pub mod response;
pub mod signatures;
pub mod streaming;

pub use collector::collect_stream_to_json;
pub use request::build_backend_request;
pub use response::transform_response;
pub use streaming::StreamingState;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::time::Duration;

pub type ClaudeEventStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

const STREAM_STALL_TIMEOUT: Duration = Duration::from_secs(30);

// Transcodes the backend SSE byte stream into the public event stream, one
// upstream event per yield. The reqwest body is owned by the returned stream
// and is released when the consumer finishes or drops it, which also aborts
// the in-flight read.
pub fn create_event_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
) -> ClaudeEventStream {
    Box::pin(async_stream::stream! {
        let mut state = StreamingState::new();
        let mut buffer = BytesMut::new();

        'read: loop {
            match tokio::time::timeout(STREAM_STALL_TIMEOUT, upstream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    buffer.extend_from_slice(&chunk);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line) = std::str::from_utf8(&line_raw) else { continue };
                        let line = line.trim();
                        if line.is_empty() || line.starts_with(':') {
                            continue;
                        }
                        let Some(data) = line.strip_prefix("data:") else { continue };
                        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data.trim())
                        else {
                            tracing::debug!("Skipping unparseable SSE line ({} bytes)", data.len());
                            continue;
                        };
                        // The backend wraps each event in a `response` envelope.
                        let payload = parsed.get("response").unwrap_or(&parsed);
                        for chunk in state.process_payload(payload) {
                            yield Ok(chunk);
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    yield Err(format!("Stream error: {}", e));
                    break 'read;
                }
                Ok(None) => break 'read,
                Err(_) => {
                    // Keep the client connection warm while upstream stalls.
                    yield Ok(Bytes::from(": ping\n\n"));
                }
            }
        }

        for chunk in state.finalize() {
            yield Ok(chunk);
        }
    })
}
