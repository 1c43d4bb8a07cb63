use futures::stream::{self, Stream, StreamExt};
use hyper::body::{Bytes, Frame};
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::broadcast::{SessionEvent, Subscription};

/// Comment sent on idle streams so dead connections are noticed
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `event: <name>\ndata: <json>\n\n`
pub fn encode_event(event: &SessionEvent) -> serde_json::Result<Bytes> {
    let payload = event.payload_json()?;
    Ok(Bytes::from(format!("event: {}\ndata: {}\n\n", event.name(), payload)))
}

/// Body frames for one observer. Ends when the hub goes away; dropping the
/// stream (client disconnect) drops the subscription and unregisters it.
pub fn event_stream(
    subscription: Subscription,
) -> impl Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + 'static {
    let keepalive = time::interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    let hello = stream::once(async { Ok(Frame::data(Bytes::from_static(b": connected\n\n"))) });

    let events = stream::unfold(
        (subscription, keepalive),
        |(mut subscription, mut keepalive)| async move {
            let chunk = loop {
                tokio::select! {
                    event = subscription.recv() => {
                        let event = event?;
                        match encode_event(&event) {
                            Ok(chunk) => break chunk,
                            Err(e) => {
                                warn!("Dropping unencodable {} event: {}", event.name(), e);
                                continue;
                            }
                        }
                    }
                    _ = keepalive.tick() => break Bytes::from_static(b": keepalive\n\n"),
                }
            };
            Some((Ok(Frame::data(chunk)), (subscription, keepalive)))
        },
    );

    hello.chain(events)
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Feed it raw chunks as they arrive; complete events come out once their
/// terminating blank line has been seen. Comments and unnamed events are
/// skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(event name, data)` pairs completed by this chunk
    pub fn push(&mut self, chunk: &str) -> Vec<(String, String)> {
        self.buffer.push_str(chunk);
        let mut complete = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                let data = std::mem::take(&mut self.data).join("\n");
                match self.event.take() {
                    Some(name) => complete.push((name, data)),
                    None if !data.is_empty() => debug!("Ignoring unnamed event"),
                    None => {}
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        complete
    }
}
