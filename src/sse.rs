//! Server-Sent-Events relay.
//!
//! A relay pumps pre-framed chunks from a source stream into an HTTP body.
//! One task runs per open response and waits on three things at once: the
//! next source item, the heartbeat timer, and the client going away. When the
//! client disconnects the body receiver is dropped, the task returns, and the
//! source (and the daemon subscription behind it) is dropped with it.

use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;

/// Heartbeat period for log and event streams.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub const HEARTBEAT_FRAME: &[u8] = b": heartbeat\n\n";
pub const EOF_FRAME: &[u8] = b"data: [EOF]\n\n";

const CHANNEL_CAPACITY: usize = 16;

/// How a relay behaves around the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Comment frame period; `None` disables heartbeats.
    pub heartbeat: Option<Duration>,
    /// Write `data: [EOF]` when the source ends.
    pub eof_marker: bool,
}

impl RelayOptions {
    /// Log and pull streams: heartbeats and an EOF marker.
    pub fn logs() -> Self {
        Self {
            heartbeat: Some(HEARTBEAT_INTERVAL),
            eof_marker: true,
        }
    }

    /// Daemon events: heartbeats only, the feed never ends on its own.
    pub fn events() -> Self {
        Self {
            heartbeat: Some(HEARTBEAT_INTERVAL),
            eof_marker: false,
        }
    }

    /// Periodic snapshots double as the heartbeat.
    pub fn snapshots() -> Self {
        Self {
            heartbeat: None,
            eof_marker: false,
        }
    }
}

/// `data: <line>` for a log line that already ends in `\n`.
pub fn line_frame(line: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(line.len() + 7);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(line);
    frame.extend_from_slice(b"\n");
    frame.freeze()
}

/// `data: <json>` followed by a blank line.
pub fn json_frame<T: Serialize>(value: &T) -> serde_json::Result<Bytes> {
    let json = serde_json::to_string(value)?;
    Ok(Bytes::from(format!("data: {}\n\n", json)))
}

/// A named `message` event carrying JSON.
pub fn message_frame<T: Serialize>(value: &T) -> serde_json::Result<Bytes> {
    let json = serde_json::to_string(value)?;
    Ok(Bytes::from(format!("event: message\ndata: {}\n\n", json)))
}

/// Build an event-stream response and spawn its relay task.
pub fn response<S, E>(source: S, options: RelayOptions) -> Response
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run(source, tx, options));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Wait for the first item before committing to a stream.
///
/// A source that fails before producing anything yields the error so the
/// caller can still answer with a JSON error. Otherwise the first item is
/// put back in front of the rest.
pub async fn commit_on_first_item<S, T, E>(
    mut source: S,
) -> Result<Pin<Box<dyn Stream<Item = Result<T, E>> + Send>>, E>
where
    S: Stream<Item = Result<T, E>> + Send + Unpin + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    match source.next().await {
        Some(Err(e)) => Err(e),
        Some(Ok(first)) => Ok(Box::pin(futures::stream::iter([Ok(first)]).chain(source))),
        None => Ok(Box::pin(futures::stream::empty())),
    }
}

/// Relay loop. Returns when the source ends or errors, or the client leaves.
///
/// A source error is forwarded as a body error, which aborts the response
/// instead of ending it cleanly.
pub async fn run<S, E>(source: S, tx: mpsc::Sender<io::Result<Bytes>>, options: RelayOptions)
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Display,
{
    let mut source = std::pin::pin!(source);
    let mut heartbeat = options.heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let item = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::debug!("SSE client disconnected");
                return;
            }
            item = source.next() => item,
            _ = tick(&mut heartbeat) => {
                if tx.send(Ok(Bytes::from_static(HEARTBEAT_FRAME))).await.is_err() {
                    return;
                }
                continue;
            }
        };

        match item {
            Some(Ok(frame)) => {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "SSE source failed, closing stream");
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return;
            }
            None => {
                if options.eof_marker {
                    let _ = tx.send(Ok(Bytes::from_static(EOF_FRAME))).await;
                }
                return;
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
