//! Subscription multiplexing.
//!
//! Each client subscription opens exactly one upstream SSE stream
//! against the owning subgraph. A pump task copies frames into a
//! bounded channel: upstream order is preserved, a slow client that
//! overflows the buffer terminates with `BUFFER_OVERFLOW` (never a
//! silent drop), an idle upstream terminates after the configured
//! timeout, and dropping the receiver (client disconnect) tears down
//! the upstream connection.

use std::time::Duration;

use devmesh_error::{DevmeshError, Result};
use devmesh_graphql::request::{GraphQLRequest, WireError};
use devmesh_graphql::sse::StreamFrame;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long the pump waits for a slow client before giving up on
/// delivering the overflow error.
const OVERFLOW_DELIVERY_GRACE: Duration = Duration::from_secs(5);

/// Open the upstream SSE stream for a subscription.
///
/// # Errors
///
/// `SUBGRAPH_UNAVAILABLE` when the subgraph cannot be reached or
/// answers with a non-success status.
pub async fn open_upstream(
    subgraph: &str,
    base_url: &str,
    request: &GraphQLRequest,
    correlation_id: &str,
    authorization: Option<&str>,
) -> Result<BoxStream<'static, StreamFrame>> {
    let client = reqwest::Client::new();
    let mut builder = client
        .post(format!(
            "{}/graphql/stream",
            base_url.trim_end_matches('/')
        ))
        .header("x-correlation-id", correlation_id)
        .json(request);
    if let Some(authorization) = authorization {
        builder = builder.header("authorization", authorization);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| DevmeshError::subgraph_unavailable(subgraph, e.to_string()))?;
    if !response.status().is_success() {
        return Err(DevmeshError::subgraph_unavailable(
            subgraph,
            format!("HTTP {}", response.status()),
        ));
    }

    let bytes = response.bytes_stream();

    // Re-frame the byte stream into SSE event blocks and decode them.
    let frames = futures::stream::unfold(
        (bytes, String::new(), false),
        |(mut bytes, mut buffer, mut done)| async move {
            loop {
                if done {
                    return None;
                }
                if let Some(pos) = buffer.find("\n\n") {
                    let block = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);
                    if let Some(frame) = StreamFrame::decode(&block) {
                        return Some((frame, (bytes, buffer, done)));
                    }
                    continue;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            StreamFrame::Error {
                                errors: vec![WireError::with_code(
                                    format!("upstream stream failed: {e}"),
                                    "SUBGRAPH_UNAVAILABLE",
                                )],
                            },
                            (bytes, buffer, done),
                        ));
                    }
                    None => {
                        // Upstream closed without a terminal frame.
                        done = true;
                        return Some((StreamFrame::Complete, (bytes, buffer, done)));
                    }
                }
            }
        },
    );

    Ok(frames.boxed())
}

/// Pump an upstream frame stream into a bounded channel.
///
/// The receiver is the client-facing side. The returned task ends when
/// the upstream terminates, the buffer overflows, the idle timeout
/// fires, or the receiver is dropped.
pub fn pump(
    mut upstream: BoxStream<'static, StreamFrame>,
    buffer: usize,
    idle_timeout: Duration,
) -> (mpsc::Receiver<StreamFrame>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    let task = tokio::spawn(async move {
        let mut delivered = 0_usize;
        loop {
            let frame = match tokio::time::timeout(idle_timeout, upstream.next()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => StreamFrame::Complete,
                Err(_) => {
                    debug!("subscription idle timeout");
                    StreamFrame::Error {
                        errors: vec![WireError::with_code(
                            format!("subscription idle for {}s", idle_timeout.as_secs()),
                            "SUBGRAPH_TIMEOUT",
                        )],
                    }
                }
            };
            let terminal = frame.is_terminal();

            match tx.try_send(frame) {
                Ok(()) => {
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Client went away; upstream drops with the task.
                    debug!("subscription receiver dropped");
                    return;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(delivered, "subscription buffer overflow");
                    let overflow = StreamFrame::Error {
                        errors: vec![WireError::with_code(
                            format!("subscription buffer overflowed after {delivered} frames"),
                            "BUFFER_OVERFLOW",
                        )],
                    };
                    // Best-effort terminal delivery; a fully stalled
                    // client forfeits it.
                    let _ = tokio::time::timeout(OVERFLOW_DELIVERY_GRACE, tx.send(overflow)).await;
                    return;
                }
            }

            if terminal {
                return;
            }
        }
    });

    (rx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmesh_graphql::request::GraphQLResponse;
    use serde_json::json;

    fn next_frame(n: u64) -> StreamFrame {
        StreamFrame::Next {
            payload: GraphQLResponse::data(json!({"tick": n})),
        }
    }

    #[tokio::test]
    async fn test_pump_preserves_order_and_completes() {
        let upstream = futures::stream::iter(vec![
            next_frame(0),
            next_frame(1),
            StreamFrame::Complete,
        ])
        .boxed();
        let (mut rx, task) = pump(upstream, 16, Duration::from_secs(5));

        let mut ticks = Vec::new();
        while let Some(frame) = rx.recv().await {
            match frame {
                StreamFrame::Next { payload } => {
                    ticks.push(payload.data.unwrap()["tick"].as_u64().unwrap());
                }
                StreamFrame::Complete => break,
                StreamFrame::Error { errors } => panic!("unexpected error: {errors:?}"),
            }
        }
        assert_eq!(ticks, vec![0, 1]);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_overflow_terminates_with_error() {
        // A fast upstream against a tiny buffer and a slow reader: the
        // pump overflows, then delivers the terminal error as soon as
        // one slot frees up.
        let upstream = futures::stream::iter((0..1000).map(next_frame)).boxed();
        let (mut rx, task) = pump(upstream, 2, Duration::from_secs(5));

        // Let the pump hit the full buffer before draining.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        task.await.unwrap();

        // Far fewer than 1000 frames made it, and the stream ended
        // with the overflow error rather than a silent stop.
        assert!(frames.len() < 10);
        match frames.last() {
            Some(StreamFrame::Error { errors }) => {
                assert_eq!(errors[0].code(), Some("BUFFER_OVERFLOW"));
            }
            other => panic!("expected overflow error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pump_idle_timeout() {
        let upstream = futures::stream::pending().boxed();
        let (mut rx, _task) = pump(upstream, 4, Duration::from_millis(20));

        let frame = rx.recv().await.unwrap();
        match frame {
            StreamFrame::Error { errors } => {
                assert_eq!(errors[0].code(), Some("SUBGRAPH_TIMEOUT"));
            }
            other => panic!("expected idle error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pump_stops_when_receiver_dropped() {
        let upstream = futures::stream::iter((0..100_000).map(next_frame)).boxed();
        let (rx, task) = pump(upstream, 4, Duration::from_secs(5));
        drop(rx);
        // The pump notices the closed channel and exits.
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_eof_yields_complete() {
        let upstream = futures::stream::iter(vec![next_frame(1)]).boxed();
        let (mut rx, _task) = pump(upstream, 4, Duration::from_secs(5));

        assert!(matches!(
            rx.recv().await,
            Some(StreamFrame::Next { .. })
        ));
        assert!(matches!(rx.recv().await, Some(StreamFrame::Complete)));
        assert!(rx.recv().await.is_none());
    }
}
