//! SSE passthrough (spec §4.1.2): reads the upstream response line by
//! line, forwards each line to the client as soon as it arrives, and
//! simultaneously accumulates a bounded copy of the full body for the
//! trace record.
//!
//! The accumulation and the forwarding run in one background task so a
//! disconnected client never blocks draining the upstream body — the
//! governed request path only waits long enough to spawn the stream and
//! hand axum a `Body`; trace finalization happens once the task's
//! [`SseResult`] arrives on its oneshot.

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::models::trace::BODY_STORAGE_CAP;

pub struct SseResult {
    /// Bounded copy of the full response body, truncated past
    /// [`BODY_STORAGE_CAP`] — storage only, never what was forwarded.
    pub accumulated: Vec<u8>,
    pub truncated: bool,
    pub chunk_count: u32,
}

/// SSE response headers set before the first byte is written (spec
/// §4.1.2).
pub fn sse_headers() -> [(&'static str, &'static str); 4] {
    [
        ("content-type", "text/event-stream"),
        ("cache-control", "no-cache"),
        ("connection", "keep-alive"),
        ("x-accel-buffering", "no"),
    ]
}

/// Spawns the forwarding task and returns a client-facing byte stream plus
/// a receiver that resolves once the upstream body is exhausted (or the
/// client disconnected and the remainder was drained and discarded).
pub fn spawn(
    mut upstream: reqwest::Response,
) -> (ReceiverStream<Result<Bytes, std::io::Error>>, oneshot::Receiver<SseResult>) {
    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut carry: Vec<u8> = Vec::new();
        let mut accumulated: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut chunk_count: u32 = 0;
        let mut client_disconnected = false;

        loop {
            let next = upstream.chunk().await;
            let chunk = match next {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "upstream SSE stream read failed");
                    break;
                }
            };

            if !client_disconnected {
                if accumulated.len() < BODY_STORAGE_CAP {
                    let remaining = BODY_STORAGE_CAP - accumulated.len();
                    if chunk.len() <= remaining {
                        accumulated.extend_from_slice(&chunk);
                    } else {
                        accumulated.extend_from_slice(&chunk[..remaining]);
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }

            carry.extend_from_slice(&chunk);
            while let Some(pos) = carry.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = carry.drain(..=pos).collect();
                chunk_count += 1;
                if !client_disconnected {
                    if client_tx.send(Ok(Bytes::from(line))).await.is_err() {
                        client_disconnected = true;
                    }
                }
            }
        }

        if !carry.is_empty() && !client_disconnected {
            let _ = client_tx.send(Ok(Bytes::from(carry))).await;
        }

        let _ = done_tx.send(SseResult {
            accumulated,
            truncated,
            chunk_count,
        });
    });

    (ReceiverStream::new(client_rx), done_rx)
}

impl SseResult {
    pub fn body_string(&self) -> String {
        let mut s = String::from_utf8_lossy(&self.accumulated).into_owned();
        if self.truncated {
            s.push_str("...[truncated]");
        }
        s
    }
}
