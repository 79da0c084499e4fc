//! Request-serving loop.
//!
//! Each connection carries newline-delimited JSON `Request` frames and gets
//! one `Reply` frame per request, in order. Connections are served on their
//! own tasks, so requests on different connections dispatch concurrently.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::analytics::{DispatchContext, Instrumented};
use crate::app::{Dispatch, Request, Response};
use crate::config::BootstrapConfig;
use crate::error::DispatchError;

/// Header carrying the time a front-end first saw the request, as
/// microseconds since the Unix epoch (optionally prefixed with `t=`).
pub const REQUEST_START_HEADER: &str = "x-request-start";

/// One answer frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Error { error: DispatchError },
    Response(Response),
}

type App = Arc<Instrumented<Arc<dyn Dispatch>>>;

pub struct Server {
    listener: TcpListener,
    app: App,
    max_request_bytes: usize,
    drain_timeout: Duration,
}

impl Server {
    pub fn new(listener: TcpListener, app: App, config: &BootstrapConfig) -> Self {
        Self {
            listener,
            app,
            max_request_bytes: config.max_request_bytes,
            drain_timeout: config.drain_timeout(),
        }
    }

    /// Accept connections until `shutdown` resolves, then give open
    /// connections `drain_timeout` to finish their current request.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = String>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                reason = &mut shutdown => {
                    tracing::info!(reason = %reason, "Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "Connection accepted");
                        connections.spawn(serve_connection(
                            stream,
                            Arc::clone(&self.app),
                            self.max_request_bytes,
                            stop_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Connection task panicked in application code");
                        }
                    }
                }
            }
        }

        drop(self.listener);
        let _ = stop_tx.send(true);

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "Drain timeout elapsed, aborting connections"
            );
            connections.shutdown().await;
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    app: App,
    max_request_bytes: usize,
    mut stop: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut frame = Vec::new();
        let read = tokio::select! {
            read = read_request(&mut reader, &mut frame, max_request_bytes) => read,
            _ = stop.changed() => break,
        };
        match read {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping connection");
                let reply = Reply::Error {
                    error: DispatchError::new("bad_request", e.to_string()),
                };
                let _ = write_reply(&mut write_half, &reply).await;
                break;
            }
        }
        let received_at = Instant::now();

        let reply = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => {
                let ctx = DispatchContext::new(enqueued_at(&request, received_at))
                    .with_request_id(request.id)
                    .with_attempt(request.attempt.unwrap_or(1));
                match app.dispatch_with(request, ctx).await {
                    Ok(response) => Reply::Response(response),
                    Err(error) => Reply::Error { error },
                }
            }
            Err(e) => Reply::Error {
                error: DispatchError::new("bad_request", e.to_string()),
            },
        };

        if let Err(e) = write_reply(&mut write_half, &reply).await {
            tracing::debug!(error = %e, "Client went away before reply");
            break;
        }
    }
}

/// Read one frame into `frame`. `Ok(false)` on a clean end of stream.
async fn read_request<R>(
    reader: &mut BufReader<R>,
    frame: &mut Vec<u8>,
    max_bytes: usize,
) -> std::io::Result<bool>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        frame.clear();
        let n = (&mut *reader)
            .take(max_bytes as u64 + 1)
            .read_until(b'\n', frame)
            .await?;
        if n == 0 {
            return Ok(false);
        }
        if frame.last() != Some(&b'\n') {
            if frame.len() > max_bytes {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("request exceeds {max_bytes} bytes"),
                ));
            }
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if !frame.trim_ascii().is_empty() {
            return Ok(true);
        }
    }
}

async fn write_reply<W>(writer: &mut W, reply: &Reply) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(reply).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// The instant the request entered the queue: when it was read, moved back
/// by the age a front-end reported in `x-request-start`.
fn enqueued_at(request: &Request, received_at: Instant) -> Instant {
    let Some(started_micros) = request
        .header(REQUEST_START_HEADER)
        .and_then(parse_request_start)
    else {
        return received_at;
    };
    let now_micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let age = Duration::from_micros(now_micros.saturating_sub(started_micros));
    received_at.checked_sub(age).unwrap_or(received_at)
}

fn parse_request_start(value: &str) -> Option<u64> {
    value.trim().trim_start_matches("t=").parse().ok()
}
