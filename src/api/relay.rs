//! Response Relay
//!
//! Copies an upstream byte stream to the caller while a duplicate of every
//! forwarded chunk is fed to an accounting consumer running on its own task.
//!
//! The caller-facing copy runs under the caller's cancellation scope. The
//! accounting task runs under the upstream scope, so it can finish recording
//! after the caller has gone but never outlives the upstream call. When the
//! copy ends its error, if any, is pushed onto the duplicate stream and the
//! stream is closed, so the consumer always sees a terminal item.
//!
//! The duplicate stream is unbounded. A consumer that stops reading holds
//! every chunk delivered so far, at most the full response body, until it
//! resumes or the upstream scope is cancelled and the task is dropped.

use crate::client::ByteStream;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Duplicate of the bytes written to the caller, in order
#[derive(Debug)]
pub struct Tap {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl Stream for Tap {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Consumer of the duplicate stream
#[async_trait]
pub trait AccountingSink: Send + Sync {
    async fn consume(&self, tap: Tap) -> Result<()>;
}

/// Cancellation scopes of the two relay paths
#[derive(Debug, Clone, Default)]
pub struct RelayScopes {
    /// Cancelled when the caller goes away
    pub caller: CancellationToken,

    /// Cancelled when the upstream call is torn down
    pub upstream: CancellationToken,
}

impl RelayScopes {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of a relay
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes delivered to the caller, or why delivery stopped
    pub copied: Result<u64>,

    /// The accounting task
    pub accounting: JoinHandle<Result<()>>,
}

/// Relay `upstream` to `caller`, duplicating into `accounting`
pub async fn stream<W>(
    mut upstream: ByteStream,
    caller: &mut W,
    accounting: Arc<dyn AccountingSink>,
    scopes: RelayScopes,
) -> RelayOutcome
where
    W: AsyncWrite + Unpin,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let tap = Tap { rx };

    let upstream_scope = scopes.upstream.clone();
    let accounting = tokio::spawn(async move {
        tokio::select! {
            result = accounting.consume(tap) => result,
            _ = upstream_scope.cancelled() => Err(GatewayError::Stream(
                "upstream scope ended before accounting finished".to_string(),
            )),
        }
    });

    let copied = copy(&mut upstream, caller, &tx, &scopes.caller).await;
    match &copied {
        Ok(bytes) => debug!(bytes, "relay complete"),
        Err(e) => {
            debug!(error = %e, "relay stopped");
            let _ = tx.send(Err(e.clone()));
        }
    }
    drop(tx);

    RelayOutcome { copied, accounting }
}

async fn copy<W>(
    upstream: &mut ByteStream,
    caller: &mut W,
    tap: &mpsc::UnboundedSender<Result<Bytes>>,
    scope: &CancellationToken,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(GatewayError::CallerDisconnected),
            next = upstream.next() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(e),
            None => break,
        };

        tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(GatewayError::CallerDisconnected),
            result = caller.write_all(&chunk) => result.map_err(caller_error)?,
        }

        written += chunk.len() as u64;
        // A consumer that already finished is not an error for the caller
        let _ = tap.send(Ok(chunk));
    }

    caller.flush().await.map_err(caller_error)?;
    Ok(written)
}

fn caller_error(err: std::io::Error) -> GatewayError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            GatewayError::CallerDisconnected
        }
        _ => GatewayError::Stream(format!("Failed to write to caller: {}", err)),
    }
}
