//! Client-side handle used to invoke functions on a peer's server.
//!
//! One proxy owns one connection and supports one call in flight: callers
//! racing on the same proxy are serialized by an internal lock rather than
//! corrupting the request/response pairing (there are no correlation IDs
//! on this wire). Closing the proxy from any task unblocks a waiting call
//! with a distinct error.

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::metrics::MetricsHandle;
use crate::protocol::{Frame, Request};
use crate::transport::{self, AuthKey, IpcConnection};
use crate::value::{Kwargs, Value};

#[derive(Debug)]
pub struct RpcProxy {
    io: Mutex<Option<IpcConnection>>,
    closed: CancellationToken,
    metrics: MetricsHandle,
}

impl RpcProxy {
    /// Connect and authenticate. A bad key or a missing listener fails
    /// here, never later.
    pub async fn connect(address: &str, auth_key: &AuthKey) -> Result<Self, RpcError> {
        let conn = transport::connect(address, auth_key).await?;
        debug!(event = "proxy", status = "connected", address = %address);
        Ok(Self {
            io: Mutex::new(Some(conn)),
            closed: CancellationToken::new(),
            metrics: MetricsHandle::proxy(),
        })
    }

    /// Invoke `function` on the peer and wait for its single response.
    ///
    /// A remote failure is re-raised as [`RpcError::Remote`]; the peer
    /// vanishing mid-wait is [`RpcError::ConnectionClosed`]; a concurrent
    /// [`close`](Self::close) is [`RpcError::ClosedWhileWaiting`].
    pub async fn call(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ProxyClosed);
        }
        let started = self.metrics.start();
        let outcome = self.call_inner(function, args, kwargs).await;
        self.metrics.finish(started, outcome.is_ok());
        outcome
    }

    async fn call_inner(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RpcError> {
        // Serializes concurrent callers: exactly one request/response pair
        // is in flight on the connection at a time.
        let mut guard = self.io.lock().await;
        let conn = guard.as_mut().ok_or(RpcError::ProxyClosed)?;
        conn.send(&Frame::Request(Request::new(function, args, kwargs)))
            .await?;
        let frame = tokio::select! {
            _ = self.closed.cancelled() => return Err(RpcError::ClosedWhileWaiting),
            frame = conn.recv() => frame?,
        };
        match frame {
            Frame::Response(response) => response.into_result().map_err(RpcError::Remote),
            other => Err(RpcError::Protocol(format!(
                "expected a response frame, got {other:?}"
            ))),
        }
    }

    /// Fire-and-forget: returns once the request is written. Whatever
    /// happens on the peer side is not observable here.
    pub async fn call_no_response(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<(), RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ProxyClosed);
        }
        let mut guard = self.io.lock().await;
        let conn = guard.as_mut().ok_or(RpcError::ProxyClosed)?;
        conn.send(&Frame::Request(Request::fire_and_forget(
            function, args, kwargs,
        )))
        .await
    }

    /// Idempotent. Unblocks a call waiting for a response, then closes the
    /// underlying connection.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut guard = self.io.lock().await;
        if let Some(mut conn) = guard.take() {
            if let Err(err) = conn.shutdown().await {
                warn!(event = "proxy", status = "shutdown_error", error = %err);
            }
        }
        debug!(event = "proxy", status = "closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
