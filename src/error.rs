//! Error taxonomy.
//!
//! Two layers, mirroring what can and cannot cross the process boundary:
//! [`RpcError`] is the local taxonomy surfaced to callers, and
//! [`RemoteError`] is the serializable error value a registered function's
//! failure travels in. A `RemoteError` received in a response is re-raised
//! as [`RpcError::Remote`] so a remote failure stays distinguishable from a
//! transport failure.

use std::io;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by a remotely invoked function, carried as data on the wire.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize, Encode, Decode)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The response a server sends back when the requested name has no
    /// registry entry.
    pub fn unknown_function(name: &str) -> Self {
        Self::new("UnknownFunction", format!("unknown function call: {name}"))
    }

    pub fn is_unknown_function(&self) -> bool {
        self.kind == "UnknownFunction"
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("authentication rejected by peer")]
    AuthRejected,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("closed while waiting for a response")]
    ClosedWhileWaiting,
    #[error("proxy is closed")]
    ProxyClosed,
    #[error("channel is not connected")]
    NotConnected,
    #[error("bootstrap error: {0}")]
    Bootstrap(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl RpcError {
    /// True for the errors that mean "the other end is gone", as opposed to
    /// a failure reported by the remote function itself.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionClosed
                | RpcError::ClosedWhileWaiting
                | RpcError::ProxyClosed
                | RpcError::Io(_)
        )
    }
}
