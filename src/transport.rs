//! Local transport: listen/accept/connect plus the shared-secret handshake.
//!
//! Endpoints are named pipes on Windows and Unix domain sockets elsewhere,
//! both via `parity-tokio-ipc`. A listener mints a fresh [`AuthKey`] at bind
//! time; the first frame on every inbound connection must present it, and a
//! mismatch is answered with `HelloDenied` before anything else happens.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use parity_tokio_ipc::Endpoint;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RpcError;
use crate::framing::{LengthPrefixedRead, LengthPrefixedWrite};
use crate::protocol::Frame;
use crate::AsyncReadWrite;

/// Shared secret required to open a connection to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKey(String);

impl AuthKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AuthKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AuthKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A fresh endpoint path for a listener owned by this process.
pub fn unique_endpoint_path(name: &str) -> String {
    // Truncate by characters, not bytes: names are host-chosen and may be
    // multi-byte anywhere.
    let short: String = name.chars().take(12).collect();
    let id = Uuid::new_v4().simple();
    if cfg!(windows) {
        format!(r"\\.\pipe\peerlink-{short}-{id}")
    } else {
        format!("/tmp/peerlink-{short}-{id}.sock")
    }
}

type IncomingConnections =
    Pin<Box<dyn Stream<Item = std::io::Result<Box<dyn AsyncReadWrite>>> + Send>>;

/// Bound endpoint waiting for peer connections.
pub struct Listener {
    address: String,
    auth_key: AuthKey,
    incoming: IncomingConnections,
}

impl Listener {
    /// Bind a new endpoint and mint its shared secret.
    pub fn bind(name: &str) -> Result<Self, RpcError> {
        let address = unique_endpoint_path(name);
        #[cfg(unix)]
        let _ = std::fs::remove_file(&address);
        let endpoint = Endpoint::new(address.clone());
        let incoming = endpoint
            .incoming()?
            .map(|conn| conn.map(|c| Box::new(c) as Box<dyn AsyncReadWrite>));
        debug!(event = "transport", status = "bound", address = %address);
        Ok(Self {
            address,
            auth_key: AuthKey::generate(),
            incoming: Box::pin(incoming),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    /// Wait for the next raw connection. Resolves with `ConnectionClosed`
    /// if the endpoint is gone. Callers needing interruption race this
    /// against a cancellation token.
    pub async fn accept(&mut self) -> Result<Box<dyn AsyncReadWrite>, RpcError> {
        match self.incoming.next().await {
            Some(Ok(stream)) => Ok(stream),
            Some(Err(err)) => Err(RpcError::Io(err)),
            None => Err(RpcError::ConnectionClosed),
        }
    }

    /// Bounded accept: `Ok(None)` when no peer showed up within `timeout`.
    pub async fn accept_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn AsyncReadWrite>>, RpcError> {
        match tokio::time::timeout(timeout, self.accept()).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Accept and authenticate one connection: read the `Hello`, verify the
    /// key, answer with the verdict. Returns `None` when the peer presented
    /// a wrong key or no well-formed `Hello` at all; the connection is
    /// dropped without ever reaching the function registry.
    pub async fn accept_authenticated(&mut self) -> Result<Option<IpcConnection>, RpcError> {
        let stream = self.accept().await?;
        let mut conn = IpcConnection::new(stream);
        match conn.recv().await {
            Ok(Frame::Hello { auth_key }) if auth_key == self.auth_key.0 => {
                conn.send(&Frame::HelloOk).await?;
                debug!(event = "transport", status = "authenticated", address = %self.address);
                Ok(Some(conn))
            }
            Ok(Frame::Hello { .. }) => {
                warn!(event = "transport", status = "auth_rejected", address = %self.address);
                let _ = conn.send(&Frame::HelloDenied).await;
                let _ = conn.shutdown().await;
                Ok(None)
            }
            Ok(other) => {
                warn!(event = "transport", status = "bad_hello", frame = ?other);
                let _ = conn.shutdown().await;
                Ok(None)
            }
            Err(err) => {
                warn!(event = "transport", status = "hello_failed", error = %err);
                Ok(None)
            }
        }
    }

    /// Remove the socket file a closed Unix listener leaves behind.
    pub fn cleanup(address: &str) {
        #[cfg(unix)]
        if let Err(err) = std::fs::remove_file(address) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(event = "transport", status = "cleanup_failed", address = %address, error = %err);
            }
        }
        #[cfg(not(unix))]
        let _ = address;
    }
}

/// One authenticated, framed, bidirectional connection.
pub struct IpcConnection {
    reader: LengthPrefixedRead<ReadHalf<Box<dyn AsyncReadWrite>>>,
    writer: LengthPrefixedWrite<WriteHalf<Box<dyn AsyncReadWrite>>>,
}

impl std::fmt::Debug for IpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcConnection").finish_non_exhaustive()
    }
}

impl IpcConnection {
    pub fn new(stream: Box<dyn AsyncReadWrite>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: LengthPrefixedRead::new(read_half),
            writer: LengthPrefixedWrite::new(write_half),
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), RpcError> {
        self.writer.write_msg(frame).await
    }

    pub async fn recv(&mut self) -> Result<Frame, RpcError> {
        self.reader.read_msg::<Frame>().await
    }

    pub async fn shutdown(&mut self) -> Result<(), RpcError> {
        self.writer.inner_mut().shutdown().await?;
        Ok(())
    }
}

/// Connect to a listener and run the client side of the handshake.
///
/// A wrong key fails fast with [`RpcError::AuthRejected`]; a missing
/// listener fails with the underlying i/o error.
pub async fn connect(address: &str, auth_key: &AuthKey) -> Result<IpcConnection, RpcError> {
    let stream = Endpoint::connect(address).await?;
    let mut conn = IpcConnection::new(Box::new(stream) as Box<dyn AsyncReadWrite>);
    conn.send(&Frame::Hello {
        auth_key: auth_key.0.clone(),
    })
    .await?;
    match conn.recv().await {
        Ok(Frame::HelloOk) => {
            debug!(event = "transport", status = "connected", address = %address);
            Ok(conn)
        }
        Ok(Frame::HelloDenied) => Err(RpcError::AuthRejected),
        Ok(other) => Err(RpcError::HandshakeFailed(format!(
            "unexpected handshake frame: {other:?}"
        ))),
        Err(RpcError::ConnectionClosed) => Err(RpcError::HandshakeFailed(
            "connection closed during handshake".into(),
        )),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_paths_are_unique() {
        let a = unique_endpoint_path("site");
        let b = unique_endpoint_path("site");
        assert_ne!(a, b);
        assert!(a.contains("peerlink-site-"));
    }

    #[test]
    fn endpoint_paths_truncate_multibyte_names_on_char_boundaries() {
        // 11 ASCII bytes followed by a two-byte char straddling byte 12.
        let path = unique_endpoint_path("aaaaaaaaaaa\u{e9}xyz");
        assert!(path.contains("peerlink-aaaaaaaaaaa\u{e9}-"));
        let short = unique_endpoint_path("ab");
        assert!(short.contains("peerlink-ab-"));
    }

    #[tokio::test]
    async fn accept_timeout_returns_none_without_peer() {
        let mut listener = Listener::bind("idle").unwrap();
        let got = listener
            .accept_timeout(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());
        Listener::cleanup(&listener.address().to_string());
    }

    #[tokio::test]
    async fn handshake_accepts_matching_key() {
        let mut listener = Listener::bind("hs").unwrap();
        let address = listener.address().to_string();
        let key = listener.auth_key().clone();

        let client = tokio::spawn(async move { connect(&address, &key).await });
        let accepted = listener.accept_authenticated().await.unwrap();
        assert!(accepted.is_some());
        client.await.unwrap().unwrap();
        Listener::cleanup(listener.address());
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_key() {
        let mut listener = Listener::bind("hs-bad").unwrap();
        let address = listener.address().to_string();

        let client =
            tokio::spawn(async move { connect(&address, &AuthKey::from("wrong")).await });
        let accepted = listener.accept_authenticated().await.unwrap();
        assert!(accepted.is_none());
        match client.await.unwrap() {
            Err(RpcError::AuthRejected) => {}
            other => panic!("expected AuthRejected, got {other:?}"),
        }
        Listener::cleanup(listener.address());
    }
}
