#![forbid(unsafe_code)]

//! Minimal RPC between two cooperating local processes.
//!
//! A long-lived "site" process and short-lived per-project processes call
//! functions on each other over a local transport (named pipe on Windows,
//! Unix domain socket elsewhere). Each side runs an [`RpcServer`] with a
//! name -> function registry and reaches the other through an [`RpcProxy`];
//! a [`PeerChannel`] ties one server and one proxy together and manages the
//! connect/disconnect protocol between them.
//!
//! The protocol is deliberately small: one connection served at a time, one
//! call in flight per proxy, a shared-secret handshake at connect, and
//! errors as values on the wire.

pub mod bootstrap;
pub mod channel;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod telemetry;
pub mod transport;
pub mod value;

use tokio::io::{AsyncRead, AsyncWrite};

/// Trait object for the raw byte streams the transport hands out.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

impl std::fmt::Debug for dyn AsyncReadWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AsyncReadWrite")
    }
}

pub use bootstrap::{BootstrapInfo, PeerProcessBuilder};
pub use channel::PeerChannel;
pub use dispatch::{
    host_fn, main_thread_queue, HostFunction, InlineDispatcher, MainThreadDispatcher,
    QueuedDispatcher,
};
pub use error::{RemoteError, RpcError};
pub use proxy::RpcProxy;
pub use server::RpcServer;
pub use transport::AuthKey;
pub use value::{Kwargs, Value};

/// Commonly used items.
pub mod prelude {
    pub use crate::bootstrap::BootstrapInfo;
    pub use crate::channel::PeerChannel;
    pub use crate::dispatch::{host_fn, InlineDispatcher, MainThreadDispatcher};
    pub use crate::error::{RemoteError, RpcError};
    pub use crate::proxy::RpcProxy;
    pub use crate::server::RpcServer;
    pub use crate::value::{Kwargs, Value};
    pub use crate::{args, kwargs};
}
