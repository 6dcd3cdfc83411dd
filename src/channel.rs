//! Channel lifecycle: bring one server/proxy pair up on both sides, keep a
//! `connected` flag honest, and tear both down together.
//!
//! Each side owns an [`RpcServer`] and, once the handshake completes, one
//! [`RpcProxy`] to the peer. The initiator already knows the peer's
//! bootstrap `(address, auth key)` from the spawn boundary; it connects,
//! hands over its own pair through `createPeerProxy`, and the peer builds
//! the reverse proxy inside that call. Teardown is best-effort towards the
//! peer and unconditional locally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tracing::{debug, warn};

use crate::bootstrap::BootstrapInfo;
use crate::dispatch::MainThreadDispatcher;
use crate::error::{RemoteError, RpcError};
use crate::proxy::RpcProxy;
use crate::server::RpcServer;
use crate::value::{Kwargs, Value};

/// Control functions every channel registers; external code may rely on
/// these names existing on any peer.
pub const CREATE_PEER_PROXY: &str = "createPeerProxy";
pub const DESTROY_PEER_PROXY: &str = "destroyPeerProxy";
pub const SIGNAL_DISCONNECT: &str = "signalDisconnect";
pub const PROXY_LOG: &str = "proxyLog";

struct ChannelInner {
    server: RpcServer,
    proxy: tokio::sync::Mutex<Option<Arc<RpcProxy>>>,
    connected: AtomicBool,
}

impl ChannelInner {
    async fn adopt_proxy(&self, proxy: RpcProxy) {
        let old = self.proxy.lock().await.replace(Arc::new(proxy));
        self.connected.store(true, Ordering::SeqCst);
        if let Some(old) = old {
            old.close().await;
        }
    }

    async fn drop_proxy(&self) -> Option<Arc<RpcProxy>> {
        self.connected.store(false, Ordering::SeqCst);
        self.proxy.lock().await.take()
    }
}

/// One side of the logical bidirectional link between two processes.
pub struct PeerChannel {
    inner: Arc<ChannelInner>,
}

impl PeerChannel {
    /// Start the local server and register the control functions.
    pub fn start(
        name: &str,
        dispatcher: Arc<dyn MainThreadDispatcher>,
    ) -> Result<Self, RpcError> {
        let server = RpcServer::spawn(name, dispatcher)?;
        let inner = Arc::new(ChannelInner {
            server,
            proxy: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
        });
        register_control_functions(&inner);
        Ok(Self { inner })
    }

    /// The pair a spawned peer needs to reach this side.
    pub fn bootstrap_info(&self) -> BootstrapInfo {
        BootstrapInfo {
            address: self.inner.server.address().to_string(),
            auth_key: self.inner.server.auth_key().clone(),
        }
    }

    /// Initiator side: connect to the peer's known server and hand it our
    /// own `(address, auth key)` so it can call back.
    pub async fn connect_to_peer(&self, peer: &BootstrapInfo) -> Result<(), RpcError> {
        let proxy = RpcProxy::connect(&peer.address, &peer.auth_key).await?;
        proxy
            .call(
                CREATE_PEER_PROXY,
                vec![
                    Value::from(self.inner.server.address()),
                    Value::from(self.inner.server.auth_key().as_str()),
                ],
                Kwargs::new(),
            )
            .await?;
        self.inner.adopt_proxy(proxy).await;
        debug!(event = "channel", status = "connected", peer = %peer.address);
        Ok(())
    }

    /// Whether a usable proxy to the peer currently exists. Flips to false
    /// as soon as either side requests disconnect.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Expose a function to the peer.
    pub fn register_function(&self, name: &str, function: crate::dispatch::HostFunction) {
        self.inner.server.register_function(name, function);
    }

    /// [`register_function`](Self::register_function) for async closures.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        self.inner.server.register_fn(name, f);
    }

    /// Invoke a function on the peer and wait for the result.
    pub async fn call(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RpcError> {
        let proxy = self.current_proxy().await?;
        proxy.call(function, args, kwargs).await
    }

    /// Invoke a function on the peer without waiting.
    pub async fn call_no_response(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<(), RpcError> {
        let proxy = self.current_proxy().await?;
        proxy.call_no_response(function, args, kwargs).await
    }

    /// Forward a log record to the peer instead of writing it locally.
    pub async fn log_to_peer(
        &self,
        level: &str,
        message: &str,
        args: Vec<Value>,
    ) -> Result<(), RpcError> {
        self.call_no_response(
            PROXY_LOG,
            vec![
                Value::from(level),
                Value::from(message),
                Value::List(args),
            ],
            Kwargs::new(),
        )
        .await
    }

    async fn current_proxy(&self) -> Result<Arc<RpcProxy>, RpcError> {
        self.inner
            .proxy
            .lock()
            .await
            .clone()
            .ok_or(RpcError::NotConnected)
    }

    /// Graceful disconnect: tell the peer (best-effort), then close the
    /// local proxy. The server stays up for a later reconnect.
    pub async fn disconnect(&self) {
        let proxy = self.inner.drop_proxy().await;
        if let Some(proxy) = proxy {
            // The peer may already be gone; local teardown proceeds anyway.
            if let Err(err) = proxy
                .call_no_response(SIGNAL_DISCONNECT, Vec::new(), Kwargs::new())
                .await
            {
                warn!(event = "channel", status = "disconnect_notify_failed", error = %err);
            }
            proxy.close().await;
        }
        debug!(event = "channel", status = "disconnected");
    }

    /// Full local teardown: disconnect, then stop the server.
    pub async fn close(&self) {
        self.disconnect().await;
        self.inner.server.close().await;
    }
}

fn register_control_functions(inner: &Arc<ChannelInner>) {
    let server = &inner.server;

    let create = Arc::downgrade(inner);
    server.register_function(
        CREATE_PEER_PROXY,
        Arc::new(move |args, _kwargs| {
            let inner = Weak::clone(&create);
            async move { handle_create_peer_proxy(inner, args).await }.boxed()
        }),
    );

    let destroy = Arc::downgrade(inner);
    server.register_function(
        DESTROY_PEER_PROXY,
        Arc::new(move |_args, _kwargs| {
            let inner = Weak::clone(&destroy);
            async move {
                if let Some(inner) = inner.upgrade() {
                    if let Some(proxy) = inner.drop_proxy().await {
                        proxy.close().await;
                    }
                }
                Ok(Value::Null)
            }
            .boxed()
        }),
    );

    let signal = Arc::downgrade(inner);
    server.register_function(
        SIGNAL_DISCONNECT,
        Arc::new(move |_args, _kwargs| {
            let inner = Weak::clone(&signal);
            async move {
                if let Some(inner) = inner.upgrade() {
                    // Flag flips immediately; the socket teardown happens
                    // off the serving loop.
                    inner.connected.store(false, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Some(proxy) = inner.drop_proxy().await {
                            proxy.close().await;
                        }
                    });
                }
                debug!(event = "channel", status = "peer_requested_disconnect");
                Ok(Value::Null)
            }
            .boxed()
        }),
    );

    server.register_function(
        PROXY_LOG,
        Arc::new(move |args, _kwargs| {
            async move {
                let level = args.first().and_then(Value::as_str).unwrap_or("info");
                let message = args.get(1).and_then(Value::as_str).unwrap_or("");
                let extra = args.get(2).and_then(Value::as_list).unwrap_or(&[]);
                emit_peer_log(level, message, extra);
                Ok(Value::Null)
            }
            .boxed()
        }),
    );
}

async fn handle_create_peer_proxy(
    inner: Weak<ChannelInner>,
    args: Vec<Value>,
) -> Result<Value, RemoteError> {
    let address = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::new("BadArgument", "createPeerProxy: missing address"))?;
    let auth_key = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::new("BadArgument", "createPeerProxy: missing auth key"))?;
    let inner = inner
        .upgrade()
        .ok_or_else(|| RemoteError::new("ChannelGone", "channel already dropped"))?;
    let proxy = RpcProxy::connect(address, &auth_key.into())
        .await
        .map_err(|err| RemoteError::new("CreatePeerProxy", err.to_string()))?;
    inner.adopt_proxy(proxy).await;
    debug!(event = "channel", status = "reverse_proxy_created", peer = %address);
    Ok(Value::Null)
}

fn emit_peer_log(level: &str, message: &str, args: &[Value]) {
    match level.to_ascii_lowercase().as_str() {
        "error" => tracing::error!(target: "peer", ?args, "{message}"),
        "warn" | "warning" => tracing::warn!(target: "peer", ?args, "{message}"),
        "debug" => tracing::debug!(target: "peer", ?args, "{message}"),
        "trace" => tracing::trace!(target: "peer", ?args, "{message}"),
        _ => tracing::info!(target: "peer", ?args, "{message}"),
    }
}
