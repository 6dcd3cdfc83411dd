//! RPC server: one listener, one registry, one serial accept/serve loop.
//!
//! The loop runs on a dedicated background task. It accepts one connection
//! at a time, authenticates it, then serves requests on it in order until
//! the peer goes away or the server is closed. Requests are executed
//! through the host's [`MainThreadDispatcher`]; anything a registered
//! function raises comes back to the caller as an error response, never as
//! a dead serving loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::dispatch::{HostFunction, MainThreadDispatcher};
use crate::error::{RemoteError, RpcError};
use crate::metrics::MetricsHandle;
use crate::protocol::{Frame, Request, Response};
use crate::transport::{AuthKey, IpcConnection, Listener};
use crate::value::Value;

/// Wire name of the built-in introspection function every server carries.
pub const LIST_FUNCTIONS: &str = "listFunctions";

/// Name -> callable map, mutated by registration and read once per request.
pub struct FunctionRegistry {
    functions: StdMutex<BTreeMap<String, HostFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: StdMutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, name: &str, function: HostFunction) {
        let mut functions = self.functions.lock().expect("registry lock poisoned");
        if functions.insert(name.to_string(), function).is_some() {
            warn!(event = "registry", status = "replaced", function = name);
        }
    }

    pub fn get(&self, name: &str) -> Option<HostFunction> {
        self.functions
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.functions
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Background listener plus dispatcher executing registered functions on
/// behalf of a remote proxy.
pub struct RpcServer {
    address: String,
    auth_key: AuthKey,
    registry: Arc<FunctionRegistry>,
    shutdown: CancellationToken,
    serve_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind an endpoint, mint the auth key, and start the serving loop.
    pub fn spawn(
        name: &str,
        dispatcher: Arc<dyn MainThreadDispatcher>,
    ) -> Result<Self, RpcError> {
        let listener = Listener::bind(name)?;
        let address = listener.address().to_string();
        let auth_key = listener.auth_key().clone();
        let registry = Arc::new(FunctionRegistry::new());

        let introspected = Arc::downgrade(&registry);
        registry.register(
            LIST_FUNCTIONS,
            Arc::new(move |_args, _kwargs| {
                let names = list_registered(&introspected);
                async move { Ok(Value::List(names.into_iter().map(Value::Str).collect())) }
                    .boxed()
            }),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            dispatcher,
            shutdown.clone(),
        ));
        debug!(event = "lifecycle", status = "listening", address = %address);

        Ok(Self {
            address,
            auth_key,
            registry,
            shutdown,
            serve_task: StdMutex::new(Some(handle)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    /// Expose a function to remote peers. Safe at any point in the server's
    /// lifetime; registration during traffic is serialized by the registry
    /// lock.
    pub fn register_function(&self, name: &str, function: HostFunction) {
        self.registry.register(name, function);
    }

    /// [`register_function`](Self::register_function) for async closures.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Vec<Value>, crate::Kwargs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        self.register_function(name, crate::dispatch::host_fn(f));
    }

    pub fn list_functions(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Idempotent: request close, unblock the loop wherever it is waiting,
    /// and return once it has exited.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self
            .serve_task
            .lock()
            .expect("serve task lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(event = "lifecycle", status = "join_failed", error = %err);
            }
        }
        debug!(event = "lifecycle", status = "closed", address = %self.address);
    }
}

fn list_registered(registry: &Weak<FunctionRegistry>) -> Vec<String> {
    registry.upgrade().map(|r| r.names()).unwrap_or_default()
}

#[instrument(skip_all, fields(address = %listener.address()))]
async fn accept_loop(
    mut listener: Listener,
    registry: Arc<FunctionRegistry>,
    dispatcher: Arc<dyn MainThreadDispatcher>,
    shutdown: CancellationToken,
) {
    let metrics = MetricsHandle::server();
    let address = listener.address().to_string();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept_authenticated() => accepted,
        };
        match accepted {
            Ok(Some(conn)) => {
                match serve_connection(conn, &registry, &dispatcher, &shutdown, metrics).await {
                    Ok(()) => debug!(event = "serving", status = "connection_done"),
                    Err(err) => {
                        // Per-connection failures never take the server down.
                        warn!(event = "serving", status = "connection_error", error = %err);
                    }
                }
            }
            Ok(None) => continue,
            Err(RpcError::ConnectionClosed) => break,
            Err(err) => {
                warn!(event = "serving", status = "accept_error", error = %err);
            }
        }
    }
    Listener::cleanup(&address);
    debug!(event = "lifecycle", status = "loop_exited");
}

async fn serve_connection(
    mut conn: IpcConnection,
    registry: &Arc<FunctionRegistry>,
    dispatcher: &Arc<dyn MainThreadDispatcher>,
    shutdown: &CancellationToken,
    metrics: MetricsHandle,
) -> Result<(), RpcError> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = conn.recv() => frame,
        };
        let request = match frame {
            Ok(Frame::Request(request)) => request,
            Ok(other) => {
                warn!(event = "serving", status = "unexpected_frame", frame = ?other);
                continue;
            }
            // One bad payload drops that message, not the connection.
            Err(RpcError::Decode(err)) => {
                warn!(event = "serving", status = "decode_error", error = %err);
                continue;
            }
            Err(RpcError::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err),
        };
        handle_request(&mut conn, request, registry, dispatcher, shutdown, metrics).await?;
    }
}

async fn handle_request(
    conn: &mut IpcConnection,
    request: Request,
    registry: &Arc<FunctionRegistry>,
    dispatcher: &Arc<dyn MainThreadDispatcher>,
    shutdown: &CancellationToken,
    metrics: MetricsHandle,
) -> Result<(), RpcError> {
    let started = metrics.start();
    let wants_response = request.wants_response;
    let outcome = match registry.get(&request.function) {
        Some(function) => {
            debug!(event = "serving", status = "dispatch", function = %request.function);
            dispatcher
                .execute(function, request.args, request.kwargs)
                .await
        }
        None => {
            warn!(event = "serving", status = "unknown_function", function = %request.function);
            Err(RemoteError::unknown_function(&request.function))
        }
    };
    metrics.finish(started, outcome.is_ok());

    // The close path is already tearing the connection down; a send now
    // would only race it.
    if shutdown.is_cancelled() {
        debug!(event = "serving", status = "response_suppressed", function_result_ok = outcome.is_ok());
        return Ok(());
    }
    if wants_response {
        conn.send(&Frame::Response(Response::from_result(outcome))).await?;
    }
    Ok(())
}
