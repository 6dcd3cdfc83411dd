//! Main-thread dispatch: the one cross-thread handoff in the design.
//!
//! Registered functions are expected to run on the hosting process's main
//! thread. The serving loop never assumes how that thread is reached; it
//! goes through an injected [`MainThreadDispatcher`] and waits for the
//! outcome. [`InlineDispatcher`] is the synchronous stand-in for tests and
//! hosts without thread affinity; [`main_thread_queue`] gives hosts with a
//! real main loop a queue to drain.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::RemoteError;
use crate::value::{Kwargs, Value};

/// A callable exposed to remote peers.
pub type HostFunction =
    Arc<dyn Fn(Vec<Value>, Kwargs) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

/// Wrap an async closure into a [`HostFunction`].
pub fn host_fn<F, Fut>(f: F) -> HostFunction
where
    F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    Arc::new(move |args, kwargs| f(args, kwargs).boxed())
}

/// Host-supplied guarantee that a function runs on the main thread and its
/// outcome comes back to the serving loop.
#[async_trait]
pub trait MainThreadDispatcher: Send + Sync + 'static {
    async fn execute(
        &self,
        function: HostFunction,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RemoteError>;
}

/// Runs the function right on the serving task.
pub struct InlineDispatcher;

#[async_trait]
impl MainThreadDispatcher for InlineDispatcher {
    async fn execute(
        &self,
        function: HostFunction,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RemoteError> {
        function(args, kwargs).await
    }
}

struct MainThreadJob {
    function: HostFunction,
    args: Vec<Value>,
    kwargs: Kwargs,
    reply: oneshot::Sender<Result<Value, RemoteError>>,
}

/// Dispatcher half of [`main_thread_queue`]: hands jobs to whichever task
/// drains the matching [`MainThreadQueue`] and blocks on the reply.
#[derive(Clone)]
pub struct QueuedDispatcher {
    tx: mpsc::UnboundedSender<MainThreadJob>,
}

/// Queue half: the host's main loop polls this.
pub struct MainThreadQueue {
    rx: mpsc::UnboundedReceiver<MainThreadJob>,
}

pub fn main_thread_queue() -> (QueuedDispatcher, MainThreadQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueuedDispatcher { tx }, MainThreadQueue { rx })
}

#[async_trait]
impl MainThreadDispatcher for QueuedDispatcher {
    async fn execute(
        &self,
        function: HostFunction,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RemoteError> {
        let (reply, outcome) = oneshot::channel();
        let job = MainThreadJob {
            function,
            args,
            kwargs,
            reply,
        };
        self.tx
            .send(job)
            .map_err(|_| RemoteError::new("Dispatch", "main thread queue is closed"))?;
        outcome
            .await
            .map_err(|_| RemoteError::new("Dispatch", "main thread dropped the job"))?
    }
}

impl MainThreadQueue {
    /// Execute the next queued job. Returns false once every dispatcher
    /// handle is gone.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                let outcome = (job.function)(job.args, job.kwargs).await;
                if job.reply.send(outcome).is_err() {
                    debug!(event = "dispatch", status = "reply_dropped");
                }
                true
            }
            None => false,
        }
    }

    /// Drain jobs until all dispatchers are dropped.
    pub async fn run_until_closed(&mut self) {
        while self.run_next().await {}
    }
}
