//! The invocation loop.
//!
//! One iteration fetches an invocation, wires its completion context, fatal-condition binding and
//! idle fallback, then dispatches the handler and returns. The next iteration is scheduled only
//! from a completion path, so invocation N+1 is never fetched before N has been reported.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt as _;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::Instrument as _;

use crate::callback::{Callback, CompletionContext, Outcome};
use crate::config::FunctionMetadata;
use crate::context::{Context, InvocationContext};
use crate::error::{
    install_panic_hook, serialize_response, FunctionError, HandlerError,
    INVALID_PAYLOAD_ERROR_TYPE,
};
use crate::fatal::{FatalRouter, ProcessTerminator, Terminator, EXIT_UNCAUGHT_EXCEPTION};
use crate::idle::IdleMonitor;
use crate::runtime_api::{NextInvocation, RuntimeApi};

/// A handler's eventual result.
pub type Deferred = BoxFuture<'static, Result<Value, HandlerError>>;

/// What a handler's synchronous call returned.
pub enum Dispatch {
    /// Completion comes from the callback, the context, or the idle fallback.
    Returned,
    /// Completion comes from this future.
    Deferred(Deferred),
}

impl Dispatch {
    pub fn deferred<F, T, E>(fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize,
        E: Into<HandlerError>,
    {
        Self::Deferred(
            async move {
                match fut.await {
                    Ok(value) => serialize_response(&value).map_err(HandlerError::from),
                    Err(err) => Err(err.into()),
                }
            }
            .boxed(),
        )
    }
}

/// User code run once per invocation.
///
/// Returning `Err` (or panicking) is equivalent to failing through the callback. Background work
/// must go through [`Context::spawn`]: a bare `tokio::spawn` is neither waited for by the idle
/// fallback nor reported when it panics.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, event: Value, context: Context, callback: Callback) -> anyhow::Result<Dispatch>;
}

impl<F> Handler for F
where
    F: Fn(Value, Context, Callback) -> anyhow::Result<Dispatch> + Send + Sync + 'static,
{
    fn call(&self, event: Value, context: Context, callback: Callback) -> anyhow::Result<Dispatch> {
        self(event, context, callback)
    }
}

/// Adapts an async function into a [`Handler`] whose future is the completion.
pub fn async_handler<F, Fut, T, E>(f: F) -> impl Handler
where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize,
    E: Into<HandlerError>,
{
    move |event: Value, context: Context, _callback: Callback| {
        Ok::<_, anyhow::Error>(Dispatch::deferred(f(event, context)))
    }
}

/// Schedules the next loop iteration on a fresh turn of the loop.
#[derive(Clone)]
pub struct NextIteration(mpsc::UnboundedSender<()>);

impl NextIteration {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn schedule(&self) {
        // The receiver only goes away with the loop itself.
        let _ = self.0.send(());
    }
}

/// State shared by the loop and every invocation's completion paths.
pub(crate) struct Shared {
    pub(crate) api: Arc<dyn RuntimeApi>,
    pub(crate) idle: Arc<IdleMonitor>,
    pub(crate) fatal: Arc<FatalRouter>,
    pub(crate) next: NextIteration,
    pub(crate) handle: tokio::runtime::Handle,
}

impl Shared {
    pub(crate) fn new(
        api: Arc<dyn RuntimeApi>,
        terminator: Arc<dyn Terminator>,
        next: NextIteration,
    ) -> anyhow::Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|err| anyhow::anyhow!("runtime must be created inside tokio: {err}"))?;
        Ok(Self {
            fatal: Arc::new(FatalRouter::new(api.clone(), terminator)),
            api,
            idle: Arc::new(IdleMonitor::new()),
            next,
            handle,
        })
    }
}

pub struct Runtime {
    shared: Arc<Shared>,
    function: Arc<FunctionMetadata>,
    next_rx: mpsc::UnboundedReceiver<()>,
}

impl Runtime {
    pub fn new(api: Arc<dyn RuntimeApi>, function: FunctionMetadata) -> anyhow::Result<Self> {
        Self::with_terminator(api, function, Arc::new(ProcessTerminator))
    }

    pub fn with_terminator(
        api: Arc<dyn RuntimeApi>,
        function: FunctionMetadata,
        terminator: Arc<dyn Terminator>,
    ) -> anyhow::Result<Self> {
        let (next, next_rx) = NextIteration::channel();
        Ok(Self {
            shared: Arc::new(Shared::new(api, terminator, next)?),
            function: Arc::new(function),
            next_rx,
        })
    }

    /// Builds the handler, then serves invocations until a fatal condition.
    ///
    /// An init failure (error or panic) is reported as an init error and ends with exit 129.
    pub async fn init_and_run<F, H>(self, init: F) -> i32
    where
        F: FnOnce() -> anyhow::Result<H>,
        H: Handler,
    {
        install_panic_hook();
        let error = match catch_unwind(AssertUnwindSafe(init)) {
            Ok(Ok(handler)) => return self.run(handler).await,
            Ok(Err(err)) => HandlerError::from(err),
            Err(panic) => FunctionError::from_panic(panic).into(),
        };

        self.shared.fatal.uncaught_exception(error).await;
        EXIT_UNCAUGHT_EXCEPTION
    }

    /// Serves invocations until a fatal condition terminates the process.
    ///
    /// Returns the exit code only when the terminator does not end the process itself.
    pub async fn run<H: Handler>(mut self, handler: H) -> i32 {
        install_panic_hook();
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let mut halted = self.shared.fatal.halted();
        self.shared.next.schedule();

        loop {
            tokio::select! {
                biased;

                code = halted_code(&mut halted) => return code,
                Some(()) = self.next_rx.recv() => {
                    let fetched = tokio::select! {
                        biased;

                        code = halted_code(&mut halted) => return code,
                        fetched = self.shared.api.next_invocation() => fetched,
                    };
                    match fetched {
                        Ok(next) => self.handle_once(next, &handler),
                        Err(err) => {
                            tracing::error!(error = %err, "Unexpected Top Level Error");
                            self.shared.fatal.uncaught_exception(err.into()).await;
                        }
                    }
                }
                action = self.shared.idle.idle() => action.await,
            }
        }
    }

    /// Wires up and dispatches one fetched invocation. Never blocks on its completion.
    fn handle_once(&self, next: NextInvocation, handler: &Arc<dyn Handler>) {
        let invocation = Arc::new(InvocationContext::from_next(&next));
        let span = invocation.span();
        let request_id = invocation.request_id.clone();
        span.in_scope(|| {
            tracing::debug!(body_len = next.body.len(), "fetched invocation");
        });

        // Dispatch itself is pending work, so the idle fallback cannot fire mid-dispatch.
        let _dispatching = self.shared.idle.begin_work();

        let completion =
            CompletionContext::new(request_id.clone(), self.shared.clone(), span.clone());
        let callback = Callback::new(completion.clone());
        let context = Context::new(
            invocation,
            self.function.clone(),
            completion.clone(),
            self.shared.clone(),
            span.clone(),
        );

        self.shared.fatal.bind_invocation(&request_id);
        self.shared.idle.set(completion.idle_fallback());

        span.in_scope(|| {
            let event = match serde_json::from_slice::<Value>(&next.body) {
                Ok(event) => event,
                Err(err) => {
                    let error = FunctionError::new(
                        INVALID_PAYLOAD_ERROR_TYPE,
                        format!("invalid event payload: {err}"),
                    );
                    callback.err(error);
                    return;
                }
            };

            let dispatched = catch_unwind(AssertUnwindSafe(|| {
                handler.call(event, context, callback.clone())
            }));
            match dispatched {
                Ok(Ok(Dispatch::Returned)) => {}
                Ok(Ok(Dispatch::Deferred(deferred))) => {
                    self.attach_deferred(deferred, completion, span.clone())
                }
                Ok(Err(err)) => callback.err(err),
                Err(panic) => callback.err(FunctionError::from_panic(panic)),
            }
        });
    }

    fn attach_deferred(
        &self,
        deferred: Deferred,
        completion: CompletionContext,
        span: tracing::Span,
    ) {
        let guard = self.shared.idle.begin_work();
        let task = async move {
            let _guard = guard;
            let outcome = match AssertUnwindSafe(deferred).catch_unwind().await {
                Ok(Ok(value)) => Outcome::Success(value),
                Ok(Err(err)) => Outcome::Failure(err),
                Err(panic) => Outcome::Failure(FunctionError::from_panic(panic).into()),
            };
            completion.complete(outcome);
        };
        self.shared.handle.spawn(task.instrument(span));
    }
}

/// Resolves with the exit code once the fatal router has terminated the process.
async fn halted_code(halted: &mut watch::Receiver<Option<i32>>) -> i32 {
    loop {
        let current = *halted.borrow_and_update();
        if let Some(code) = current {
            return code;
        }
        if halted.changed().await.is_err() {
            return EXIT_UNCAUGHT_EXCEPTION;
        }
    }
}
