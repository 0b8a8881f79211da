//! Once-only completion of an invocation.
//!
//! Every way a handler can finish (`succeed`, `fail`, `done`, the node-style [`Callback`], its
//! deferred value, or the idle fallback) goes through one latch. The first claim reports and
//! re-arms the loop; every later claim is ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt as _;
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument as _;

use crate::error::{serialize_response, to_formatted, HandlerError};
use crate::idle::WorkGuard;
use crate::runtime::Shared;

/// What a completion entry point resolved to.
#[derive(Debug)]
pub enum Outcome {
    Success(Value),
    Failure(HandlerError),
}

#[derive(Clone)]
pub struct CompletionContext {
    inner: Arc<Inner>,
}

struct Inner {
    request_id: String,
    fired: AtomicBool,
    wait_for_idle: AtomicBool,
    shared: Arc<Shared>,
    span: tracing::Span,
}

impl CompletionContext {
    pub(crate) fn new(request_id: String, shared: Arc<Shared>, span: tracing::Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_id,
                fired: AtomicBool::new(false),
                wait_for_idle: AtomicBool::new(true),
                shared,
                span,
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// Whether a successful completion waits for pending work before the next fetch.
    pub fn wait_for_idle(&self) -> bool {
        self.inner.wait_for_idle.load(Ordering::Acquire)
    }

    pub fn set_wait_for_idle(&self, value: bool) {
        self.inner.wait_for_idle.store(value, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    pub fn succeed<T: Serialize>(&self, result: T) {
        self.done(None, result);
    }

    /// Fails the invocation. Without an error, reports the `"handled"` sentinel.
    pub fn fail(&self, error: Option<HandlerError>) {
        let error = present(error).unwrap_or_else(HandlerError::handled);
        self.done(Some(error), Value::Null);
    }

    /// Node-style completion: a present `error` wins over `result`. A `null` error is absent.
    pub fn done<T: Serialize>(&self, error: Option<HandlerError>, result: T) {
        let outcome = match present(error) {
            Some(error) => Outcome::Failure(error),
            None => match serialize_response(&result) {
                Ok(value) => Outcome::Success(value),
                Err(err) => Outcome::Failure(err.into()),
            },
        };
        self.complete(outcome);
    }

    /// Claims the latch and reports `outcome`. Returns `false` if already completed.
    pub fn complete(&self, outcome: Outcome) -> bool {
        if !self.claim() {
            tracing::debug!(
                request_id = %self.inner.request_id,
                "ignoring completion after the first"
            );
            return false;
        }

        let shared = &self.inner.shared;
        shared.idle.reset();
        let wait_for_idle = self.wait_for_idle();
        let guard = shared.idle.begin_work();

        let report = report(
            shared.clone(),
            self.inner.request_id.clone(),
            outcome,
            wait_for_idle,
            guard,
        );
        shared
            .handle
            .spawn(report.instrument(self.inner.span.clone()));
        true
    }

    /// Fallback used when the process goes idle before any explicit completion.
    pub(crate) async fn complete_on_idle(self) {
        if !self.claim() {
            return;
        }

        let shared = &self.inner.shared;
        let reported = shared
            .api
            .post_invocation_response(&self.inner.request_id, &Value::Null)
            .instrument(self.inner.span.clone())
            .await;
        match reported {
            Ok(()) => shared.next.schedule(),
            Err(err) => shared.fatal.uncaught_exception(err.into()).await,
        }
    }

    /// An idle action that completes this invocation with a null result.
    pub(crate) fn idle_fallback(&self) -> crate::idle::IdleAction {
        self.clone().complete_on_idle().boxed()
    }

    fn claim(&self) -> bool {
        self.inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn present(error: Option<HandlerError>) -> Option<HandlerError> {
    error.filter(|err| !matches!(err, HandlerError::Value(Value::Null)))
}

async fn report(
    shared: Arc<Shared>,
    request_id: String,
    outcome: Outcome,
    wait_for_idle: bool,
    _guard: WorkGuard,
) {
    match outcome {
        Outcome::Failure(error) => {
            tracing::error!(error = %to_formatted(&error.homogenize()), "Invoke Error");
            if let Err(err) = shared.api.post_invocation_error(&request_id, &error).await {
                shared.fatal.uncaught_exception(err.into()).await;
                return;
            }
            shared.next.schedule();
        }
        Outcome::Success(result) => {
            if let Err(err) = shared
                .api
                .post_invocation_response(&request_id, &result)
                .await
            {
                shared.fatal.uncaught_exception(err.into()).await;
                return;
            }
            if wait_for_idle {
                let next = shared.next.clone();
                shared.idle.set(async move { next.schedule() }.boxed());
            } else {
                shared.next.schedule();
            }
        }
    }
}

/// The node-style `(error, result)` entry point handed to the handler.
#[derive(Clone)]
pub struct Callback {
    completion: CompletionContext,
}

impl Callback {
    pub(crate) fn new(completion: CompletionContext) -> Self {
        Self { completion }
    }

    pub fn call<T: Serialize>(&self, error: Option<HandlerError>, result: T) {
        self.completion.done(error, result);
    }

    pub fn ok<T: Serialize>(&self, result: T) {
        self.call(None, result);
    }

    pub fn err(&self, error: impl Into<HandlerError>) {
        self.call(Some(error.into()), Value::Null);
    }
}
