//! Per-invocation context.
//!
//! [`InvocationContext`] is the metadata delivered with an invocation. [`Context`] is what the
//! handler receives: that metadata, the function's static identity, and the completion entry
//! points of [`CompletionContext`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::FutureExt as _;
use http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument as _;

use crate::callback::CompletionContext;
use crate::config::FunctionMetadata;
use crate::error::{FunctionError, HandlerError};
use crate::runtime::Shared;
use crate::runtime_api::NextInvocation;

pub const DEADLINE_HEADER: &str = "Lambda-Runtime-Deadline-Ms";
pub const TRACE_ID_HEADER: &str = "Lambda-Runtime-Trace-Id";
pub const FUNCTION_ARN_HEADER: &str = "Lambda-Runtime-Invoked-Function-Arn";
pub const CLIENT_CONTEXT_HEADER: &str = "Lambda-Runtime-Client-Context";
pub const COGNITO_IDENTITY_HEADER: &str = "Lambda-Runtime-Cognito-Identity";

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationContext {
    pub request_id: String,
    /// Milliseconds since the Unix epoch. Advisory: nothing here enforces it.
    pub deadline_ms: Option<u64>,
    pub xray_trace_id: Option<String>,
    pub invoked_function_arn: Option<String>,
    pub client_context: Option<Value>,
    pub identity: Option<Value>,
}

impl InvocationContext {
    pub fn from_next(next: &NextInvocation) -> Self {
        let headers = &next.headers;
        let deadline_ms = header_str(headers, DEADLINE_HEADER).and_then(|raw| {
            match raw.parse::<u64>() {
                Ok(ms) => Some(ms),
                Err(err) => {
                    tracing::warn!(header = DEADLINE_HEADER, error = %err, "ignoring malformed header");
                    None
                }
            }
        });

        Self {
            request_id: next.request_id.clone(),
            deadline_ms,
            xray_trace_id: header_str(headers, TRACE_ID_HEADER).map(str::to_string),
            invoked_function_arn: header_str(headers, FUNCTION_ARN_HEADER).map(str::to_string),
            client_context: header_json(headers, CLIENT_CONTEXT_HEADER),
            identity: header_json(headers, COGNITO_IDENTITY_HEADER),
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining_time(&self) -> Option<Duration> {
        let deadline = UNIX_EPOCH + Duration::from_millis(self.deadline_ms?);
        Some(
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        )
    }

    pub fn span(&self) -> tracing::Span {
        crate::logging::invocation_span(&self.request_id, self.xray_trace_id.as_deref())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn header_json(headers: &HeaderMap, name: &str) -> Option<Value> {
    let raw = header_str(headers, name)?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(header = name, error = %err, "ignoring malformed header");
            None
        }
    }
}

/// Handler-facing view of an invocation.
#[derive(Clone)]
pub struct Context {
    invocation: Arc<InvocationContext>,
    function: Arc<FunctionMetadata>,
    completion: CompletionContext,
    shared: Arc<Shared>,
    span: tracing::Span,
}

impl Context {
    pub(crate) fn new(
        invocation: Arc<InvocationContext>,
        function: Arc<FunctionMetadata>,
        completion: CompletionContext,
        shared: Arc<Shared>,
        span: tracing::Span,
    ) -> Self {
        Self {
            invocation,
            function,
            completion,
            shared,
            span,
        }
    }

    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }

    pub fn request_id(&self) -> &str {
        &self.invocation.request_id
    }

    pub fn remaining_time(&self) -> Option<Duration> {
        self.invocation.remaining_time()
    }

    pub fn function(&self) -> &FunctionMetadata {
        &self.function
    }

    pub fn completion(&self) -> &CompletionContext {
        &self.completion
    }

    pub fn wait_for_idle(&self) -> bool {
        self.completion.wait_for_idle()
    }

    pub fn set_wait_for_idle(&self, value: bool) {
        self.completion.set_wait_for_idle(value);
    }

    pub fn succeed<T: Serialize>(&self, result: T) {
        self.completion.succeed(result);
    }

    pub fn fail(&self, error: Option<HandlerError>) {
        self.completion.fail(error);
    }

    pub fn done<T: Serialize>(&self, error: Option<HandlerError>, result: T) {
        self.completion.done(error, result);
    }

    /// Runs background work that keeps the process from going idle until it finishes.
    ///
    /// Nobody awaits the task: an `Err` is an unhandled rejection and a panic is an uncaught
    /// exception, both fatal to the process. Tasks started with a bare `tokio::spawn` get none of
    /// this: the idle fallback does not wait for them and their panics are never reported.
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let guard = self.shared.idle.begin_work();
        let shared = self.shared.clone();
        let task = async move {
            let _guard = guard;
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => shared.fatal.unhandled_rejection(err.into()).await,
                Err(panic) => {
                    let error = FunctionError::from_panic(panic);
                    shared.fatal.uncaught_exception(error.into()).await;
                }
            }
        };
        self.shared.handle.spawn(task.instrument(self.span.clone()));
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("invocation", &self.invocation)
            .field("function", &self.function)
            .field("wait_for_idle", &self.wait_for_idle())
            .field("completed", &self.completion.is_completed())
            .finish()
    }
}
