//! Routing of process-wide fatal conditions.
//!
//! Failures that escape the handler's direct call path are reported once and then terminate the
//! process. Before the first invocation they go to `/init/error`; afterwards they are attributed
//! to the invocation the router is currently bound to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::error::{to_formatted, FunctionError, HandlerError, UNHANDLED_REJECTION_ERROR_TYPE};
use crate::runtime_api::RuntimeApi;

/// Exit code after an unhandled async rejection. Fixed by the hosting platform.
pub const EXIT_UNHANDLED_REJECTION: i32 = 128;
/// Exit code after an uncaught exception. Fixed by the hosting platform.
pub const EXIT_UNCAUGHT_EXCEPTION: i32 = 129;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCondition {
    UncaughtException,
    UnhandledRejection,
}

impl FatalCondition {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::UncaughtException => EXIT_UNCAUGHT_EXCEPTION,
            Self::UnhandledRejection => EXIT_UNHANDLED_REJECTION,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::UncaughtException => "Uncaught Exception",
            Self::UnhandledRejection => "Unhandled Promise Rejection",
        }
    }
}

/// Ends the process once a fatal condition has been reported.
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Which report a fatal condition turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Init,
    Invocation(String),
}

pub struct FatalRouter {
    api: Arc<dyn RuntimeApi>,
    terminator: Arc<dyn Terminator>,
    binding: Mutex<Binding>,
    terminating: AtomicBool,
    halted: watch::Sender<Option<i32>>,
}

impl FatalRouter {
    pub fn new(api: Arc<dyn RuntimeApi>, terminator: Arc<dyn Terminator>) -> Self {
        let (halted, _) = watch::channel(None);
        Self {
            api,
            terminator,
            binding: Mutex::new(Binding::Init),
            terminating: AtomicBool::new(false),
            halted,
        }
    }

    /// Attributes fatal conditions to `request_id` from now on.
    pub fn bind_invocation(&self, request_id: &str) {
        *self.binding.lock().unwrap_or_else(PoisonError::into_inner) =
            Binding::Invocation(request_id.to_string());
    }

    pub fn binding(&self) -> Binding {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receives the exit code once a fatal condition has terminated the process.
    pub fn halted(&self) -> watch::Receiver<Option<i32>> {
        self.halted.subscribe()
    }

    pub async fn uncaught_exception(&self, error: HandlerError) {
        self.route(FatalCondition::UncaughtException, error).await;
    }

    pub async fn unhandled_rejection(&self, reason: HandlerError) {
        let reason = reason.homogenize();
        let mut error = FunctionError::new(UNHANDLED_REJECTION_ERROR_TYPE, reason.to_string());
        error.trace.extend(reason.trace);
        self.route(FatalCondition::UnhandledRejection, error.into()).await;
    }

    pub async fn route(&self, condition: FatalCondition, error: HandlerError) {
        tracing::error!(
            condition = condition.describe(),
            error = %to_formatted(&error.homogenize()),
            "{}",
            condition.describe()
        );

        if self.terminating.swap(true, Ordering::AcqRel) {
            tracing::warn!("process already terminating; dropping fatal report");
            return;
        }

        let code = condition.exit_code();
        let reported = match self.binding() {
            Binding::Init => self.api.post_init_error(&error).await,
            Binding::Invocation(request_id) => {
                self.api.post_invocation_error(&request_id, &error).await
            }
        };
        if let Err(err) = reported {
            tracing::error!(error = %err, exit_code = code, "failed to report fatal condition");
        }

        self.terminator.terminate(code);
        self.halted.send_replace(Some(code));
    }
}
