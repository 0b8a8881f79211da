//! `lambda-bootstrap` runs a long-lived handler behind the Lambda Runtime API.
//!
//! The loop fetches one invocation at a time, hands it to the handler, and reports exactly one
//! outcome per invocation no matter how the handler signals completion:
//! - the node-style [`Callback`] or the [`Context`] entry points (`succeed`, `fail`, `done`)
//! - a deferred value returned as [`Dispatch::Deferred`]
//! - implicitly, once all pending work has drained (the idle fallback reports `null`)
//!
//! Core modules:
//! - [`runtime`]: the invocation loop and the [`Handler`] trait
//! - [`callback`]: the once-only completion latch
//! - [`context`]: per-invocation metadata and the handler-facing context
//! - [`idle`]: the idle-completion hook and pending-work counter
//! - [`fatal`]: fatal-condition routing and the fixed exit codes
//! - [`error`] / [`xray`]: the error taxonomy and its wire renderings
//! - [`runtime_api`]: the Runtime API client

use std::sync::Arc;

pub mod callback;
pub mod config;
pub mod context;
pub mod error;
pub mod fatal;
pub mod idle;
pub mod logging;
pub mod runtime;
pub mod runtime_api;
pub mod xray;

#[cfg(test)]
mod testing;

pub use callback::{Callback, CompletionContext};
pub use config::Config;
pub use context::Context;
pub use error::{FunctionError, HandlerError};
pub use runtime::{async_handler, Dispatch, Handler, Runtime};

/// Reads the environment, builds the handler with `init`, and serves invocations.
///
/// Only a missing Runtime API address or a client setup failure is returned; everything after
/// that is reported to the Runtime API and ends the process with the matching exit code.
pub async fn run<F, H>(init: F) -> anyhow::Result<i32>
where
    F: FnOnce(&Config) -> anyhow::Result<H>,
    H: Handler,
{
    logging::init_tracing(config::LogFormat::from_env());
    let config = Config::from_env()?;

    let api = Arc::new(runtime_api::RuntimeApiClient::new(
        config.runtime_api_base_url(),
    )?);
    let runtime = Runtime::new(api, config.function.clone())?;
    Ok(runtime.init_and_run(|| init(&config)).await)
}
