//! Failure values reported to the Runtime API.
//!
//! A handler can fail with an error-shaped value ([`FunctionError`]) or with any JSON value. The
//! two are carried together as [`HandlerError`] and rendered in two shapes: [`ErrorResponse`] for
//! the control plane, and [`to_formatted`] for the "Invoke Error" log line.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type used for anything that is not more specific.
pub const GENERIC_ERROR_TYPE: &str = "Error";
/// Error type of a panic raised by handler code.
pub const PANIC_ERROR_TYPE: &str = "Panic";
/// Error type of an event payload that is not valid JSON.
pub const INVALID_PAYLOAD_ERROR_TYPE: &str = "Runtime.InvalidEventPayload";
/// Error type of a background task that failed with nobody awaiting it.
pub const UNHANDLED_REJECTION_ERROR_TYPE: &str = "Runtime.UnhandledRejection";
/// Message reported when a response body cannot be turned into JSON.
pub const UNSERIALIZABLE_RESPONSE_MESSAGE: &str = "Unable to stringify response body";

/// An error-shaped failure: a type name, a message and a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionError {
    pub error_type: String,
    pub error_message: String,
    pub trace: Vec<String>,
}

impl FunctionError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        let error_type = error_type.into();
        let error_message = error_message.into();
        let trace = vec![format!("{error_type}: {error_message}")];
        Self {
            error_type,
            error_message,
            trace,
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.trace.push(frame.into());
        self
    }

    /// The failure used in place of a response that could not be serialized.
    pub fn unserializable_response() -> Self {
        Self::new(GENERIC_ERROR_TYPE, UNSERIALIZABLE_RESPONSE_MESSAGE)
    }

    /// Builds an error from a caught panic payload.
    ///
    /// Must be called on the thread that panicked so the location recorded by the panic hook
    /// can be attached.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        let err = Self::new(PANIC_ERROR_TYPE, message);
        match take_panic_location() {
            Some(location) => err.with_frame(format!("    at panic ({location})")),
            None => err,
        }
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

impl std::error::Error for FunctionError {}

impl From<anyhow::Error> for FunctionError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<FunctionError>() {
            Ok(err) => return err,
            Err(err) => err,
        };

        let mut out = Self::new(GENERIC_ERROR_TYPE, err.to_string());
        for cause in err.chain().skip(1) {
            out.trace.push(format!("caused by: {cause}"));
        }
        out
    }
}

/// A failure value handed to a completion entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    Error(FunctionError),
    /// Any value that is not error-shaped, e.g. `fail("bad input")`.
    Value(Value),
}

impl HandlerError {
    /// The value reported by `fail()` when called without an error.
    pub fn handled() -> Self {
        Self::Value(Value::String("handled".to_string()))
    }

    /// Wraps non-error values as a generic error, keeping only their string form.
    pub fn homogenize(&self) -> FunctionError {
        match self {
            Self::Error(err) => err.clone(),
            Self::Value(value) => FunctionError::new(GENERIC_ERROR_TYPE, value_to_string(value)),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => err.fmt(f),
            Self::Value(value) => f.write_str(&value_to_string(value)),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<FunctionError> for HandlerError {
    fn from(err: FunctionError) -> Self {
        Self::Error(err)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Error(err.into())
    }
}

impl From<Value> for HandlerError {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_string()))
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

/// Body of `/invocation/{id}/error` and `/init/error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "errorType")]
    pub error_type: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    #[serde(default)]
    pub trace: Vec<String>,
}

impl From<&HandlerError> for ErrorResponse {
    fn from(err: &HandlerError) -> Self {
        match err {
            HandlerError::Error(err) => Self {
                error_type: err.error_type.clone(),
                error_message: err.error_message.clone(),
                trace: err.trace.clone(),
            },
            HandlerError::Value(value) => Self {
                error_type: value_kind(value).to_string(),
                error_message: value_to_string(value),
                trace: Vec::new(),
            },
        }
    }
}

#[derive(Serialize)]
struct FormattedError<'a> {
    #[serde(rename = "errorType")]
    error_type: &'a str,
    #[serde(rename = "errorMessage")]
    error_message: &'a str,
    stack: &'a [String],
}

/// Tab-prefixed JSON rendering of an error for log output.
pub fn to_formatted(err: &FunctionError) -> String {
    let formatted = FormattedError {
        error_type: &err.error_type,
        error_message: &err.error_message,
        stack: &err.trace,
    };
    match serde_json::to_string(&formatted) {
        Ok(json) => format!("\t{json}"),
        Err(_) => format!("\t{err}"),
    }
}

/// Serializes a handler result, substituting the fixed reportable error on failure.
pub fn serialize_response<T: Serialize>(result: &T) -> Result<Value, FunctionError> {
    serde_json::to_value(result).map_err(|_| FunctionError::unserializable_response())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

thread_local! {
    static LAST_PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a panic hook that remembers where the last panic on each thread happened.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let location = format!("{}:{}", location.file(), location.line());
                LAST_PANIC_LOCATION.with(|slot| *slot.borrow_mut() = Some(location));
            }
            previous(info);
        }));
    });
}

fn take_panic_location() -> Option<String> {
    LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take())
}
