//! In-memory Runtime API used by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{ErrorResponse, HandlerError};
use crate::fatal::Terminator;
use crate::runtime_api::{NextInvocation, RuntimeApi, REQUEST_ID_HEADER};
use crate::xray;

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Next,
    Response {
        request_id: String,
        body: Value,
    },
    Error {
        request_id: String,
        response: ErrorResponse,
        xray_cause: String,
    },
    InitError(ErrorResponse),
}

#[derive(Default)]
pub struct RecordingApi {
    queue: Mutex<VecDeque<NextInvocation>>,
    calls: Mutex<Vec<ApiCall>>,
    changed: Notify,
    fail_next_when_empty: AtomicBool,
    fail_posts: AtomicBool,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request_id: &str, body: &str) {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_str(request_id).unwrap());
        headers.insert(
            "Lambda-Runtime-Deadline-Ms",
            HeaderValue::from_static("4102444800000"),
        );
        self.push_invocation(NextInvocation {
            request_id: request_id.to_string(),
            headers,
            body: Bytes::copy_from_slice(body.as_bytes()),
        });
    }

    pub fn push_invocation(&self, next: NextInvocation) {
        self.queue.lock().unwrap().push_back(next);
        self.changed.notify_waiters();
    }

    /// Makes `next_invocation` fail instead of waiting once the queue drains.
    pub fn fail_next_when_empty(&self) {
        self.fail_next_when_empty.store(true, Ordering::SeqCst);
    }

    pub fn fail_posts(&self) {
        self.fail_posts.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than `Next`, in order.
    pub fn reports(&self) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, ApiCall::Next))
            .collect()
    }

    /// Waits until `pred` holds for the recorded calls, panicking after a few seconds.
    pub async fn wait_for(&self, pred: impl Fn(&[ApiCall]) -> bool) -> Vec<ApiCall> {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let calls = self.calls();
                if pred(&calls) {
                    return calls;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out; calls so far: {:?}", self.calls()))
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
        self.changed.notify_waiters();
    }

    fn post_result(&self) -> anyhow::Result<()> {
        if self.fail_posts.load(Ordering::SeqCst) {
            anyhow::bail!("runtime api unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeApi for RecordingApi {
    async fn next_invocation(&self) -> anyhow::Result<NextInvocation> {
        self.record(ApiCall::Next);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let popped = self.queue.lock().unwrap().pop_front();
            if let Some(next) = popped {
                return Ok(next);
            }
            if self.fail_next_when_empty.load(Ordering::SeqCst) {
                anyhow::bail!("upstream /next failed (status 500 Internal Server Error)");
            }
            notified.await;
        }
    }

    async fn post_invocation_response(
        &self,
        request_id: &str,
        response: &Value,
    ) -> anyhow::Result<()> {
        self.post_result()?;
        self.record(ApiCall::Response {
            request_id: request_id.to_string(),
            body: response.clone(),
        });
        Ok(())
    }

    async fn post_invocation_error(
        &self,
        request_id: &str,
        error: &HandlerError,
    ) -> anyhow::Result<()> {
        self.post_result()?;
        self.record(ApiCall::Error {
            request_id: request_id.to_string(),
            response: ErrorResponse::from(error),
            xray_cause: xray::formatted(&error.homogenize()),
        });
        Ok(())
    }

    async fn post_init_error(&self, error: &HandlerError) -> anyhow::Result<()> {
        self.post_result()?;
        self.record(ApiCall::InitError(ErrorResponse::from(error)));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTerminator {
    codes: Mutex<Vec<i32>>,
}

impl RecordingTerminator {
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().unwrap().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().unwrap().push(code);
    }
}

pub fn shared() -> (Arc<RecordingApi>, Arc<RecordingTerminator>) {
    (
        Arc::new(RecordingApi::new()),
        Arc::new(RecordingTerminator::default()),
    )
}
