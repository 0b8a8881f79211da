//! Lambda Runtime API client.
//!
//! [`RuntimeApi`] is the seam the invocation loop talks through; [`RuntimeApiClient`] is the HTTP
//! implementation used in production.

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;

use crate::error::{ErrorResponse, HandlerError};
use crate::xray::{self, XRAY_ERROR_CAUSE_HEADER};

pub const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
pub const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

#[derive(Debug)]
pub struct NextInvocation {
    pub request_id: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The four control-plane operations the invocation loop depends on.
#[async_trait]
pub trait RuntimeApi: Send + Sync {
    /// Long-polls for the next invocation.
    async fn next_invocation(&self) -> anyhow::Result<NextInvocation>;

    async fn post_invocation_response(
        &self,
        request_id: &str,
        response: &Value,
    ) -> anyhow::Result<()>;

    /// Reports an invocation failure, including its X-Ray cause.
    async fn post_invocation_error(
        &self,
        request_id: &str,
        error: &HandlerError,
    ) -> anyhow::Result<()>;

    /// Reports a failure that happened before any invocation was fetched.
    async fn post_init_error(&self, error: &HandlerError) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct RuntimeApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl RuntimeApiClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().http1_only().build()?;
        Ok(Self { base_url, http })
    }

    async fn post_error_body(
        &self,
        url: String,
        error: &HandlerError,
        xray_cause: Option<String>,
        what: &str,
    ) -> anyhow::Result<()> {
        let response = ErrorResponse::from(error);
        let body = try_serialize(&response)?;

        let mut req = self
            .http
            .post(url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(ERROR_TYPE_HEADER, header_safe(&response.error_type));
        if let Some(cause) = xray_cause.filter(|c| !c.is_empty()) {
            req = req.header(XRAY_ERROR_CAUSE_HEADER, header_safe(&cause));
        }

        let resp = req.body(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("upstream {what} failed (status {status})");
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeApi for RuntimeApiClient {
    async fn next_invocation(&self) -> anyhow::Result<NextInvocation> {
        let url = format!("{}/2018-06-01/runtime/invocation/next", self.base_url);
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("upstream /next failed (status {status})");
        }

        let headers = resp.headers().clone();
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("upstream /next missing {REQUEST_ID_HEADER}"))?
            .to_string();

        let body = resp.bytes().await?;

        Ok(NextInvocation {
            request_id,
            headers,
            body,
        })
    }

    async fn post_invocation_response(
        &self,
        request_id: &str,
        response: &Value,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/2018-06-01/runtime/invocation/{}/response",
            self.base_url, request_id
        );
        let body = try_serialize(response)?;
        let resp = self
            .http
            .post(url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("upstream /response failed (status {status})");
        }
        Ok(())
    }

    async fn post_invocation_error(
        &self,
        request_id: &str,
        error: &HandlerError,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/2018-06-01/runtime/invocation/{}/error",
            self.base_url, request_id
        );
        let cause = xray::formatted(&error.homogenize());
        self.post_error_body(url, error, Some(cause), "/error").await
    }

    async fn post_init_error(&self, error: &HandlerError) -> anyhow::Result<()> {
        let url = format!("{}/2018-06-01/runtime/init/error", self.base_url);
        self.post_error_body(url, error, None, "/init/error").await
    }
}

fn try_serialize<T: serde::Serialize>(body: &T) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(body)
        .map_err(|_| anyhow::anyhow!(crate::error::UNSERIALIZABLE_RESPONSE_MESSAGE))
}

/// Header values cannot carry control characters; replace them rather than fail the report.
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\t' || (' '..='~').contains(&c) { c } else { ' ' })
        .collect()
}
