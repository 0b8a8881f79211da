//! Runtime configuration read from the Lambda execution environment.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `host:port` of the Runtime API.
    pub runtime_api: String,
    pub function: FunctionMetadata,
    pub log_format: LogFormat,
}

/// Static function identity handed to every invocation's context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionMetadata {
    pub function_name: String,
    pub function_version: String,
    pub memory_limit_in_mb: Option<u32>,
    pub log_group_name: String,
    pub log_stream_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("AWS_LAMBDA_LOG_FORMAT").unwrap_or_default())
    }

    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

impl Config {
    /// Fails only when the Runtime API address is missing; malformed optional metadata is dropped.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> anyhow::Result<Self> {
        let get = |name: &str| vars.get(name).cloned().unwrap_or_default();

        let runtime_api = vars
            .get("AWS_LAMBDA_RUNTIME_API")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing AWS_LAMBDA_RUNTIME_API"))?;

        let memory_limit_in_mb = vars
            .get("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| match raw.parse::<u32>() {
                Ok(mb) => Some(mb),
                Err(err) => {
                    tracing::warn!(
                        var = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
                        value = %raw,
                        error = %err,
                        "ignoring malformed variable"
                    );
                    None
                }
            });

        let log_format = LogFormat::parse(&get("AWS_LAMBDA_LOG_FORMAT"));

        Ok(Self {
            runtime_api,
            function: FunctionMetadata {
                function_name: get("AWS_LAMBDA_FUNCTION_NAME"),
                function_version: get("AWS_LAMBDA_FUNCTION_VERSION"),
                memory_limit_in_mb,
                log_group_name: get("AWS_LAMBDA_LOG_GROUP_NAME"),
                log_stream_name: get("AWS_LAMBDA_LOG_STREAM_NAME"),
            },
            log_format,
        })
    }

    pub fn runtime_api_base_url(&self) -> String {
        if self.runtime_api.starts_with("http://") || self.runtime_api.starts_with("https://") {
            self.runtime_api.clone()
        } else {
            format!("http://{}", self.runtime_api)
        }
    }
}
