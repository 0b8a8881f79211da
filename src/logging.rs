use crate::config::LogFormat;

pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // A second init (tests, embedding hosts) keeps the existing subscriber.
    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
}

/// Span wrapping one invocation so every log line carries its request and trace ids.
pub fn invocation_span(request_id: &str, xray_trace_id: Option<&str>) -> tracing::Span {
    tracing::info_span!(
        "invocation",
        request_id = %request_id,
        xray_trace_id = xray_trace_id.unwrap_or_default(),
    )
}
