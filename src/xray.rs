//! X-Ray error cause sent alongside invocation errors.
//!
//! The cause travels in a header, so it is size-capped: stack frames are dropped from the tail
//! until it fits, and an empty string is sent if even the frameless cause is too large.

use serde::Serialize;

use crate::error::FunctionError;

pub const XRAY_ERROR_CAUSE_HEADER: &str = "Lambda-Runtime-Function-XRay-Error-Cause";
pub const MAX_XRAY_CAUSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub path: String,
    pub line: Option<u32>,
    pub label: String,
}

#[derive(Debug, Serialize)]
struct XRayException<'a> {
    #[serde(rename = "type")]
    error_type: &'a str,
    message: &'a str,
    stack: &'a [StackFrame],
}

#[derive(Debug, Serialize)]
struct XRayCause<'a> {
    working_directory: &'a str,
    exceptions: [XRayException<'a>; 1],
    paths: Vec<&'a str>,
}

/// Renders the trace-propagation cause for `err`.
pub fn formatted(err: &FunctionError) -> String {
    let working_directory = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let frames = stack_frames(&err.trace);

    let fits = |keep: usize| {
        render(err, &working_directory, &frames[..keep])
            .filter(|json| json.len() <= MAX_XRAY_CAUSE_BYTES)
    };

    if let Some(json) = fits(frames.len()) {
        return json;
    }
    let Some(mut best) = fits(0) else {
        return String::new();
    };

    // Longest frame prefix that still fits; `lo` fits, `hi` does not.
    let (mut lo, mut hi) = (0, frames.len());
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        match fits(mid) {
            Some(json) => {
                best = json;
                lo = mid;
            }
            None => hi = mid,
        }
    }
    best
}

fn render(err: &FunctionError, working_directory: &str, frames: &[StackFrame]) -> Option<String> {
    let mut paths: Vec<&str> = Vec::new();
    for frame in frames {
        if !paths.contains(&frame.path.as_str()) {
            paths.push(&frame.path);
        }
    }

    let cause = XRayCause {
        working_directory,
        exceptions: [XRayException {
            error_type: &err.error_type,
            message: &err.error_message,
            stack: frames,
        }],
        paths,
    };
    serde_json::to_string(&cause).ok()
}

/// Parses trace lines shaped like `at <label> (<path>:<line>)` or `at <path>:<line>`.
pub fn stack_frames(trace: &[String]) -> Vec<StackFrame> {
    trace.iter().filter_map(|line| parse_frame(line)).collect()
}

fn parse_frame(line: &str) -> Option<StackFrame> {
    let rest = line.trim().strip_prefix("at ")?;

    let (label, location) = match rest.strip_suffix(')').and_then(|r| r.rsplit_once(" (")) {
        Some((label, location)) => (label.trim(), location),
        None => ("", rest),
    };

    let (path, line) = match location.rsplit_once(':') {
        Some((path, line)) if line.chars().all(|c| c.is_ascii_digit()) => {
            (path, line.parse().ok())
        }
        _ => (location, None),
    };

    Some(StackFrame {
        path: path.to_string(),
        line,
        label: if label.is_empty() {
            "anonymous".to_string()
        } else {
            label.to_string()
        },
    })
}
