//! Errors of the DDI client and the deployment flow

use rauc_hawkbit_shared::{LinkError, SleepParseError};
use thiserror::Error;

/// Human readable reasons for the status codes the DDI API documents
pub fn status_reason(status: u16) -> Option<&'static str> {
    match status {
        400 => Some("Bad Request - e.g. invalid parameters"),
        401 => Some("The request requires user authentication."),
        403 => Some("Insufficient permissions or data volume restriction applies."),
        404 => Some("Resource not available or device unknown."),
        405 => Some("Method Not Allowed"),
        406 => Some("Accept header is specified and is not application/json."),
        429 => Some("Too many requests."),
        _ => None,
    }
}

#[derive(Error, Debug)]
pub enum DdiError {
    /// Server answered with a status other than 200 or 206
    #[error("{status}: {reason}")]
    Api { status: u16, reason: String },

    /// Malformed descriptor or refused local operation
    #[error("{0}")]
    Protocol(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Download kept dropping: gave up at byte {offset} after {resumes} resumes")]
    ResumeLimit { offset: u64, resumes: u32 },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Sleep(#[from] SleepParseError),
}

impl DdiError {
    /// Build an API error, preferring the documented reason for `status`
    pub fn api(status: u16, transport_reason: Option<&str>) -> Self {
        let reason = status_reason(status)
            .or(transport_reason)
            .unwrap_or("Unknown status")
            .to_string();
        DdiError::Api { status, reason }
    }

    /// Network, server-side and protocol problems expected to go away on a
    /// later poll
    pub fn is_transient(&self) -> bool {
        match self {
            DdiError::Api { .. }
            | DdiError::Protocol(_)
            | DdiError::ResumeLimit { .. }
            | DdiError::Link(_)
            | DdiError::Sleep(_) => true,
            DdiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            DdiError::Io(_) | DdiError::Json(_) => false,
        }
    }
}
