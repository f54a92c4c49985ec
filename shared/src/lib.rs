//! RAUC hawkBit Shared Protocol Types
//!
//! This crate provides the DDI (Direct Device Integration) wire types, link
//! parsing and the deployment state machine shared by the update agent and
//! its tests.

pub mod links;
pub mod state_machine;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use links::{ArtifactLocation, LinkError};
pub use state_machine::{DeploymentEvent, DeploymentState, DeploymentTracker, TransitionResult};

/// Default agent parameters
pub mod defaults {
    /// Seconds to wait after a failed poll iteration
    pub const POLL_ERROR_BACKOFF_SECS: u64 = 60;

    /// Download attempts before a checksum mismatch becomes terminal
    pub const DOWNLOAD_TRIES: u32 = 3;

    /// Range re-requests allowed within a single download attempt
    pub const MAX_RESUMES: u32 = 8;

    /// HTTP request timeout for JSON resources
    pub const REQUEST_TIMEOUT_SECS: u64 = 10;

    /// Detail sent when rejecting a cancellation request
    pub const CANCEL_REJECTED_DETAIL: &str = "Cancelling not supported";
}

/// Status of an action execution as reported to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    Closed,
    Proceeding,
    Canceled,
    Scheduled,
    Rejected,
    Resumed,
}

/// Outcome of an action execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finished {
    Success,
    Failure,
    None,
}

/// A `{"href": ...}` link object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

/// Links offered by the base poll resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_data: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_base: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_action: Option<Link>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polling {
    #[serde(default)]
    pub sleep: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub polling: Polling,
}

/// Response of `GET /{tenant}/controller/v1/{target}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseResource {
    #[serde(default)]
    pub config: PollingConfig,
    #[serde(rename = "_links", default)]
    pub links: BaseLinks,
}

impl BaseResource {
    /// Time the server asks the device to wait before the next poll
    pub fn sleep_time(&self) -> Result<Duration, SleepParseError> {
        match self.config.polling.sleep.as_deref() {
            Some(sleep) => parse_sleep(sleep),
            None => Err(SleepParseError::Missing),
        }
    }
}

/// Checksums published for an artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<Link>,
    #[serde(rename = "download-http", default, skip_serializing_if = "Option::is_none")]
    pub download_http: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<Link>,
    #[serde(rename = "md5sum-http", default, skip_serializing_if = "Option::is_none")]
    pub md5sum_http: Option<Link>,
}

/// One downloadable file of a chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hashes: Hashes,
    #[serde(rename = "_links", default)]
    pub links: ArtifactLinks,
}

impl Artifact {
    /// Download link, preferring https (`download`) over http (`download-http`)
    pub fn download_url(&self) -> Option<&str> {
        self.links
            .download
            .as_ref()
            .or(self.links.download_http.as_ref())
            .map(|link| link.href.as_str())
    }

    /// Checksum side-channel link, with the same transport preference
    pub fn md5sum_url(&self) -> Option<&str> {
        self.links
            .md5sum
            .as_ref()
            .or(self.links.md5sum_http.as_ref())
            .map(|link| link.href.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub part: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub download: Option<String>,
    #[serde(default)]
    pub update: Option<String>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

/// Response of `GET deploymentBase/{actionId}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub deployment: Deployment,
}

impl DeploymentDescriptor {
    /// First artifact of the first chunk, or a description of what is missing
    pub fn first_artifact(&self) -> Result<&Artifact, &'static str> {
        let chunk = self
            .deployment
            .chunks
            .first()
            .ok_or("Deployment without chunks found. Ignoring")?;
        chunk
            .artifacts
            .first()
            .ok_or("Deployment without artifacts found. Ignoring")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAction {
    #[serde(deserialize_with = "string_or_number")]
    pub stop_id: String,
}

/// Response of `GET cancelAction/{actionId}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    pub cancel_action: CancelAction,
}

/// hawkBit sends ids as strings, but some servers emit bare numbers
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Progress reported with a proceeding deployment feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percentage: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub finished: Finished,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackStatus {
    pub execution: Execution,
    pub result: FeedbackResult,
    #[serde(default)]
    pub details: Vec<String>,
}

/// Body of the deployment and cancel feedback POSTs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub time: String,
    pub status: FeedbackStatus,
}

impl Feedback {
    /// Create a feedback message for the given action
    pub fn new(
        id: impl Into<String>,
        time: impl Into<String>,
        execution: Execution,
        finished: Finished,
        details: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            time: time.into(),
            status: FeedbackStatus {
                execution,
                result: FeedbackResult {
                    finished,
                    progress: None,
                },
                details,
            },
        }
    }

    /// Attach a progress percentage
    pub fn with_progress(mut self, percentage: i32) -> Self {
        self.status.result.progress = Some(Progress { percentage });
        self
    }
}

/// Body of the `PUT configData` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigData {
    pub id: String,
    pub time: String,
    pub status: FeedbackStatus,
    pub data: BTreeMap<String, String>,
}

impl ConfigData {
    pub fn new(
        time: impl Into<String>,
        execution: Execution,
        finished: Finished,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: String::new(),
            time: time.into(),
            status: FeedbackStatus {
                execution,
                result: FeedbackResult {
                    finished,
                    progress: None,
                },
                details: Vec::new(),
            },
            data,
        }
    }
}

/// Errors parsing the server-provided `HH:MM:SS` poll interval
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SleepParseError {
    #[error("Base resource carries no polling sleep time")]
    Missing,

    #[error("Invalid polling sleep time: {0:?} (expected HH:MM:SS)")]
    Invalid(String),
}

/// Parse a `HH:MM:SS` interval
pub fn parse_sleep(value: &str) -> Result<Duration, SleepParseError> {
    let invalid = || SleepParseError::Invalid(value.to_string());

    let parts: Vec<&str> = value.trim().split(':').collect();
    let [hours, minutes, seconds] = parts.as_slice() else {
        return Err(invalid());
    };

    let parse = |field: &str, max: u64| -> Result<u64, SleepParseError> {
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let n: u64 = field.parse().map_err(|_| invalid())?;
        if n > max {
            return Err(invalid());
        }
        Ok(n)
    };

    let hours = parse(*hours, 23)?;
    let minutes = parse(*minutes, 59)?;
    let seconds = parse(*seconds, 59)?;

    Ok(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Execution::Closed => "closed",
            Execution::Proceeding => "proceeding",
            Execution::Canceled => "canceled",
            Execution::Scheduled => "scheduled",
            Execution::Rejected => "rejected",
            Execution::Resumed => "resumed",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Finished {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Finished::Success => "success",
            Finished::Failure => "failure",
            Finished::None => "none",
        };
        f.write_str(name)
    }
}
