//! Extraction of action ids and resource selectors from DDI hrefs
//!
//! The server hands out fully qualified links such as
//! ```text
//! https://host/TENANT/controller/v1/TARGET/deploymentBase/3?c=-2129030598
//! https://host/TENANT/controller/v1/TARGET/cancelAction/5
//! https://host/TENANT/controller/v1/TARGET/softwaremodules/12/artifacts/bundle.raucb
//! ```
//! and the agent needs the ids embedded in them.

use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Invalid link {href:?}: {reason}")]
    Invalid { href: String, reason: String },

    #[error("Link {href:?} has no {segment} segment")]
    MissingSegment { href: String, segment: &'static str },

    #[error("Link {0:?} has no resource selector (?c=...)")]
    MissingResource(String),
}

fn parse(href: &str) -> Result<Url, LinkError> {
    Url::parse(href).map_err(|e| LinkError::Invalid {
        href: href.to_string(),
        reason: e.to_string(),
    })
}

/// Path segment following `marker`, with everything after it joined back
fn segment_after(url: &Url, href: &str, marker: &'static str) -> Result<String, LinkError> {
    let missing = || LinkError::MissingSegment {
        href: href.to_string(),
        segment: marker,
    };

    let segments: Vec<&str> = url.path_segments().ok_or_else(missing)?.collect();
    let position = segments
        .iter()
        .rposition(|s| *s == marker)
        .ok_or_else(missing)?;

    let rest = &segments[position + 1..];
    if rest.is_empty() || rest.iter().all(|s| s.is_empty()) {
        return Err(missing());
    }
    Ok(rest.join("/"))
}

/// Action id and resource selector of a `deploymentBase` link
pub fn deployment_action(href: &str) -> Result<(String, String), LinkError> {
    let url = parse(href)?;
    let action_id = segment_after(&url, href, "deploymentBase")?;
    let resource = url
        .query_pairs()
        .find(|(key, _)| key == "c")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LinkError::MissingResource(href.to_string()))?;
    Ok((action_id, resource))
}

/// Action id of a `cancelAction` link
pub fn cancel_action(href: &str) -> Result<String, LinkError> {
    let url = parse(href)?;
    segment_after(&url, href, "cancelAction")
}

/// Where an artifact is fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    /// Artifact served through the DDI software module API
    Module { module: String, filename: String },
    /// Any other URL, downloaded as given
    Static(String),
}

impl ArtifactLocation {
    /// Classify a download href
    pub fn from_href(href: &str) -> Self {
        let module = Url::parse(href).ok().and_then(|url| {
            let segments: Vec<String> = url.path_segments()?.map(str::to_string).collect();
            let position = segments.iter().rposition(|s| s == "softwaremodules")?;
            match &segments[position + 1..] {
                [module, artifacts, filename]
                    if artifacts == "artifacts" && !module.is_empty() && !filename.is_empty() =>
                {
                    Some((module.clone(), filename.clone()))
                }
                _ => None,
            }
        });

        match module {
            Some((module, filename)) => ArtifactLocation::Module { module, filename },
            None => ArtifactLocation::Static(href.to_string()),
        }
    }
}
