//! Deployment handling: download, checksum verification, install trigger

use super::UpdateAgent;
use crate::ddi::DdiError;
use rauc_hawkbit_shared::{
    links, Artifact, ArtifactLocation, DeploymentEvent, Execution, Finished,
};
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

impl UpdateAgent {
    /// Download, verify and install the deployment behind `href`.
    ///
    /// Ignored while another deployment is being handled.
    pub async fn process_deployment(&self, href: &str) -> Result<(), DdiError> {
        let state = self.state().await;
        if let Some(current) = state.action_id() {
            info!("Deployment {} is already in progress", current);
            return Ok(());
        }

        let (action_id, resource) = links::deployment_action(href)?;
        info!("Deployment {} found for this target", action_id);
        self.transition(DeploymentEvent::DownloadStarted {
            action_id: action_id.clone(),
        })
        .await;

        let descriptor = self.client.deployment(&action_id, &resource).await?;
        let artifact = match descriptor.first_artifact() {
            Ok(artifact) => artifact,
            Err(msg) => {
                return Err(self
                    .abort(&action_id, DeploymentEvent::DownloadFailed, msg)
                    .await)
            }
        };

        let Some(url) = artifact.download_url() else {
            return Err(self
                .abort(
                    &action_id,
                    DeploymentEvent::DownloadFailed,
                    "Artifact without download link found. Ignoring",
                )
                .await);
        };
        let location = ArtifactLocation::from_href(url);

        let Some(expected) = self.expected_checksum(artifact, &location).await? else {
            return Err(self
                .abort(
                    &action_id,
                    DeploymentEvent::DownloadFailed,
                    "Artifact without MD5 checksum found. Ignoring",
                )
                .await);
        };

        info!("Starting bundle download of {}", artifact.filename);
        self.download(&action_id, &location, &expected).await?;
        self.transition(DeploymentEvent::DownloadVerified).await;

        info!("Starting installation");
        self.install(&action_id).await
    }

    /// MD5 the artifact must match, from the descriptor or its side-channel
    async fn expected_checksum(
        &self,
        artifact: &Artifact,
        location: &ArtifactLocation,
    ) -> Result<Option<String>, DdiError> {
        if let Some(md5) = &artifact.hashes.md5 {
            return Ok(Some(md5.to_ascii_lowercase()));
        }
        if let Some(url) = artifact.md5sum_url() {
            return self.client.get_md5sum(url).await.map(Some);
        }
        match location {
            ArtifactLocation::Module { module, filename } => {
                self.client.artifact_md5sum(module, filename).await.map(Some)
            }
            ArtifactLocation::Static(_) => Ok(None),
        }
    }

    /// Download the bundle until its checksum matches, up to the configured
    /// number of tries
    async fn download(
        &self,
        action_id: &str,
        location: &ArtifactLocation,
        expected: &str,
    ) -> Result<(), DdiError> {
        self.notify_step(0, "Downloading bundle...");

        let tries = self.options.download_tries;
        let dest = &self.options.bundle_location;
        let max_resumes = self.options.max_resumes;

        for attempt in 1..=tries {
            let result = match location {
                ArtifactLocation::Module { module, filename } => {
                    self.client
                        .download_artifact(module, filename, dest, max_resumes)
                        .await
                }
                // Servers may hand out static URLs outside the DDI API
                ArtifactLocation::Static(url) => {
                    self.client.get_binary(url, dest, max_resumes).await
                }
            };

            let remaining = tries - attempt;
            match result {
                Ok(checksum) if checksum.eq_ignore_ascii_case(expected) => {
                    info!("Download successful");
                    return Ok(());
                }
                Ok(checksum) => error!(
                    "Checksum does not match ({} != {}). {} tries remaining",
                    checksum, expected, remaining
                ),
                Err(e @ DdiError::ResumeLimit { .. }) => {
                    error!("{}. {} tries remaining", e, remaining)
                }
                Err(e) => return Err(e),
            }
        }

        let msg = format!("Artifact checksum does not match after {} tries.", tries);
        Err(self
            .abort(action_id, DeploymentEvent::DownloadFailed, &msg)
            .await)
    }

    /// Take the install lock and trigger the installer with the bundle
    async fn install(&self, action_id: &str) -> Result<(), DdiError> {
        if let Some(lock_keeper) = &self.lock_keeper {
            match lock_keeper.lock(&self.options.owner).await {
                Ok(true) => self.lock_held.store(true, Ordering::SeqCst),
                Ok(false) => {
                    // The action stays claimed so later polls do not fetch it again
                    info!("Another installation is already in progress, aborting");
                    self.transition(DeploymentEvent::InstallDeferred).await;
                    return Ok(());
                }
                Err(e) => {
                    let msg = format!("Failed to take install lock: {:#}", e);
                    return Err(self
                        .abort(action_id, DeploymentEvent::InstallFailed, &msg)
                        .await);
                }
            }
        }

        // Spawned so that dropping the poll future cannot interrupt the call
        let installer = self.installer.clone();
        let bundle = self.options.bundle_location.clone();
        let trigger = tokio::spawn(async move { installer.install(&bundle).await });

        let result = match trigger.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("Install trigger task failed: {}", e)),
        };

        match result {
            Ok(()) => {
                info!(
                    "{} installation triggered for action {}",
                    self.installer.name(),
                    action_id
                );
                self.transition(DeploymentEvent::InstallTriggered).await;
                Ok(())
            }
            Err(e) => {
                self.release_lock().await;
                Err(self
                    .abort(action_id, DeploymentEvent::InstallFailed, &format!("{:#}", e))
                    .await)
            }
        }
    }

    /// Release the install lock if this agent holds it
    pub(crate) async fn release_lock(&self) {
        if !self.lock_held.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(lock_keeper) = &self.lock_keeper {
            if let Err(e) = lock_keeper.unlock(&self.options.owner).await {
                warn!("Failed to release install lock: {:#}", e);
            }
        }
    }

    /// Leave the deployment with `event` and report terminal failure.
    ///
    /// Returns the error the caller propagates: the feedback error if the
    /// report could not be sent, a protocol error otherwise.
    async fn abort(&self, action_id: &str, event: DeploymentEvent, msg: &str) -> DdiError {
        error!("Deployment {} failed: {}", action_id, msg);
        self.transition(event).await;

        let feedback = self
            .client
            .deployment_feedback(
                action_id,
                Execution::Closed,
                Finished::Failure,
                vec![msg.to_string()],
                None,
            )
            .await;

        match feedback {
            Ok(()) => DdiError::Protocol(msg.to_string()),
            Err(e) => e,
        }
    }
}
