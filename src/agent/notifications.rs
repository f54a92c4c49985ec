//! Handlers for notifications of the local installer

use super::UpdateAgent;
use crate::bus::{BusValue, EventBridge};
use crate::ddi::DdiError;
use crate::installer::INSTALLER_INTERFACE;
use anyhow::anyhow;
use rauc_hawkbit_shared::{DeploymentEvent, Execution, Finished};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl UpdateAgent {
    /// Register the installer handlers on `bridge`
    pub fn subscribe(self: &Arc<Self>, bridge: &EventBridge) {
        let agent = self.clone();
        bridge.subscribe(INSTALLER_INTERFACE, "Completed", move |args| {
            let agent = agent.clone();
            async move {
                let result = args
                    .first()
                    .and_then(BusValue::as_int)
                    .ok_or_else(|| anyhow!("Completed signal without result code"))?;
                agent.on_completed(result as i32).await?;
                Ok(())
            }
        });

        let agent = self.clone();
        bridge.subscribe_property(INSTALLER_INTERFACE, "Progress", move |args| {
            let agent = agent.clone();
            async move {
                let progress = args.first().and_then(BusValue::as_tuple);
                let Some([percentage, description, depth]) = progress else {
                    return Err(anyhow!("Malformed Progress value: {:?}", args));
                };
                let (Some(percentage), Some(description), Some(depth)) =
                    (percentage.as_int(), description.as_str(), depth.as_int())
                else {
                    return Err(anyhow!("Malformed Progress value: {:?}", args));
                };
                agent
                    .on_progress(percentage as i32, description, depth as i32)
                    .await?;
                Ok(())
            }
        });

        let agent = self.clone();
        bridge.subscribe_property(INSTALLER_INTERFACE, "LastError", move |args| {
            let agent = agent.clone();
            async move {
                let message = args
                    .first()
                    .and_then(BusValue::as_str)
                    .ok_or_else(|| anyhow!("Malformed LastError value: {:?}", args))?;
                agent.on_last_error(message).await?;
                Ok(())
            }
        });
    }

    /// Report the result of a finished installation
    pub async fn on_completed(&self, result: i32) -> Result<(), DdiError> {
        let Some(action_id) = self.active_action().await else {
            debug!("Install completed without an active deployment, triggered elsewhere");
            return Ok(());
        };

        self.release_lock().await;
        if let Err(e) = tokio::fs::remove_file(&self.options.bundle_location).await {
            warn!(
                "Failed to remove bundle {}: {}",
                self.options.bundle_location.display(),
                e
            );
        }

        let msg = format!("Rauc bundle update completed with result: {}", result);
        info!("{}", msg);

        let finished = if result == 0 {
            Finished::Success
        } else {
            Finished::Failure
        };
        let feedback = self
            .client
            .deployment_feedback(&action_id, Execution::Closed, finished, vec![msg], None)
            .await;

        self.transition(DeploymentEvent::Completed).await;
        if let Some(completion) = &self.completion {
            completion(result);
        }
        feedback
    }

    /// Forward an installation step
    pub async fn on_progress(
        &self,
        percentage: i32,
        description: &str,
        depth: i32,
    ) -> Result<(), DdiError> {
        let Some(action_id) = self.active_action().await else {
            return Ok(());
        };

        info!("Update progress: {}% {}", percentage, description);
        debug!("Progress nesting depth {}", depth);
        self.notify_step(percentage, description);

        self.client
            .deployment_feedback(
                &action_id,
                Execution::Proceeding,
                Finished::None,
                vec![description.to_string()],
                Some(percentage),
            )
            .await
    }

    /// Forward an installer error message; an empty message clears the
    /// property and is not reported
    pub async fn on_last_error(&self, message: &str) -> Result<(), DdiError> {
        let Some(action_id) = self.active_action().await else {
            return Ok(());
        };
        if message.is_empty() {
            return Ok(());
        }

        info!("Last error: {}", message);
        self.client
            .deployment_feedback(
                &action_id,
                Execution::Proceeding,
                Finished::Failure,
                vec![message.to_string()],
                None,
            )
            .await
    }
}
