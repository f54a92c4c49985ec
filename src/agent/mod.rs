//! Update Agent
//!
//! This module handles:
//! - The DDI poll loop (identify, deploy, cancel, sleep)
//! - Deployment download, verification and the install trigger
//! - Rejection of cancel requests
//! - Feedback for notifications of the local installer

mod deployment;
mod notifications;

#[cfg(test)]
mod test_support;

use crate::config::AgentConfig;
use crate::ddi::{DdiClient, DdiError};
use crate::installer::{Installer, LockKeeper};
use rauc_hawkbit_shared::defaults::CANCEL_REJECTED_DETAIL;
use rauc_hawkbit_shared::{
    links, BaseResource, DeploymentEvent, DeploymentState, DeploymentTracker, Execution,
    Finished, TransitionResult,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Called with the installer's result code once an install completes
pub type CompletionCallback = Box<dyn Fn(i32) + Send + Sync>;

/// Called with a percentage and a message for every install step
pub type StepCallback = Box<dyn Fn(i32, &str) + Send + Sync>;

/// Construction parameters of the agent
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Identification attributes sent as config data
    pub attributes: BTreeMap<String, String>,
    /// Destination of downloaded bundles
    pub bundle_location: PathBuf,
    pub poll_error_backoff: Duration,
    pub download_tries: u32,
    pub max_resumes: u32,
    /// Name the install lock is taken under
    pub owner: String,
}

impl AgentOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            attributes: config.device.clone(),
            bundle_location: config.agent.bundle_download_location.clone(),
            poll_error_backoff: config.agent.poll_error_backoff(),
            download_tries: config.agent.download_tries,
            max_resumes: config.agent.max_resumes,
            owner: config.server.target_name.clone(),
        }
    }
}

/// Agent keeping the local installer in sync with the hawkBit server
pub struct UpdateAgent {
    client: DdiClient,
    installer: Arc<dyn Installer>,
    lock_keeper: Option<Arc<dyn LockKeeper>>,
    options: AgentOptions,
    completion: Option<CompletionCallback>,
    step: Option<StepCallback>,
    state: Mutex<DeploymentTracker>,
    lock_held: AtomicBool,
}

impl UpdateAgent {
    pub fn new(client: DdiClient, installer: Arc<dyn Installer>, options: AgentOptions) -> Self {
        Self {
            client,
            installer,
            lock_keeper: None,
            options,
            completion: None,
            step: None,
            state: Mutex::new(DeploymentTracker::new()),
            lock_held: AtomicBool::new(false),
        }
    }

    /// Take `lock_keeper` before every install trigger
    pub fn with_lock_keeper(mut self, lock_keeper: Arc<dyn LockKeeper>) -> Self {
        self.lock_keeper = Some(lock_keeper);
        self
    }

    pub fn on_completion(mut self, callback: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.completion = Some(Box::new(callback));
        self
    }

    pub fn on_step(mut self, callback: impl Fn(i32, &str) + Send + Sync + 'static) -> Self {
        self.step = Some(Box::new(callback));
        self
    }

    /// Current deployment state
    pub async fn state(&self) -> DeploymentState {
        self.state.lock().await.state().clone()
    }

    /// Action installer notifications are reported against
    pub async fn active_action(&self) -> Option<String> {
        self.state.lock().await.active_action().map(str::to_string)
    }

    pub(crate) fn notify_step(&self, percentage: i32, msg: &str) {
        if let Some(step) = &self.step {
            step(percentage, msg);
        }
    }

    pub(crate) async fn transition(&self, event: DeploymentEvent) {
        let mut tracker = self.state.lock().await;
        match tracker.process_event(event) {
            TransitionResult::Success(state) => debug!("Deployment state: {:?}", state),
            TransitionResult::Invalid { from, event } => {
                warn!("Ignoring {:?} in deployment state {:?}", event, from)
            }
        }
    }

    /// Poll until `shutdown` resolves.
    ///
    /// A failed iteration discards the deployment state and is retried after
    /// the configured backoff.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            let result = tokio::select! {
                _ = &mut shutdown => break,
                result = self.poll_once() => result,
            };

            let wait = match result {
                Ok(sleep) => sleep,
                Err(e) => {
                    if e.is_transient() {
                        warn!("Polling failed with a temporary error: {}", e);
                    } else {
                        error!("Polling failed with an unexpected error: {}", e);
                    }
                    self.transition(DeploymentEvent::Reset).await;
                    info!(
                        "Retry will happen in {} seconds",
                        self.options.poll_error_backoff.as_secs()
                    );
                    self.options.poll_error_backoff
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Polling cancelled");
    }

    /// One iteration of the poll loop, returning the server's poll interval
    pub async fn poll_once(&self) -> Result<Duration, DdiError> {
        let base = self.client.poll_base().await?;

        if base.links.config_data.is_some() {
            self.identify().await?;
        }
        if let Some(link) = &base.links.deployment_base {
            self.process_deployment(&link.href).await?;
        }
        if let Some(link) = &base.links.cancel_action {
            self.cancel(&link.href).await?;
        }

        sleep_time(&base)
    }

    /// Send the identification attributes as config data
    pub async fn identify(&self) -> Result<(), DdiError> {
        info!("Sending identifying information to hawkBit");
        self.client
            .config_data(Execution::Closed, Finished::Success, &self.options.attributes)
            .await
    }

    /// Reject the cancel request behind `href`
    pub async fn cancel(&self, href: &str) -> Result<(), DdiError> {
        info!("Received cancelation request");
        let action_id = links::cancel_action(href)?;
        let descriptor = self.client.cancel_action(&action_id).await?;
        let stop_id = descriptor.cancel_action.stop_id;

        info!("Rejecting cancelation request {}", stop_id);
        self.client
            .cancel_feedback(
                &stop_id,
                Execution::Rejected,
                Finished::Success,
                vec![CANCEL_REJECTED_DETAIL.to_string()],
            )
            .await
    }
}

fn sleep_time(base: &BaseResource) -> Result<Duration, DdiError> {
    let sleep = base.sleep_time()?;
    info!("Will sleep for {:?}", sleep);
    Ok(sleep)
}
