//! Deployment State Machine
//!
//! Tracks the single deployment the agent may be working on and defines the
//! valid transitions between its phases.

/// Phase of the deployment currently handled by the agent
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeploymentState {
    /// No deployment in progress
    #[default]
    Idle,
    /// Artifact is being downloaded and verified
    Downloading { action_id: String },
    /// Install was (or is about to be) triggered on the local installer
    Installing { action_id: String },
    /// Install trigger returned, waiting for the completion notification
    AwaitingCompletion { action_id: String },
    /// Install lock was held by another updater; the action stays claimed
    /// until that install completes or the state is discarded
    Deferred { action_id: String },
}

impl DeploymentState {
    /// Action the agent reports local installer notifications against.
    ///
    /// Only set once the artifact is verified and installation has been
    /// requested; notifications seen while idle or downloading belong to an
    /// install triggered from elsewhere.
    pub fn active_action(&self) -> Option<&str> {
        match self {
            DeploymentState::Installing { action_id }
            | DeploymentState::AwaitingCompletion { action_id }
            | DeploymentState::Deferred { action_id } => Some(action_id),
            _ => None,
        }
    }

    /// Action id of any non-idle state
    pub fn action_id(&self) -> Option<&str> {
        match self {
            DeploymentState::Idle => None,
            DeploymentState::Downloading { action_id }
            | DeploymentState::Installing { action_id }
            | DeploymentState::AwaitingCompletion { action_id }
            | DeploymentState::Deferred { action_id } => Some(action_id),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, DeploymentState::Idle)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// A deployment link was picked up
    DownloadStarted { action_id: String },
    /// Artifact downloaded and checksum verified
    DownloadVerified,
    /// Download failed terminally
    DownloadFailed,
    /// Local installer accepted the install request
    InstallTriggered,
    /// Install lock held by someone else
    InstallDeferred,
    /// Local installer refused the install request
    InstallFailed,
    /// Local installer reported completion
    Completed,
    /// Poll iteration failed, state is discarded
    Reset,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(DeploymentState),
    /// Transition was invalid from current state
    Invalid {
        from: DeploymentState,
        event: DeploymentEvent,
    },
}

/// Holder of the deployment state enforcing the transition table
#[derive(Debug, Default)]
pub struct DeploymentTracker {
    current_state: DeploymentState,
}

impl DeploymentTracker {
    /// Create a new tracker in Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> &DeploymentState {
        &self.current_state
    }

    pub fn active_action(&self) -> Option<&str> {
        self.current_state.active_action()
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: DeploymentEvent) -> TransitionResult {
        match self.next_state(&event) {
            Some(state) => {
                self.current_state = state.clone();
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state.clone(),
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn next_state(&self, event: &DeploymentEvent) -> Option<DeploymentState> {
        use DeploymentEvent::*;
        use DeploymentState::*;

        match (&self.current_state, event) {
            // Discarding state is always allowed
            (_, Reset) => Some(Idle),

            (Idle, DownloadStarted { action_id }) => Some(Downloading {
                action_id: action_id.clone(),
            }),

            (Downloading { action_id }, DownloadVerified) => Some(Installing {
                action_id: action_id.clone(),
            }),
            (Downloading { .. }, DownloadFailed) => Some(Idle),

            (Installing { action_id }, InstallTriggered) => Some(AwaitingCompletion {
                action_id: action_id.clone(),
            }),
            (Installing { action_id }, InstallDeferred) => Some(Deferred {
                action_id: action_id.clone(),
            }),
            (Installing { .. }, InstallFailed) => Some(Idle),

            // Completion may overtake the trigger's return
            (Installing { .. } | AwaitingCompletion { .. } | Deferred { .. }, Completed) => {
                Some(Idle)
            }

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(tracker: &mut DeploymentTracker, id: &str) {
        let result = tracker.process_event(DeploymentEvent::DownloadStarted {
            action_id: id.into(),
        });
        assert!(matches!(result, TransitionResult::Success(DeploymentState::Downloading { .. })));
    }

    #[test]
    fn test_initial_state() {
        let tracker = DeploymentTracker::new();
        assert_eq!(tracker.state(), &DeploymentState::Idle);
        assert!(tracker.active_action().is_none());
    }

    #[test]
    fn test_normal_deployment_flow() {
        let mut tracker = DeploymentTracker::new();
        started(&mut tracker, "3");
        assert!(tracker.active_action().is_none());
        assert_eq!(tracker.state().action_id(), Some("3"));

        tracker.process_event(DeploymentEvent::DownloadVerified);
        assert_eq!(tracker.active_action(), Some("3"));

        tracker.process_event(DeploymentEvent::InstallTriggered);
        assert_eq!(
            tracker.state(),
            &DeploymentState::AwaitingCompletion { action_id: "3".into() }
        );

        let result = tracker.process_event(DeploymentEvent::Completed);
        assert_eq!(result, TransitionResult::Success(DeploymentState::Idle));
    }

    #[test]
    fn test_completion_before_trigger_returns() {
        let mut tracker = DeploymentTracker::new();
        started(&mut tracker, "3");
        tracker.process_event(DeploymentEvent::DownloadVerified);

        tracker.process_event(DeploymentEvent::Completed);
        assert!(tracker.state().is_idle());

        // Late trigger return must not resurrect the action
        let result = tracker.process_event(DeploymentEvent::InstallTriggered);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert!(tracker.state().is_idle());
    }

    #[test]
    fn test_second_deployment_rejected() {
        let mut tracker = DeploymentTracker::new();
        started(&mut tracker, "3");

        let result = tracker.process_event(DeploymentEvent::DownloadStarted {
            action_id: "4".into(),
        });
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(tracker.state().action_id(), Some("3"));
    }

    #[test]
    fn test_deferred_install_keeps_action() {
        let mut tracker = DeploymentTracker::new();
        started(&mut tracker, "3");
        tracker.process_event(DeploymentEvent::DownloadVerified);

        tracker.process_event(DeploymentEvent::InstallDeferred);
        assert_eq!(
            tracker.state(),
            &DeploymentState::Deferred { action_id: "3".into() }
        );
        assert_eq!(tracker.active_action(), Some("3"));

        let result = tracker.process_event(DeploymentEvent::DownloadStarted {
            action_id: "3".into(),
        });
        assert!(matches!(result, TransitionResult::Invalid { .. }));

        tracker.process_event(DeploymentEvent::Completed);
        assert!(tracker.state().is_idle());
    }

    #[test]
    fn test_completed_while_idle_is_invalid() {
        let mut tracker = DeploymentTracker::new();
        let result = tracker.process_event(DeploymentEvent::Completed);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }

    #[test]
    fn test_reset_from_any_state() {
        let mut tracker = DeploymentTracker::new();
        started(&mut tracker, "3");
        tracker.process_event(DeploymentEvent::DownloadVerified);
        tracker.process_event(DeploymentEvent::InstallTriggered);

        tracker.process_event(DeploymentEvent::Reset);
        assert!(tracker.state().is_idle());
    }
}
