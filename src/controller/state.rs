//! Lifecycle state machine for PgCluster resources.
//!
//! Transitions are explicit: state only moves forward through
//! Created -> Processed -> Initialized, with re-entry between
//! Initialized and Restoring and between Initialized and Shutdown.
//! Reconcile handlers consult the table before patching status so a
//! re-delivered or out-of-order event can never skip a predecessor.

use std::fmt;

use crate::crd::ClusterState;

/// Events that drive cluster state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// Spec validated and the provisioning task emitted
    ProvisioningQueued,
    /// The primary deployment reports ready
    PrimaryReady,
    /// A restore task for this cluster was accepted
    RestoreRequested,
    /// spec.shutdown became true
    ShutdownRequested,
    /// spec.shutdown reverted to false
    ShutdownCleared,
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::ProvisioningQueued => write!(f, "ProvisioningQueued"),
            ClusterEvent::PrimaryReady => write!(f, "PrimaryReady"),
            ClusterEvent::RestoreRequested => write!(f, "RestoreRequested"),
            ClusterEvent::ShutdownRequested => write!(f, "ShutdownRequested"),
            ClusterEvent::ShutdownCleared => write!(f, "ShutdownCleared"),
        }
    }
}

/// One row of the transition table
#[derive(Debug)]
struct Transition {
    from: ClusterState,
    to: ClusterState,
    event: ClusterEvent,
    description: &'static str,
}

impl Transition {
    const fn new(
        from: ClusterState,
        to: ClusterState,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition is valid; callers patch status to `to`
    Success {
        from: ClusterState,
        to: ClusterState,
        description: &'static str,
    },
    /// No such transition from the current state
    Invalid {
        current: ClusterState,
        event: ClusterEvent,
    },
}

/// Transition table over the cluster lifecycle
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    pub fn new() -> Self {
        Self {
            transitions: vec![
                Transition::new(
                    ClusterState::Created,
                    ClusterState::Processed,
                    ClusterEvent::ProvisioningQueued,
                    "provisioning task queued",
                ),
                Transition::new(
                    ClusterState::Processed,
                    ClusterState::Initialized,
                    ClusterEvent::PrimaryReady,
                    "primary ready, cluster initialized",
                ),
                Transition::new(
                    ClusterState::Initialized,
                    ClusterState::Restoring,
                    ClusterEvent::RestoreRequested,
                    "restore in progress",
                ),
                Transition::new(
                    ClusterState::Restoring,
                    ClusterState::Initialized,
                    ClusterEvent::PrimaryReady,
                    "restored primary ready",
                ),
                Transition::new(
                    ClusterState::Initialized,
                    ClusterState::Shutdown,
                    ClusterEvent::ShutdownRequested,
                    "primary scaled to zero",
                ),
                Transition::new(
                    ClusterState::Shutdown,
                    ClusterState::Initialized,
                    ClusterEvent::ShutdownCleared,
                    "primary scaled back up",
                ),
            ],
        }
    }

    /// Attempt a transition from `current` on `event`.
    pub fn transition(&self, current: ClusterState, event: ClusterEvent) -> TransitionResult {
        match self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        {
            Some(t) => TransitionResult::Success {
                from: t.from,
                to: t.to,
                description: t.description,
            },
            None => TransitionResult::Invalid { current, event },
        }
    }

    /// Check whether `event` is legal from `from`, without consuming it.
    pub fn can_transition(&self, from: ClusterState, event: ClusterEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(result: TransitionResult) -> ClusterState {
        match result {
            TransitionResult::Success { to, .. } => to,
            TransitionResult::Invalid { current, event } => {
                panic!("expected valid transition, got {current} on {event}")
            }
        }
    }

    #[test]
    fn test_forward_path() {
        let sm = ClusterStateMachine::new();

        let s = target(sm.transition(ClusterState::Created, ClusterEvent::ProvisioningQueued));
        assert_eq!(s, ClusterState::Processed);

        let s = target(sm.transition(s, ClusterEvent::PrimaryReady));
        assert_eq!(s, ClusterState::Initialized);
    }

    #[test]
    fn test_no_transition_skips_a_predecessor() {
        let sm = ClusterStateMachine::new();

        // Created cannot jump straight to Initialized
        assert!(matches!(
            sm.transition(ClusterState::Created, ClusterEvent::PrimaryReady),
            TransitionResult::Invalid { .. }
        ));

        // Created cannot be shut down or restored before provisioning
        assert!(!sm.can_transition(ClusterState::Created, ClusterEvent::ShutdownRequested));
        assert!(!sm.can_transition(ClusterState::Created, ClusterEvent::RestoreRequested));
        assert!(!sm.can_transition(ClusterState::Processed, ClusterEvent::RestoreRequested));
    }

    #[test]
    fn test_restore_reentry() {
        let sm = ClusterStateMachine::new();

        let s = target(sm.transition(ClusterState::Initialized, ClusterEvent::RestoreRequested));
        assert_eq!(s, ClusterState::Restoring);

        let s = target(sm.transition(s, ClusterEvent::PrimaryReady));
        assert_eq!(s, ClusterState::Initialized);
    }

    #[test]
    fn test_shutdown_reentry() {
        let sm = ClusterStateMachine::new();

        let s = target(sm.transition(ClusterState::Initialized, ClusterEvent::ShutdownRequested));
        assert_eq!(s, ClusterState::Shutdown);

        // The only way out of Shutdown is clearing the flag
        assert!(!sm.can_transition(ClusterState::Shutdown, ClusterEvent::RestoreRequested));
        assert!(!sm.can_transition(ClusterState::Shutdown, ClusterEvent::PrimaryReady));

        let s = target(sm.transition(s, ClusterEvent::ShutdownCleared));
        assert_eq!(s, ClusterState::Initialized);
    }

    #[test]
    fn test_no_backward_transitions() {
        let sm = ClusterStateMachine::new();
        assert!(!sm.can_transition(ClusterState::Initialized, ClusterEvent::ProvisioningQueued));
        assert!(!sm.can_transition(ClusterState::Processed, ClusterEvent::ProvisioningQueued));
    }

    #[test]
    fn test_redelivered_event_is_invalid_not_reapplied() {
        let sm = ClusterStateMachine::new();

        // A duplicate PrimaryReady after reaching Initialized does not
        // produce a second transition.
        assert!(matches!(
            sm.transition(ClusterState::Initialized, ClusterEvent::PrimaryReady),
            TransitionResult::Invalid { .. }
        ));
    }
}
