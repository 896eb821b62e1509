//! Run state model.
//!
//! Defines the finite set of run states, the directed graph of legal
//! transitions, and the typed payload each state carries. The graph
//! here is the *context-free* layer: it answers "is this edge ever
//! legal". Context-dependent legality (parent state, retry budget,
//! concurrency capacity) is the rule pipeline's job -
//! see [`crate::policy`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::RunId;

/// Run state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    /// Materialized by the scheduler, awaiting its start time.
    Scheduled,
    /// Accepted for execution, not yet started.
    Pending,
    /// Actively executing.
    Running,
    /// Suspended pending an external resume signal.
    Paused,
    /// Cancellation requested, awaiting acknowledgement.
    Cancelling,
    /// Failed but eligible for automatic re-attempt.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Finished with an unrecoverable error.
    Failed,
    /// Execution environment vanished without reporting a terminal state.
    Crashed,
    /// Cancellation acknowledged.
    Cancelled,
}

impl StateType {
    /// Returns true if this is a terminal state.
    ///
    /// Terminal states are sinks: no outgoing transitions exist.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Crashed | Self::Cancelled
        )
    }

    /// Returns true if the transition from self to target is present
    /// in the legal-transition graph.
    ///
    /// This graph is not a total order: retry loops
    /// (`RUNNING -> RETRYING -> PENDING`) and early cancellation
    /// (`SCHEDULED -> CANCELLED`) are legal, while leaving a terminal
    /// state never is.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Scheduled => {
                matches!(target, Self::Pending | Self::Cancelling | Self::Cancelled)
            }
            Self::Pending => matches!(
                target,
                Self::Running
                    | Self::Paused
                    | Self::Cancelling
                    | Self::Cancelled
                    | Self::Crashed
                    | Self::Failed
            ),
            Self::Running => matches!(
                target,
                Self::Completed
                    | Self::Failed
                    | Self::Retrying
                    | Self::Paused
                    | Self::Cancelling
                    | Self::Crashed
            ),
            Self::Retrying => matches!(
                target,
                Self::Pending | Self::Cancelling | Self::Cancelled | Self::Failed
            ),
            Self::Paused => matches!(
                target,
                Self::Pending
                    | Self::Running
                    | Self::Cancelling
                    | Self::Cancelled
                    | Self::Crashed
            ),
            Self::Cancelling => matches!(target, Self::Cancelled | Self::Failed | Self::Crashed),
            Self::Completed | Self::Failed | Self::Crashed | Self::Cancelled => false,
        }
    }

    /// Default display name for a state of this type.
    #[must_use]
    pub const fn default_name(&self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Cancelling => "Cancelling",
            Self::Retrying => "Retrying",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Crashed => "Crashed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Cancelling => write!(f, "CANCELLING"),
            Self::Retrying => write!(f, "RETRYING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Crashed => write!(f, "CRASHED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Auxiliary payload carried by a state.
///
/// Fields are sparsely populated; which ones are meaningful depends on
/// the state type (e.g. `scheduled_time` on `SCHEDULED`, `retriable`
/// on `RETRYING`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDetails {
    /// When a scheduled run is expected to start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Whether a failure is eligible for automatic retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retriable: Option<bool>,
    /// Whether a paused run should be rescheduled on resume rather
    /// than resumed in place.
    #[serde(default)]
    pub pause_reschedule: bool,
    /// Identifier correlating the two halves of an engine-driven
    /// follow-up transition (e.g. RETRYING then PENDING).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_id: Option<RunId>,
}

/// An immutable snapshot of a run's lifecycle stage.
///
/// A run's history is the ordered sequence of committed states; only
/// the latest is mutable context, the rest is an append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    /// The canonical state type.
    #[serde(rename = "type")]
    pub state_type: StateType,
    /// Display name; defaults from the type but may carry flags such
    /// as "Late" or "AwaitingRetry".
    pub name: String,
    /// When this state was created.
    pub timestamp: DateTime<Utc>,
    /// Human-readable context for the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Typed auxiliary payload.
    #[serde(default)]
    pub details: StateDetails,
}

impl State {
    /// Creates a state of the given type with its default name.
    #[must_use]
    pub fn new(state_type: StateType) -> Self {
        Self {
            state_type,
            name: state_type.default_name().to_string(),
            timestamp: Utc::now(),
            message: None,
            details: StateDetails::default(),
        }
    }

    /// Creates a `SCHEDULED` state with its expected start time.
    #[must_use]
    pub fn scheduled(scheduled_time: DateTime<Utc>) -> Self {
        let mut state = Self::new(StateType::Scheduled);
        state.details.scheduled_time = Some(scheduled_time);
        state
    }

    /// Replaces the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attaches a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Replaces the details payload.
    #[must_use]
    pub fn with_details(mut self, details: StateDetails) -> Self {
        self.details = details;
        self
    }

    /// Returns true if this state is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state_type.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sinks() {
        let terminals = [
            StateType::Completed,
            StateType::Failed,
            StateType::Crashed,
            StateType::Cancelled,
        ];
        let all = [
            StateType::Scheduled,
            StateType::Pending,
            StateType::Running,
            StateType::Paused,
            StateType::Cancelling,
            StateType::Retrying,
            StateType::Completed,
            StateType::Failed,
            StateType::Crashed,
            StateType::Cancelled,
        ];
        for from in terminals {
            assert!(from.is_terminal());
            for to in all {
                assert!(
                    !from.can_transition_to(to),
                    "{from} -> {to} must be illegal"
                );
            }
        }
    }

    #[test]
    fn retry_loop_is_legal() {
        assert!(StateType::Running.can_transition_to(StateType::Retrying));
        assert!(StateType::Retrying.can_transition_to(StateType::Pending));
        assert!(StateType::Pending.can_transition_to(StateType::Running));
    }

    #[test]
    fn cancel_before_start_is_legal() {
        assert!(StateType::Scheduled.can_transition_to(StateType::Cancelled));
        assert!(StateType::Scheduled.can_transition_to(StateType::Cancelling));
    }

    #[test]
    fn completed_to_running_is_illegal() {
        assert!(!StateType::Completed.can_transition_to(StateType::Running));
    }

    #[test]
    fn scheduled_skips_straight_to_running_is_illegal() {
        assert!(!StateType::Scheduled.can_transition_to(StateType::Running));
    }

    #[test]
    fn state_defaults_name_from_type() {
        let state = State::new(StateType::Running);
        assert_eq!(state.name, "Running");
        assert_eq!(state.state_type, StateType::Running);
    }

    #[test]
    fn scheduled_constructor_sets_scheduled_time() {
        let at = Utc::now();
        let state = State::scheduled(at);
        assert_eq!(state.details.scheduled_time, Some(at));
    }

    #[test]
    fn name_can_carry_flags() {
        let state = State::new(StateType::Pending).with_name("Late");
        assert_eq!(state.state_type, StateType::Pending);
        assert_eq!(state.name, "Late");
    }

    #[test]
    fn serializes_type_in_screaming_snake_case() {
        let state = State::new(StateType::Cancelling);
        let json = serde_json::to_string(&state).expect("serialize");
        assert!(json.contains("\"CANCELLING\""));
    }
}
