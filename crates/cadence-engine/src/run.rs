//! Run records.
//!
//! A run is one execution attempt of a flow, or of a task nested
//! within a flow run. Runs are created in `SCHEDULED` (by the
//! scheduler) or `PENDING` (ad-hoc submission) and are mutated
//! exclusively through the transition coordinator; the `version`
//! field is the optimistic-concurrency token that serializes
//! concurrent writers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::{DeploymentId, RunId};

use crate::state::{State, StateType};

/// Whether a run is a flow run or a task run nested within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunKind {
    /// A top-level flow execution.
    FlowRun,
    /// A task execution nested within a flow run.
    TaskRun,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FlowRun => write!(f, "FLOW_RUN"),
            Self::TaskRun => write!(f, "TASK_RUN"),
        }
    }
}

/// One execution attempt of a flow or task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,
    /// Flow run or task run.
    pub kind: RunKind,
    /// The owning flow run, for task runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    /// The deployment this run belongs to, if scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,
    /// Current state of the run.
    pub state: State,
    /// Optimistic-concurrency token; increments exactly once per
    /// committed transition.
    pub version: u64,
    /// Tags used for concurrency-limit matching.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Work-pool scope used for pool-level concurrency limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_pool: Option<String>,
    /// Number of times the run has entered `RUNNING`.
    pub run_count: u32,
    /// Automatic retry budget; a run may re-enter `PENDING` after
    /// failure while `run_count <= retry_limit`.
    pub retry_limit: u32,
    /// When the run is expected to start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_start_time: Option<DateTime<Utc>>,
    /// The next scheduled start, for retry/reschedule bookkeeping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scheduled_start_time: Option<DateTime<Utc>>,
    /// Deterministic key deduplicating scheduler-materialized runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// When the run record was created.
    pub created_at: DateTime<Utc>,
    /// When the run record was last committed.
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Creates an ad-hoc flow run in `PENDING`.
    #[must_use]
    pub fn pending_flow() -> Self {
        Self::new(RunKind::FlowRun, State::new(StateType::Pending))
    }

    /// Creates a task run in `PENDING` nested under a flow run.
    #[must_use]
    pub fn pending_task(parent: RunId) -> Self {
        let mut run = Self::new(RunKind::TaskRun, State::new(StateType::Pending));
        run.parent_run_id = Some(parent);
        run
    }

    /// Creates a scheduler-materialized flow run in `SCHEDULED`.
    #[must_use]
    pub fn scheduled_flow(
        deployment_id: DeploymentId,
        expected_start_time: DateTime<Utc>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        let mut run = Self::new(RunKind::FlowRun, State::scheduled(expected_start_time));
        run.deployment_id = Some(deployment_id);
        run.expected_start_time = Some(expected_start_time);
        run.idempotency_key = Some(idempotency_key.into());
        run
    }

    fn new(kind: RunKind, state: State) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            kind,
            parent_run_id: None,
            deployment_id: None,
            state,
            version: 0,
            tags: BTreeSet::new(),
            work_pool: None,
            run_count: 0,
            retry_limit: 0,
            expected_start_time: None,
            next_scheduled_start_time: None,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Adds a concurrency tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Assigns the run to a work pool.
    #[must_use]
    pub fn with_work_pool(mut self, pool: impl Into<String>) -> Self {
        self.work_pool = Some(pool.into());
        self
    }

    /// Sets the automatic retry budget.
    #[must_use]
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Returns true if the run's current state is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns the current state type.
    #[must_use]
    pub const fn state_type(&self) -> StateType {
        self.state.state_type
    }

    /// Returns true if another failure is still within the retry
    /// budget, given that `run_count` counts entries into `RUNNING`.
    #[must_use]
    pub const fn retry_budget_remaining(&self) -> bool {
        self.run_count <= self.retry_limit
    }
}
