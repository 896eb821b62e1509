//! Transition coordinator.
//!
//! Drives one transition request end-to-end: load the run with its
//! version, execute the rule pipeline, commit atomically under an
//! optimistic-version check. Requests for different runs execute fully
//! in parallel; concurrent requests for the *same* run are serialized
//! only by the version check at commit time - the coordinator never
//! blocks a caller waiting for another transition, it fails fast with
//! a conflict the caller resolves by reloading.

use std::sync::Arc;

use cadence_core::RunId;

use crate::error::{Error, Result};
use crate::limiter::ConcurrencyLimiter;
use crate::metrics;
use crate::policy::{PipelineVerdict, RulePipeline, TransitionContext};
use crate::run::Run;
use crate::state::{State, StateType};
use crate::store::{CasResult, Store};

/// Outcome of a proposed transition.
///
/// Every expected case is a value; only storage failures and rule
/// defects surface as [`Error`].
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The transition (possibly rewritten) was committed.
    Committed {
        /// The state that was committed.
        state: State,
        /// The run's new version.
        version: u64,
    },
    /// A rule refused the transition; current state is retained.
    Rejected {
        /// The terminating rule.
        rule: &'static str,
        /// Why the transition was refused.
        reason: String,
    },
    /// Capacity is exhausted; re-propose later. Not an error.
    Deferred {
        /// Why the transition cannot proceed right now.
        reason: String,
        /// Suggested backoff before re-proposing.
        retry_after: std::time::Duration,
    },
    /// The run changed underneath the caller; reload and re-derive the
    /// proposal. Always recoverable, never a system fault.
    VersionConflict {
        /// The version actually stored.
        actual: u64,
    },
}

impl TransitionOutcome {
    /// Returns true if the transition was committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// Returns true if the caller should re-propose later.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}

/// Coordinates proposed transitions against the store.
pub struct TransitionCoordinator {
    store: Arc<dyn Store>,
    limiter: ConcurrencyLimiter,
    pipeline: RulePipeline,
}

impl TransitionCoordinator {
    /// Creates a coordinator with the standard rule pipeline.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        let limiter = ConcurrencyLimiter::new(store.clone());
        let pipeline = RulePipeline::standard(limiter.clone());
        Self {
            store,
            limiter,
            pipeline,
        }
    }

    /// Creates a coordinator with a custom pipeline and limiter.
    #[must_use]
    pub fn with_pipeline(
        store: Arc<dyn Store>,
        limiter: ConcurrencyLimiter,
        pipeline: RulePipeline,
    ) -> Self {
        Self {
            store,
            limiter,
            pipeline,
        }
    }

    /// Reads a run, for callers re-deriving a proposal after a
    /// conflict.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.store.get_run(run_id).await
    }

    /// Registers a new run so transitions can be proposed against it.
    ///
    /// Returns `false` if a run with the same ID or idempotency key
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn create_run(&self, run: &Run) -> Result<bool> {
        self.store.insert_run(run).await
    }

    /// Proposes a state transition for a run.
    ///
    /// If `expected_version` is supplied and mismatches the stored
    /// version, fails immediately with
    /// [`TransitionOutcome::VersionConflict`] - the caller reloads and
    /// re-derives its proposal from fresh state; the engine never
    /// retries on the caller's behalf.
    ///
    /// A committed retry (`RETRYING` marked retriable) is immediately
    /// followed by an engine-proposed `PENDING` using the version just
    /// committed; the returned outcome reflects the final commit.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a rule defect; in both
    /// cases nothing was committed and no lease acquisition survives.
    #[tracing::instrument(skip(self, proposed), fields(run_id = %run_id, to = %proposed.state_type))]
    pub async fn propose_transition(
        &self,
        run_id: &RunId,
        proposed: State,
        expected_version: Option<u64>,
    ) -> Result<TransitionOutcome> {
        let mut proposal = proposed;
        let mut expected = expected_version;

        // Engine-driven follow-ups (the retry loop) re-enter with the
        // freshly committed version; at most one follow-up per call.
        loop {
            let outcome = self.propose_once(run_id, proposal, expected).await?;

            let TransitionOutcome::Committed { state, version } = &outcome else {
                return Ok(outcome);
            };
            if state.state_type == StateType::Retrying
                && state.details.retriable == Some(true)
            {
                proposal = State::new(StateType::Pending)
                    .with_message("automatic retry re-queued".to_string());
                expected = Some(*version);
                continue;
            }
            return Ok(outcome);
        }
    }

    async fn propose_once(
        &self,
        run_id: &RunId,
        proposed: State,
        expected_version: Option<u64>,
    ) -> Result<TransitionOutcome> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Err(Error::RunNotFound { run_id: *run_id });
        };

        if let Some(expected) = expected_version {
            if expected != run.version {
                metrics::record_outcome("version_conflict");
                return Ok(TransitionOutcome::VersionConflict {
                    actual: run.version,
                });
            }
        }

        let parent = match run.parent_run_id {
            Some(parent_id) => self.store.get_run(&parent_id).await?,
            None => None,
        };

        let loaded_version = run.version;
        let was_running = run.state_type() == StateType::Running;
        let mut ctx = TransitionContext::new(run, parent, proposed);

        match self.pipeline.evaluate(&mut ctx).await? {
            PipelineVerdict::Rejected { rule, reason } => {
                metrics::record_outcome("rejected");
                tracing::info!(rule, reason, "transition rejected");
                Ok(TransitionOutcome::Rejected { rule, reason })
            }
            PipelineVerdict::Deferred {
                reason,
                retry_after,
            } => {
                metrics::record_outcome("deferred");
                tracing::info!(reason, "transition deferred");
                Ok(TransitionOutcome::Deferred {
                    reason,
                    retry_after,
                })
            }
            PipelineVerdict::Proceed => {
                self.commit(ctx, loaded_version, was_running).await
            }
        }
    }

    /// Commits the evaluated transition with a CAS on the loaded
    /// version, guarding against a second writer racing between load
    /// and commit.
    async fn commit(
        &self,
        mut ctx: TransitionContext,
        loaded_version: u64,
        was_running: bool,
    ) -> Result<TransitionOutcome> {
        let from = ctx.run.state.state_type;
        let mut updated = ctx.run.clone();
        updated.state = ctx.proposed.clone();
        updated.version = loaded_version + 1;
        updated.updated_at = chrono::Utc::now();

        match self.store.cas_update_run(loaded_version, &updated).await? {
            CasResult::Success => {
                // Commit stands; pending lease compensations are void.
                drop(ctx.take_compensations());

                let committed = updated.state.clone();
                let leaves_running =
                    was_running && committed.state_type != StateType::Running;
                if committed.is_terminal() || leaves_running {
                    // The commit already stands; a failed release must
                    // not be reported as a failed transition. Leases
                    // left behind lapse and the reclamation sweep
                    // frees them.
                    if let Err(error) = self.limiter.release_all(&updated.id).await {
                        tracing::error!(
                            run_id = %updated.id,
                            %error,
                            "failed to release leases after commit"
                        );
                    }
                }

                metrics::record_outcome("committed");
                metrics::record_transition(
                    from.default_name(),
                    committed.state_type.default_name(),
                );
                tracing::info!(
                    from = %from,
                    to = %committed.state_type,
                    version = updated.version,
                    "transition committed"
                );
                Ok(TransitionOutcome::Committed {
                    state: committed,
                    version: updated.version,
                })
            }
            CasResult::VersionConflict { actual } => {
                ctx.compensate().await;
                metrics::record_outcome("version_conflict");
                Ok(TransitionOutcome::VersionConflict { actual })
            }
            CasResult::NotFound => {
                ctx.compensate().await;
                Err(Error::RunNotFound { run_id: updated.id })
            }
        }
    }
}
