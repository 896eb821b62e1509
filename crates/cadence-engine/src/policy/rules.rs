//! The standard orchestration rules.
//!
//! Each rule is one policy; the fixed order lives in
//! [`super::RulePipeline::standard`]. Rules return decisions, never
//! touch the store directly, and register compensations for any side
//! effect they perform through a collaborator.

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::error::Result;
use crate::limiter::{AcquireOutcome, ConcurrencyLimiter};
use crate::policy::{RuleDecision, TransitionContext, TransitionRule};
use crate::state::{State, StateType};

/// Rejects any transition absent from the legal-transition graph.
///
/// This is the context-free gate; staleness of the *proposal* itself
/// (a caller acting on an outdated read) is enforced upstream by the
/// coordinator's version check, so by the time a rule runs, the
/// context's current state is the run's true current state.
pub struct LegalityRule;

#[async_trait]
impl TransitionRule for LegalityRule {
    fn name(&self) -> &'static str {
        "legality"
    }

    async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision> {
        let from = ctx.current_type();
        let to = ctx.proposed_type();
        if from.can_transition_to(to) {
            Ok(RuleDecision::Accept)
        } else {
            let qualifier = if from.is_terminal() {
                " (terminal states are sinks)"
            } else {
                ""
            };
            Ok(RuleDecision::Reject {
                reason: format!("transition {from} -> {to} is not legal{qualifier}"),
            })
        }
    }
}

/// Blocks a task run's entry into `RUNNING` while its parent flow run
/// is `PAUSED`.
///
/// A direct `PAUSED -> PENDING` or `PAUSED -> RUNNING` proposal on the
/// paused run itself *is* the explicit resume signal and passes
/// through untouched.
pub struct PauseRule;

#[async_trait]
impl TransitionRule for PauseRule {
    fn name(&self) -> &'static str {
        "pause"
    }

    async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision> {
        if ctx.proposed_type() != StateType::Running {
            return Ok(RuleDecision::Accept);
        }
        if let Some(parent) = &ctx.parent {
            if parent.state_type() == StateType::Paused {
                return Ok(RuleDecision::Reject {
                    reason: format!("parent flow run {} is paused", parent.id),
                });
            }
        }
        Ok(RuleDecision::Accept)
    }
}

/// Task runs may enter `RUNNING` only while their parent flow run is
/// itself `RUNNING`.
pub struct ParentStateRule;

#[async_trait]
impl TransitionRule for ParentStateRule {
    fn name(&self) -> &'static str {
        "parent-state"
    }

    async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision> {
        if ctx.proposed_type() != StateType::Running || ctx.run.parent_run_id.is_none() {
            return Ok(RuleDecision::Accept);
        }
        match &ctx.parent {
            Some(parent) if parent.state_type() == StateType::Running => {
                Ok(RuleDecision::Accept)
            }
            Some(parent) => Ok(RuleDecision::Reject {
                reason: format!(
                    "parent flow run {} is {}, not RUNNING",
                    parent.id,
                    parent.state_type()
                ),
            }),
            None => Ok(RuleDecision::Reject {
                reason: "parent flow run not found".into(),
            }),
        }
    }
}

/// Flags late starts instead of silently allowing or blocking them.
///
/// A `SCHEDULED -> PENDING` transition arriving past the run's
/// expected start time (plus a small margin) is rewritten to a
/// `PENDING` state named "Late", preserving the transition while
/// making the slippage visible to operators and automations.
pub struct LatenessRule {
    margin: Duration,
}

impl LatenessRule {
    /// Seconds of slippage tolerated before a start counts as late.
    pub const DEFAULT_MARGIN_SECONDS: i64 = 10;

    /// Creates a lateness rule with a custom margin.
    #[must_use]
    pub fn with_margin(margin: Duration) -> Self {
        Self { margin }
    }
}

impl Default for LatenessRule {
    fn default() -> Self {
        Self {
            margin: Duration::seconds(Self::DEFAULT_MARGIN_SECONDS),
        }
    }
}

#[async_trait]
impl TransitionRule for LatenessRule {
    fn name(&self) -> &'static str {
        "lateness"
    }

    async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision> {
        if ctx.current_type() != StateType::Scheduled
            || ctx.proposed_type() != StateType::Pending
        {
            return Ok(RuleDecision::Accept);
        }
        let expected = ctx
            .run
            .expected_start_time
            .or(ctx.run.state.details.scheduled_time);
        let Some(expected) = expected else {
            return Ok(RuleDecision::Accept);
        };

        if Utc::now() > expected + self.margin {
            let state = ctx
                .proposed
                .clone()
                .with_name("Late")
                .with_message(format!("run started late; expected start was {expected}"));
            return Ok(RuleDecision::Rewrite { state });
        }
        Ok(RuleDecision::Accept)
    }
}

/// Converts in-budget failures into retries.
///
/// On `RUNNING -> FAILED` with retry budget remaining, the target is
/// rewritten to a `RETRYING` state named "AwaitingRetry" and marked
/// retriable; the coordinator immediately follows the committed
/// retry with an engine-proposed `PENDING`. Beyond budget, `FAILED`
/// stands.
pub struct RetryRule;

#[async_trait]
impl TransitionRule for RetryRule {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision> {
        if ctx.current_type() != StateType::Running
            || ctx.proposed_type() != StateType::Failed
            || !ctx.run.retry_budget_remaining()
        {
            return Ok(RuleDecision::Accept);
        }

        let mut state = State::new(StateType::Retrying).with_name("AwaitingRetry");
        state.message = ctx.proposed.message.clone();
        state.details.retriable = Some(true);
        ctx.run.next_scheduled_start_time = Some(Utc::now());
        Ok(RuleDecision::Rewrite { state })
    }
}

/// Leases execution slots for entry into `RUNNING`.
///
/// On denial the transition is deferred - the run stays `PENDING` and
/// the caller re-proposes later - rather than rejected, so capacity
/// exhaustion is never an error. Successful acquisition registers a
/// compensation releasing the leases this attempt newly acquired,
/// covering rejection by a later rule and a lost commit race alike;
/// the rollback leaves the slot in place when a racing proposal for
/// the same run has committed `RUNNING` in the meantime.
///
/// Releasing leases on entry into a terminal state (or any other exit
/// from `RUNNING`) is the coordinator's post-commit duty: releasing
/// here would be unrecoverable if a later rule rejected the
/// transition.
pub struct ConcurrencyRule {
    limiter: ConcurrencyLimiter,
}

impl ConcurrencyRule {
    /// Backoff suggested to deferred callers.
    pub const RETRY_AFTER: std::time::Duration = std::time::Duration::from_secs(30);

    /// Creates the rule over a limiter.
    #[must_use]
    pub fn new(limiter: ConcurrencyLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl TransitionRule for ConcurrencyRule {
    fn name(&self) -> &'static str {
        "concurrency"
    }

    async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision> {
        if ctx.proposed_type() != StateType::Running
            || ctx.current_type() == StateType::Running
        {
            return Ok(RuleDecision::Accept);
        }

        match self.limiter.acquire_all(&ctx.run).await? {
            AcquireOutcome::Granted(leases) => {
                if !leases.is_empty() {
                    let limiter = self.limiter.clone();
                    let run_id = ctx.run.id;
                    ctx.push_compensation(Box::new(move || {
                        Box::pin(async move {
                            limiter.release_attempt(&run_id, &leases).await?;
                            Ok(())
                        })
                    }));
                }
                Ok(RuleDecision::Accept)
            }
            AcquireOutcome::Denied {
                scope,
                active,
                limit,
            } => Ok(RuleDecision::Defer {
                reason: format!(
                    "concurrency limit {scope} exhausted ({active}/{limit} slots leased)"
                ),
                retry_after: Self::RETRY_AFTER,
            }),
        }
    }
}

/// Bookkeeping on entry into `RUNNING`: increments `run_count` and
/// clears the pending reschedule marker.
pub struct RunCountRule;

#[async_trait]
impl TransitionRule for RunCountRule {
    fn name(&self) -> &'static str {
        "run-count"
    }

    async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision> {
        if ctx.proposed_type() == StateType::Running && ctx.current_type() != StateType::Running
        {
            ctx.run.run_count = ctx.run.run_count.saturating_add(1);
            ctx.run.next_scheduled_start_time = None;
        }
        Ok(RuleDecision::Accept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{ConcurrencyLimit, LimitScope};
    use crate::run::Run;
    use crate::store::memory::InMemoryStore;
    use crate::store::Store;
    use cadence_core::RunId;
    use std::sync::Arc;

    fn ctx(run: Run, proposed: StateType) -> TransitionContext {
        TransitionContext::new(run, None, State::new(proposed))
    }

    fn ctx_with_parent(run: Run, parent: Run, proposed: StateType) -> TransitionContext {
        TransitionContext::new(run, Some(parent), State::new(proposed))
    }

    fn run_in_state(state: StateType) -> Run {
        let mut run = Run::pending_flow();
        run.state = State::new(state);
        run
    }

    #[tokio::test]
    async fn legality_rejects_terminal_exits() -> Result<()> {
        let mut ctx = ctx(run_in_state(StateType::Completed), StateType::Running);
        let decision = LegalityRule.evaluate(&mut ctx).await?;
        let RuleDecision::Reject { reason } = decision else {
            panic!("expected reject");
        };
        assert!(reason.contains("terminal states are sinks"));
        Ok(())
    }

    #[tokio::test]
    async fn legality_accepts_graph_edges() -> Result<()> {
        let mut ctx = ctx(run_in_state(StateType::Pending), StateType::Running);
        assert!(matches!(
            LegalityRule.evaluate(&mut ctx).await?,
            RuleDecision::Accept
        ));
        Ok(())
    }

    #[tokio::test]
    async fn pause_blocks_task_start_under_paused_parent() -> Result<()> {
        let parent = run_in_state(StateType::Paused);
        let task = Run::pending_task(parent.id);
        let mut ctx = ctx_with_parent(task, parent, StateType::Running);
        assert!(matches!(
            PauseRule.evaluate(&mut ctx).await?,
            RuleDecision::Reject { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn resume_of_the_paused_run_itself_passes_pause_rule() -> Result<()> {
        let mut ctx = ctx(run_in_state(StateType::Paused), StateType::Running);
        assert!(matches!(
            PauseRule.evaluate(&mut ctx).await?,
            RuleDecision::Accept
        ));
        Ok(())
    }

    #[tokio::test]
    async fn parent_state_requires_running_parent() -> Result<()> {
        let parent = run_in_state(StateType::Pending);
        let task = Run::pending_task(parent.id);
        let mut ctx = ctx_with_parent(task, parent, StateType::Running);
        let RuleDecision::Reject { reason } = ParentStateRule.evaluate(&mut ctx).await? else {
            panic!("expected reject");
        };
        assert!(reason.contains("not RUNNING"));
        Ok(())
    }

    #[tokio::test]
    async fn parent_state_rejects_missing_parent() -> Result<()> {
        let task = Run::pending_task(RunId::generate());
        let mut ctx = ctx(task, StateType::Running);
        assert!(matches!(
            ParentStateRule.evaluate(&mut ctx).await?,
            RuleDecision::Reject { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn parent_state_ignores_flow_runs() -> Result<()> {
        let mut ctx = ctx(run_in_state(StateType::Pending), StateType::Running);
        assert!(matches!(
            ParentStateRule.evaluate(&mut ctx).await?,
            RuleDecision::Accept
        ));
        Ok(())
    }

    #[tokio::test]
    async fn lateness_flags_overdue_starts() -> Result<()> {
        let mut run = run_in_state(StateType::Scheduled);
        run.expected_start_time = Some(Utc::now() - Duration::minutes(5));
        let mut ctx = ctx(run, StateType::Pending);

        let RuleDecision::Rewrite { state } = LatenessRule::default().evaluate(&mut ctx).await?
        else {
            panic!("expected rewrite");
        };
        assert_eq!(state.state_type, StateType::Pending);
        assert_eq!(state.name, "Late");
        Ok(())
    }

    #[tokio::test]
    async fn lateness_leaves_punctual_starts_alone() -> Result<()> {
        let mut run = run_in_state(StateType::Scheduled);
        run.expected_start_time = Some(Utc::now() + Duration::minutes(5));
        let mut ctx = ctx(run, StateType::Pending);
        assert!(matches!(
            LatenessRule::default().evaluate(&mut ctx).await?,
            RuleDecision::Accept
        ));
        Ok(())
    }

    #[tokio::test]
    async fn retry_rewrites_in_budget_failures() -> Result<()> {
        let mut run = run_in_state(StateType::Running).with_retry_limit(3);
        run.run_count = 1;
        let mut ctx = ctx(run, StateType::Failed);

        let RuleDecision::Rewrite { state } = RetryRule.evaluate(&mut ctx).await? else {
            panic!("expected rewrite");
        };
        assert_eq!(state.state_type, StateType::Retrying);
        assert_eq!(state.name, "AwaitingRetry");
        assert_eq!(state.details.retriable, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn retry_lets_over_budget_failures_stand() -> Result<()> {
        let mut run = run_in_state(StateType::Running).with_retry_limit(1);
        run.run_count = 2;
        let mut ctx = ctx(run, StateType::Failed);
        assert!(matches!(
            RetryRule.evaluate(&mut ctx).await?,
            RuleDecision::Accept
        ));
        Ok(())
    }

    #[tokio::test]
    async fn concurrency_defers_on_exhaustion() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_limit(&ConcurrencyLimit::new(LimitScope::Tag("db".into()), 1))
            .await?;
        let limiter = ConcurrencyLimiter::new(store);
        let rule = ConcurrencyRule::new(limiter.clone());

        let first = run_in_state(StateType::Pending).with_tag("db");
        let mut first_ctx = ctx(first, StateType::Running);
        assert!(matches!(
            rule.evaluate(&mut first_ctx).await?,
            RuleDecision::Accept
        ));

        let second = run_in_state(StateType::Pending).with_tag("db");
        let mut second_ctx = ctx(second, StateType::Running);
        let RuleDecision::Defer { reason, .. } = rule.evaluate(&mut second_ctx).await? else {
            panic!("expected defer");
        };
        assert!(reason.contains("tag:db"));
        Ok(())
    }

    #[tokio::test]
    async fn concurrency_compensation_releases_leases() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_limit(&ConcurrencyLimit::new(LimitScope::Tag("db".into()), 1))
            .await?;
        let limiter = ConcurrencyLimiter::new(store.clone());
        let rule = ConcurrencyRule::new(limiter);

        let run = run_in_state(StateType::Pending).with_tag("db");
        let mut running_ctx = ctx(run, StateType::Running);
        rule.evaluate(&mut running_ctx).await?;
        assert_eq!(store.lease_count()?, 1);

        running_ctx.compensate().await;
        assert_eq!(store.lease_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn losing_attempt_keeps_the_winners_lease() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_limit(&ConcurrencyLimit::new(LimitScope::Tag("db".into()), 1))
            .await?;
        let limiter = ConcurrencyLimiter::new(store.clone());
        let rule = ConcurrencyRule::new(limiter);

        let run = Run::pending_flow().with_tag("db");
        store.insert_run(&run).await?;

        // One proposal acquires the slot but will lose the commit race.
        let mut loser_ctx = ctx(run.clone(), StateType::Running);
        rule.evaluate(&mut loser_ctx).await?;
        assert_eq!(store.lease_count()?, 1);

        // The racing proposal reuses the held lease and commits RUNNING.
        let mut winner = run.clone();
        winner.state = State::new(StateType::Running);
        winner.version = 1;
        assert!(store.cas_update_run(0, &winner).await?.is_success());

        // The loser's rollback must leave the committed run its slot.
        loser_ctx.compensate().await;
        assert_eq!(store.lease_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn run_count_increments_on_entry_into_running() -> Result<()> {
        let mut running_ctx = ctx(run_in_state(StateType::Pending), StateType::Running);
        RunCountRule.evaluate(&mut running_ctx).await?;
        assert_eq!(running_ctx.run.run_count, 1);

        let mut terminal_ctx = ctx(run_in_state(StateType::Running), StateType::Completed);
        RunCountRule.evaluate(&mut terminal_ctx).await?;
        assert_eq!(terminal_ctx.run.run_count, 0);
        Ok(())
    }
}
