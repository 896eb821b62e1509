//! Orchestration rule pipeline.
//!
//! A rule is a self-contained policy that observes a proposed
//! transition and returns one of four decisions: accept the proposal,
//! reject it, rewrite it to a different state, or defer it. Rules
//! execute in a fixed, documented order so effects compose
//! deterministically; new policies are added by appending to the
//! ordered collection, never by subclassing existing ones.
//!
//! ## Compensation discipline
//!
//! Rules that perform side effects (lease acquisition) push an undo
//! action onto the context's compensation stack. If a later rule
//! rejects or defers, or the final commit loses its version race, the
//! stack is popped and executed in reverse order - one pipeline run is
//! all-or-nothing.

pub mod rules;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::limiter::ConcurrencyLimiter;
use crate::run::Run;
use crate::state::{State, StateType};

/// A deferred undo action for a rule side effect.
pub type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// What a rule decided about the proposal it observed.
#[derive(Debug)]
pub enum RuleDecision {
    /// The proposed state stands unchanged.
    Accept,
    /// The transition does not happen; current state is retained.
    Reject {
        /// Why the transition was refused.
        reason: String,
    },
    /// The proposed state is replaced; later rules see the rewrite.
    Rewrite {
        /// The state the rule computed.
        state: State,
    },
    /// Not yet - retry later. A normal outcome, not an error.
    Defer {
        /// Why the transition cannot proceed right now.
        reason: String,
        /// Suggested backoff before re-proposing.
        retry_after: std::time::Duration,
    },
}

/// Mutable evaluation state threaded through one pipeline run.
///
/// `run` is a working copy: rules may update bookkeeping fields
/// (`run_count`, scheduling metadata) that the coordinator commits
/// together with the final state. Nothing touches the store until the
/// coordinator's CAS commit.
pub struct TransitionContext {
    /// Working copy of the run; `run.state` is the true current state.
    pub run: Run,
    /// The parent flow run, preloaded for task runs.
    pub parent: Option<Run>,
    /// The proposal under evaluation; rewrites replace it.
    pub proposed: State,
    compensations: Vec<Compensation>,
}

impl TransitionContext {
    /// Creates a context for one transition evaluation.
    #[must_use]
    pub fn new(run: Run, parent: Option<Run>, proposed: State) -> Self {
        Self {
            run,
            parent,
            proposed,
            compensations: Vec::new(),
        }
    }

    /// The run's true current state type.
    #[must_use]
    pub const fn current_type(&self) -> StateType {
        self.run.state.state_type
    }

    /// The proposal's state type.
    #[must_use]
    pub const fn proposed_type(&self) -> StateType {
        self.proposed.state_type
    }

    /// Registers an undo action for a side effect this rule performed.
    pub fn push_compensation(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    /// Pops and executes all registered compensations in reverse
    /// order. Failures are logged and do not stop the remaining
    /// compensations.
    pub async fn compensate(&mut self) {
        while let Some(compensation) = self.compensations.pop() {
            if let Err(error) = compensation().await {
                tracing::warn!(run_id = %self.run.id, %error, "compensation failed");
            }
        }
    }

    /// Hands remaining compensations to the coordinator, which must
    /// execute them if the final commit fails.
    #[must_use]
    pub fn take_compensations(&mut self) -> Vec<Compensation> {
        std::mem::take(&mut self.compensations)
    }
}

impl std::fmt::Debug for TransitionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionContext")
            .field("run_id", &self.run.id)
            .field("current", &self.run.state.state_type)
            .field("proposed", &self.proposed.state_type)
            .field("compensations", &self.compensations.len())
            .finish()
    }
}

/// A single orchestration policy.
///
/// Rules are independent and composable; each observes
/// `(run, current_state, proposed_state)` through the context and
/// must not assume anything about rules that run after it.
#[async_trait::async_trait]
pub trait TransitionRule: Send + Sync {
    /// Stable rule name, used in rejection reasons and logs.
    fn name(&self) -> &'static str;

    /// Evaluates the proposal, possibly mutating context bookkeeping
    /// or registering compensations.
    async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision>;
}

/// Terminal result of one pipeline run.
#[derive(Debug)]
pub enum PipelineVerdict {
    /// Every rule accepted (possibly after rewrites);
    /// `ctx.proposed` is the state to commit.
    Proceed,
    /// A rule rejected; compensations have executed.
    Rejected {
        /// The terminating rule.
        rule: &'static str,
        /// Why the transition was refused.
        reason: String,
    },
    /// A rule deferred; compensations have executed.
    Deferred {
        /// Why the transition cannot proceed right now.
        reason: String,
        /// Suggested backoff before re-proposing.
        retry_after: std::time::Duration,
    },
}

/// The ordered rule chain arbitrating every proposed transition.
pub struct RulePipeline {
    rules: Vec<Box<dyn TransitionRule>>,
}

impl RulePipeline {
    /// Builds the standard pipeline in its fixed documented order:
    ///
    /// 1. [`rules::LegalityRule`] - graph membership
    /// 2. [`rules::PauseRule`] - paused run / paused parent gate
    /// 3. [`rules::ParentStateRule`] - task runs need a running parent
    /// 4. [`rules::LatenessRule`] - late scheduled starts get flagged
    /// 5. [`rules::RetryRule`] - failures within budget become retries
    /// 6. [`rules::ConcurrencyRule`] - slot leases for entry into RUNNING
    /// 7. [`rules::RunCountRule`] - run-count bookkeeping
    #[must_use]
    pub fn standard(limiter: ConcurrencyLimiter) -> Self {
        Self {
            rules: vec![
                Box::new(rules::LegalityRule),
                Box::new(rules::PauseRule),
                Box::new(rules::ParentStateRule),
                Box::new(rules::LatenessRule::default()),
                Box::new(rules::RetryRule),
                Box::new(rules::ConcurrencyRule::new(limiter)),
                Box::new(rules::RunCountRule),
            ],
        }
    }

    /// Builds a pipeline from an explicit ordered rule collection.
    #[must_use]
    pub fn with_rules(rules: Vec<Box<dyn TransitionRule>>) -> Self {
        Self { rules }
    }

    /// Appends a rule after the existing chain.
    pub fn push(&mut self, rule: Box<dyn TransitionRule>) {
        self.rules.push(rule);
    }

    /// Evaluates the proposal against every rule in order.
    ///
    /// Rules within one pipeline run execute strictly in sequence; no
    /// rule observes a partially-applied effect from a later rule. On
    /// `Reject` or `Defer` all registered compensations execute before
    /// the verdict is returned.
    ///
    /// # Errors
    ///
    /// Propagates rule defects and storage failures; compensations
    /// execute before the error surfaces, so no partial lease
    /// acquisition outlives a failed pipeline run.
    pub async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<PipelineVerdict> {
        for rule in &self.rules {
            let decision = match rule.evaluate(ctx).await {
                Ok(decision) => decision,
                Err(error) => {
                    ctx.compensate().await;
                    return Err(error);
                }
            };

            match decision {
                RuleDecision::Accept => {}
                RuleDecision::Rewrite { state } => {
                    tracing::debug!(
                        run_id = %ctx.run.id,
                        rule = rule.name(),
                        from = %ctx.proposed.state_type,
                        to = %state.state_type,
                        "proposal rewritten"
                    );
                    ctx.proposed = state;
                }
                RuleDecision::Reject { reason } => {
                    ctx.compensate().await;
                    return Ok(PipelineVerdict::Rejected {
                        rule: rule.name(),
                        reason,
                    });
                }
                RuleDecision::Defer {
                    reason,
                    retry_after,
                } => {
                    ctx.compensate().await;
                    return Ok(PipelineVerdict::Deferred {
                        reason,
                        retry_after,
                    });
                }
            }
        }

        Ok(PipelineVerdict::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct AcceptAll;

    #[async_trait::async_trait]
    impl TransitionRule for AcceptAll {
        fn name(&self) -> &'static str {
            "accept-all"
        }

        async fn evaluate(&self, _ctx: &mut TransitionContext) -> Result<RuleDecision> {
            Ok(RuleDecision::Accept)
        }
    }

    struct RejectAll;

    #[async_trait::async_trait]
    impl TransitionRule for RejectAll {
        fn name(&self) -> &'static str {
            "reject-all"
        }

        async fn evaluate(&self, _ctx: &mut TransitionContext) -> Result<RuleDecision> {
            Ok(RuleDecision::Reject {
                reason: "always".into(),
            })
        }
    }

    /// Pushes a compensation that increments a counter when executed.
    struct SideEffect {
        undone: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TransitionRule for SideEffect {
        fn name(&self) -> &'static str {
            "side-effect"
        }

        async fn evaluate(&self, ctx: &mut TransitionContext) -> Result<RuleDecision> {
            let undone = self.undone.clone();
            ctx.push_compensation(Box::new(move || {
                Box::pin(async move {
                    undone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }));
            Ok(RuleDecision::Accept)
        }
    }

    fn pending_to_running_ctx() -> TransitionContext {
        let run = Run::pending_flow();
        TransitionContext::new(run, None, State::new(StateType::Running))
    }

    #[tokio::test]
    async fn all_accepts_proceed() -> Result<()> {
        let pipeline = RulePipeline::with_rules(vec![Box::new(AcceptAll), Box::new(AcceptAll)]);
        let mut ctx = pending_to_running_ctx();
        let verdict = pipeline.evaluate(&mut ctx).await?;
        assert!(matches!(verdict, PipelineVerdict::Proceed));
        Ok(())
    }

    #[tokio::test]
    async fn rejection_names_the_terminating_rule() -> Result<()> {
        let pipeline = RulePipeline::with_rules(vec![Box::new(AcceptAll), Box::new(RejectAll)]);
        let mut ctx = pending_to_running_ctx();
        let verdict = pipeline.evaluate(&mut ctx).await?;
        let PipelineVerdict::Rejected { rule, reason } = verdict else {
            panic!("expected rejected");
        };
        assert_eq!(rule, "reject-all");
        assert_eq!(reason, "always");
        Ok(())
    }

    #[tokio::test]
    async fn rejection_unwinds_earlier_side_effects() -> Result<()> {
        let undone = Arc::new(AtomicUsize::new(0));
        let pipeline = RulePipeline::with_rules(vec![
            Box::new(SideEffect {
                undone: undone.clone(),
            }),
            Box::new(SideEffect {
                undone: undone.clone(),
            }),
            Box::new(RejectAll),
        ]);
        let mut ctx = pending_to_running_ctx();
        let verdict = pipeline.evaluate(&mut ctx).await?;
        assert!(matches!(verdict, PipelineVerdict::Rejected { .. }));
        assert_eq!(undone.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn proceed_leaves_compensations_for_the_coordinator() -> Result<()> {
        let undone = Arc::new(AtomicUsize::new(0));
        let pipeline = RulePipeline::with_rules(vec![Box::new(SideEffect {
            undone: undone.clone(),
        })]);
        let mut ctx = pending_to_running_ctx();
        let verdict = pipeline.evaluate(&mut ctx).await?;
        assert!(matches!(verdict, PipelineVerdict::Proceed));
        assert_eq!(undone.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.take_compensations().len(), 1);
        Ok(())
    }
}
