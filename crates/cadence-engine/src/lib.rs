//! # cadence-engine
//!
//! Run orchestration engine for the Cadence workflow backend.
//!
//! This crate implements the orchestration domain, providing:
//!
//! - **State Machine**: The canonical run state model with a static
//!   legal-transition graph and terminal sinks
//! - **Rule Pipeline**: An ordered set of transition rules that accept,
//!   reject, rewrite, or defer every proposed state change
//! - **Concurrency Limiter**: Leased execution slots scoped by tag or
//!   work pool, with all-or-nothing acquisition and crash-safe expiry
//! - **Scheduler**: Recurrence evaluation (interval, cron-in-timezone,
//!   explicit sets) that materializes future runs idempotently
//!
//! ## Core Concepts
//!
//! - **Run**: A tracked execution (flow run or task run) carrying a
//!   monotonic version incremented once per committed transition
//! - **Proposal**: Clients never write states directly; they propose a
//!   transition and the engine is the authority on the outcome
//! - **Lease**: A held execution slot, keyed `(limit_id, run_id)`,
//!   renewed by heartbeat and reclaimed after expiry
//!
//! ## Guarantees
//!
//! - **Legality**: Committed histories only ever contain transitions
//!   the legal graph (plus the contextual rules) permits
//! - **Optimistic concurrency**: Racing writers are serialized by a
//!   version check; one commits, the rest get a conflict to resolve by
//!   reloading
//! - **Capacity**: `active_lease_count` never exceeds `slot_count`,
//!   enforced by the store's atomic conditional increment
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cadence_engine::coordinator::TransitionCoordinator;
//! use cadence_engine::error::Result;
//! use cadence_engine::run::Run;
//! use cadence_engine::state::{State, StateType};
//! use cadence_engine::store::memory::InMemoryStore;
//!
//! # async fn demo() -> Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let coordinator = TransitionCoordinator::new(store);
//!
//! let run = Run::pending_flow();
//! coordinator.create_run(&run).await?;
//!
//! let outcome = coordinator
//!     .propose_transition(&run.id, State::new(StateType::Running), Some(0))
//!     .await?;
//! assert!(outcome.is_committed());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod run;
pub mod scheduler;
pub mod state;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::coordinator::{TransitionCoordinator, TransitionOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::limiter::{
        AcquireOutcome, ConcurrencyLimit, ConcurrencyLimiter, Lease, LimitScope,
    };
    pub use crate::policy::{
        RuleDecision, RulePipeline, TransitionContext, TransitionRule,
    };
    pub use crate::run::{Run, RunKind};
    pub use crate::scheduler::{
        DeploymentSchedule, RecurrenceRule, Scheduler, SchedulerPassSummary,
    };
    pub use crate::state::{State, StateDetails, StateType};
    pub use crate::store::{memory::InMemoryStore, CasResult, SlotAcquireResult, Store};
}
