//! Pluggable storage for orchestration state.
//!
//! The [`Store`] trait defines the persistence collaborator for runs,
//! concurrency limits, leases, and scheduler high-water marks.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: state transitions use compare-and-swap on the
//!   run's version to prevent races between concurrent proposers
//! - **Linearizable counters**: slot acquire/release are atomic
//!   conditional updates, never in-process locks, because multiple
//!   engine instances may run concurrently
//! - **Testability**: the in-memory implementation backs tests and
//!   development; production deployments implement the trait over
//!   their database

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cadence_core::{DeploymentId, LimitId, RunId};

use crate::error::Result;
use crate::limiter::{ConcurrencyLimit, Lease, LimitScope};
use crate::run::Run;
use crate::state::StateType;

/// Result of a compare-and-swap commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The commit was applied.
    Success,
    /// The run does not exist.
    NotFound,
    /// The stored version no longer matches (concurrent modification).
    VersionConflict {
        /// The version that was actually stored.
        actual: u64,
    },
}

impl CasResult {
    /// Returns true if the commit was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of an atomic slot acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotAcquireResult {
    /// A slot was granted.
    Acquired(Lease),
    /// The run already holds a lease on this limit; leases are keyed
    /// `(limit_id, run_id)` so a run cannot double-acquire.
    AlreadyHeld(Lease),
    /// No capacity remains.
    Exhausted {
        /// Leases currently held.
        active: u32,
        /// The limit's slot count.
        limit: u32,
    },
    /// The limit does not exist.
    NotFound,
}

impl SlotAcquireResult {
    /// Returns true if the run holds a slot after this call.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        matches!(self, Self::Acquired(_) | Self::AlreadyHeld(_))
    }
}

/// Storage abstraction for orchestration state.
///
/// ## CAS Semantics
///
/// `cas_update_run` is the core primitive for correctness under
/// optimistic concurrency: the write applies only if the stored
/// version still matches the version the proposer loaded, so exactly
/// one of any set of racing writers wins.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from
/// multiple coordinator tasks and engine instances.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Run operations ---

    /// Gets a run by ID, including its current version.
    ///
    /// Returns `None` if the run does not exist.
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// Inserts a new run, deduplicating on its idempotency key.
    ///
    /// Returns `true` if the run was inserted, `false` if a run with
    /// the same idempotency key (or ID) already exists. Runs without
    /// an idempotency key deduplicate on ID only.
    async fn insert_run(&self, run: &Run) -> Result<bool>;

    /// Atomically replaces a run's record if its stored version still
    /// equals `expected_version`.
    ///
    /// The caller supplies the fully updated record with
    /// `run.version == expected_version + 1`.
    async fn cas_update_run(&self, expected_version: u64, run: &Run) -> Result<CasResult>;

    /// Counts a deployment's runs currently in the given state.
    ///
    /// Used by the scheduler to cap outstanding `SCHEDULED` runs.
    async fn count_runs_in_state(
        &self,
        deployment_id: &DeploymentId,
        state: StateType,
    ) -> Result<usize>;

    // --- Concurrency limit operations ---

    /// Creates or replaces a concurrency limit definition.
    ///
    /// Replacing a limit preserves its active lease count.
    async fn upsert_limit(&self, limit: &ConcurrencyLimit) -> Result<()>;

    /// Finds the limit matching a scope, if configured.
    async fn find_limit(&self, scope: &LimitScope) -> Result<Option<ConcurrencyLimit>>;

    /// Atomically grants a slot on a limit if capacity exists.
    ///
    /// The capacity check and the lease insert happen in one
    /// linearizable step; `active_lease_count <= slot_count` holds at
    /// every point in time, even under concurrent acquire attempts.
    async fn try_acquire_slot(
        &self,
        limit_id: &LimitId,
        run_id: &RunId,
        expires_at: DateTime<Utc>,
    ) -> Result<SlotAcquireResult>;

    /// Releases a slot. Idempotent: returns `false` if no lease was
    /// held, without error.
    async fn release_slot(&self, limit_id: &LimitId, run_id: &RunId) -> Result<bool>;

    /// Extends a held lease's expiry. Returns `false` if no lease is
    /// held.
    async fn renew_lease(
        &self,
        limit_id: &LimitId,
        run_id: &RunId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Returns all leases currently held by a run.
    async fn leases_for_run(&self, run_id: &RunId) -> Result<Vec<Lease>>;

    /// Returns all leases past their expiry as of `now`.
    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>>;

    // --- Scheduler state ---

    /// Gets the last-materialized timestamp for a deployment.
    async fn high_water_mark(&self, deployment_id: &DeploymentId)
        -> Result<Option<DateTime<Utc>>>;

    /// Durably records the last-materialized timestamp for a
    /// deployment so scheduling is idempotent across restarts.
    async fn set_high_water_mark(
        &self,
        deployment_id: &DeploymentId,
        mark: DateTime<Utc>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_success() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(!CasResult::VersionConflict { actual: 7 }.is_success());
    }

    #[test]
    fn slot_acquire_result_is_held() {
        let lease = Lease {
            limit_id: LimitId::generate(),
            run_id: RunId::generate(),
            acquired_at: Utc::now(),
            expires_at: Utc::now(),
        };
        assert!(SlotAcquireResult::Acquired(lease.clone()).is_held());
        assert!(SlotAcquireResult::AlreadyHeld(lease).is_held());
        assert!(!SlotAcquireResult::Exhausted { active: 1, limit: 1 }.is_held());
        assert!(!SlotAcquireResult::NotFound.is_held());
    }
}
