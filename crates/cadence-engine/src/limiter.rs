//! Concurrency limiter: named slot pools and time-bounded leases.
//!
//! A run may match **multiple** limits simultaneously - one per tag it
//! carries, plus its work-pool limit. Acquisition for a transition is
//! all-or-nothing: if any required limit denies, every lease newly
//! acquired by that attempt is released before Denied is reported, so
//! partial holds never block other runs indefinitely. Leases the run
//! already held before the attempt are never rolled back - they belong
//! to whichever concurrent attempt created them.
//!
//! ## Design Principles
//!
//! - **Leases, not locks**: slots are granted as time-bounded leases
//!   that workers must renew via heartbeat
//! - **Denied is not an error**: capacity exhaustion is a normal
//!   outcome the caller handles by deferring the transition
//! - **Reclamation**: expired leases are swept periodically so a
//!   crashed worker cannot leak capacity forever

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::{LimitId, RunId};

use crate::error::Result;
use crate::run::Run;
use crate::state::StateType;
use crate::store::{SlotAcquireResult, Store};

/// What a concurrency limit applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitScope {
    /// Matches every run carrying this tag.
    Tag(String),
    /// Matches every run assigned to this work pool.
    Pool(String),
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, "tag:{tag}"),
            Self::Pool(pool) => write!(f, "pool:{pool}"),
        }
    }
}

/// A named slot pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyLimit {
    /// Unique limit identifier.
    pub id: LimitId,
    /// What the limit applies to.
    pub scope: LimitScope,
    /// Total slots available.
    pub slot_count: u32,
    /// Slots currently leased; never exceeds `slot_count`.
    pub active_lease_count: u32,
}

impl ConcurrencyLimit {
    /// Creates a limit with no active leases.
    #[must_use]
    pub fn new(scope: LimitScope, slot_count: u32) -> Self {
        Self {
            id: LimitId::generate(),
            scope,
            slot_count,
            active_lease_count: 0,
        }
    }
}

/// A time-bounded grant of one concurrency slot to a run.
///
/// Keyed `(limit_id, run_id)`: a run cannot double-acquire the same
/// limit. Released explicitly on terminal-state commit, or reclaimed
/// after `expires_at` if the owning run never reaches a terminal
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// The limit the slot belongs to.
    pub limit_id: LimitId,
    /// The run holding the slot.
    pub run_id: RunId,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

/// Outcome of an all-or-nothing acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every matching limit holds a slot for the run. Carries only the
    /// leases this attempt newly acquired; leases the run already held
    /// count toward the grant but are not this attempt's to roll back.
    Granted(Vec<Lease>),
    /// At least one limit was at capacity; nothing is held.
    Denied {
        /// The scope that denied.
        scope: LimitScope,
        /// Leases held on that limit at denial time.
        active: u32,
        /// The limit's slot count.
        limit: u32,
    },
}

impl AcquireOutcome {
    /// Returns true if the slots were granted.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Grants and releases execution-slot leases against the store's
/// linearizable counters.
///
/// Unconfigured scopes are unlimited: a tag with no matching limit
/// never denies.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    store: Arc<dyn Store>,
    lease_ttl: Duration,
}

impl ConcurrencyLimiter {
    /// Default lease time-to-live between heartbeats.
    pub const DEFAULT_LEASE_TTL_SECONDS: i64 = 60;

    /// Creates a limiter with the default lease TTL.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lease_ttl: Duration::seconds(Self::DEFAULT_LEASE_TTL_SECONDS),
        }
    }

    /// Creates a limiter with a custom lease TTL.
    ///
    /// Use short TTLs to test reclamation.
    #[must_use]
    pub fn with_lease_ttl(store: Arc<dyn Store>, lease_ttl: Duration) -> Self {
        Self { store, lease_ttl }
    }

    /// Returns the scopes a run's transition into `RUNNING` must hold.
    #[must_use]
    pub fn matching_scopes(run: &Run) -> Vec<LimitScope> {
        let mut scopes: Vec<LimitScope> = run
            .tags
            .iter()
            .map(|tag| LimitScope::Tag(tag.clone()))
            .collect();
        if let Some(pool) = &run.work_pool {
            scopes.push(LimitScope::Pool(pool.clone()));
        }
        scopes
    }

    /// Attempts to acquire a slot on every limit matching the run.
    ///
    /// All-or-nothing: on any denial, slots newly acquired by this
    /// attempt are released before `Denied` is returned. Leases the
    /// run already held stay in place.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure; capacity exhaustion
    /// is the `Denied` outcome, not an error.
    pub async fn acquire_all(&self, run: &Run) -> Result<AcquireOutcome> {
        let now = Utc::now();
        let expires_at = now + self.lease_ttl;
        let mut acquired: Vec<Lease> = Vec::new();

        for scope in Self::matching_scopes(run) {
            let Some(limit) = self.store.find_limit(&scope).await? else {
                // Unconfigured scope: unlimited.
                continue;
            };

            match self
                .store
                .try_acquire_slot(&limit.id, &run.id, expires_at)
                .await?
            {
                SlotAcquireResult::Acquired(lease) => acquired.push(lease),
                SlotAcquireResult::AlreadyHeld(_) => {
                    // A concurrent or earlier attempt for this run
                    // holds the slot; it satisfies this scope but is
                    // not this attempt's to roll back.
                }
                SlotAcquireResult::Exhausted { active, limit: cap } => {
                    self.release_leases(&acquired).await?;
                    tracing::debug!(
                        run_id = %run.id,
                        scope = %scope,
                        active,
                        limit = cap,
                        "concurrency slot denied"
                    );
                    return Ok(AcquireOutcome::Denied {
                        scope,
                        active,
                        limit: cap,
                    });
                }
                SlotAcquireResult::NotFound => {
                    // Limit deleted between lookup and acquire; treat
                    // as unconfigured.
                }
            }
        }

        Ok(AcquireOutcome::Granted(acquired))
    }

    /// Rolls back the leases an attempt newly acquired after the
    /// attempt failed to commit.
    ///
    /// Concurrent proposals for the same run share `(limit_id,
    /// run_id)` leases, so a rollback must not assume the slot is
    /// still this attempt's: if the run has meanwhile committed into
    /// `RUNNING`, a racing proposal won the slot and keeps it. Returns
    /// the number of leases released.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    pub async fn release_attempt(&self, run_id: &RunId, leases: &[Lease]) -> Result<usize> {
        if let Some(run) = self.store.get_run(run_id).await? {
            if run.state_type() == StateType::Running {
                tracing::debug!(
                    run_id = %run_id,
                    "skipping lease rollback; run committed RUNNING"
                );
                return Ok(0);
            }
        }

        let mut released = 0;
        for lease in leases {
            if self.store.release_slot(&lease.limit_id, run_id).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Releases every lease held by a run. Idempotent.
    ///
    /// Returns the number of leases actually released.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    pub async fn release_all(&self, run_id: &RunId) -> Result<usize> {
        let leases = self.store.leases_for_run(run_id).await?;
        let mut released = 0;
        for lease in &leases {
            if self.store.release_slot(&lease.limit_id, run_id).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Extends the expiry of every lease a run holds (worker
    /// heartbeat). Returns the number of leases renewed.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    pub async fn renew(&self, run_id: &RunId) -> Result<usize> {
        let expires_at = Utc::now() + self.lease_ttl;
        let leases = self.store.leases_for_run(run_id).await?;
        let mut renewed = 0;
        for lease in &leases {
            if self
                .store
                .renew_lease(&lease.limit_id, run_id, expires_at)
                .await?
            {
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    /// Releases every lease past its expiry, logging each reclamation.
    ///
    /// Invoked periodically as the safety net against leaked capacity
    /// from crashed workers: a run that never reaches a terminal state
    /// stops renewing, its leases lapse, and the slots return to the
    /// pool.
    ///
    /// Expiry alone decides; the owning run's state is deliberately
    /// not consulted. Live holders renew via heartbeat, so an expired
    /// lease means its owner stopped participating - including a run
    /// that crashed while `RUNNING`, whose slot must not stay leaked.
    ///
    /// Returns the reclaimed leases.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let expired = self.store.expired_leases(now).await?;
        let mut reclaimed = Vec::with_capacity(expired.len());
        for lease in expired {
            if self.store.release_slot(&lease.limit_id, &lease.run_id).await? {
                tracing::warn!(
                    run_id = %lease.run_id,
                    limit_id = %lease.limit_id,
                    expired_at = %lease.expires_at,
                    "reclaimed expired concurrency lease"
                );
                reclaimed.push(lease);
            }
        }
        Ok(reclaimed)
    }

    async fn release_leases(&self, leases: &[Lease]) -> Result<()> {
        for lease in leases {
            self.store.release_slot(&lease.limit_id, &lease.run_id).await?;
        }
        Ok(())
    }
}
