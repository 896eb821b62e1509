//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory
//! implementation of the [`Store`] trait suitable for testing and
//! development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability, no cross-process
//!   coordination
//! - **Single-process only**: state is not shared across process
//!   boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cadence_core::{DeploymentId, LimitId, RunId};

use super::{CasResult, SlotAcquireResult, Store};
use crate::error::{Error, Result};
use crate::limiter::{ConcurrencyLimit, Lease, LimitScope};
use crate::run::Run;
use crate::state::StateType;

/// Runs plus the idempotency-key index, guarded together so inserts
/// are atomic with respect to deduplication.
#[derive(Debug, Default)]
struct RunTable {
    runs: HashMap<RunId, Run>,
    by_idempotency_key: HashMap<String, RunId>,
}

/// Limits plus their leases, guarded together so the capacity check
/// and the lease insert are one linearizable step.
#[derive(Debug, Default)]
struct LimitTable {
    limits: HashMap<LimitId, ConcurrencyLimit>,
    leases: HashMap<(LimitId, RunId), Lease>,
}

/// In-memory store for testing.
///
/// Provides a simple, thread-safe implementation of the [`Store`]
/// trait using `RwLock` for synchronization.
///
/// ## Example
///
/// ```rust
/// use cadence_engine::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    runs: RwLock<RunTable>,
    limits: RwLock<LimitTable>,
    high_water_marks: RwLock<HashMap<DeploymentId, DateTime<Utc>>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_count(&self) -> Result<usize> {
        let table = self.runs.read().map_err(poison_err)?;
        Ok(table.runs.len())
    }

    /// Returns the number of leases currently held across all limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn lease_count(&self) -> Result<usize> {
        let table = self.limits.read().map_err(poison_err)?;
        Ok(table.leases.len())
    }

    /// Returns the runs recorded under an idempotency key (zero or
    /// one).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn runs_with_idempotency_key(&self, key: &str) -> Result<Vec<Run>> {
        let table = self.runs.read().map_err(poison_err)?;
        Ok(table
            .by_idempotency_key
            .get(key)
            .and_then(|id| table.runs.get(id).cloned())
            .into_iter()
            .collect())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let result = {
            let table = self.runs.read().map_err(poison_err)?;
            table.runs.get(run_id).cloned()
        };
        Ok(result)
    }

    async fn insert_run(&self, run: &Run) -> Result<bool> {
        let mut table = self.runs.write().map_err(poison_err)?;

        if table.runs.contains_key(&run.id) {
            drop(table);
            return Ok(false);
        }
        if let Some(key) = &run.idempotency_key {
            if table.by_idempotency_key.contains_key(key) {
                drop(table);
                return Ok(false);
            }
            table.by_idempotency_key.insert(key.clone(), run.id);
        }
        table.runs.insert(run.id, run.clone());
        drop(table);
        Ok(true)
    }

    async fn cas_update_run(&self, expected_version: u64, run: &Run) -> Result<CasResult> {
        let mut table = self.runs.write().map_err(poison_err)?;

        let Some(stored) = table.runs.get_mut(&run.id) else {
            drop(table);
            return Ok(CasResult::NotFound);
        };

        if stored.version != expected_version {
            let actual = stored.version;
            drop(table);
            return Ok(CasResult::VersionConflict { actual });
        }

        *stored = run.clone();
        drop(table);
        Ok(CasResult::Success)
    }

    async fn count_runs_in_state(
        &self,
        deployment_id: &DeploymentId,
        state: StateType,
    ) -> Result<usize> {
        let count = {
            let table = self.runs.read().map_err(poison_err)?;
            table
                .runs
                .values()
                .filter(|r| r.deployment_id.as_ref() == Some(deployment_id))
                .filter(|r| r.state_type() == state)
                .count()
        };
        Ok(count)
    }

    async fn upsert_limit(&self, limit: &ConcurrencyLimit) -> Result<()> {
        let mut table = self.limits.write().map_err(poison_err)?;

        let active = table
            .limits
            .get(&limit.id)
            .map_or(0, |existing| existing.active_lease_count);
        let mut stored = limit.clone();
        stored.active_lease_count = active;
        table.limits.insert(stored.id, stored);
        drop(table);
        Ok(())
    }

    async fn find_limit(&self, scope: &LimitScope) -> Result<Option<ConcurrencyLimit>> {
        let result = {
            let table = self.limits.read().map_err(poison_err)?;
            table.limits.values().find(|l| &l.scope == scope).cloned()
        };
        Ok(result)
    }

    async fn try_acquire_slot(
        &self,
        limit_id: &LimitId,
        run_id: &RunId,
        expires_at: DateTime<Utc>,
    ) -> Result<SlotAcquireResult> {
        let mut table = self.limits.write().map_err(poison_err)?;

        if let Some(existing) = table.leases.get(&(*limit_id, *run_id)) {
            let lease = existing.clone();
            drop(table);
            return Ok(SlotAcquireResult::AlreadyHeld(lease));
        }

        let Some(limit) = table.limits.get_mut(limit_id) else {
            drop(table);
            return Ok(SlotAcquireResult::NotFound);
        };

        if limit.active_lease_count >= limit.slot_count {
            let result = SlotAcquireResult::Exhausted {
                active: limit.active_lease_count,
                limit: limit.slot_count,
            };
            drop(table);
            return Ok(result);
        }

        limit.active_lease_count = limit.active_lease_count.saturating_add(1);
        let lease = Lease {
            limit_id: *limit_id,
            run_id: *run_id,
            acquired_at: Utc::now(),
            expires_at,
        };
        table.leases.insert((*limit_id, *run_id), lease.clone());
        drop(table);
        Ok(SlotAcquireResult::Acquired(lease))
    }

    async fn release_slot(&self, limit_id: &LimitId, run_id: &RunId) -> Result<bool> {
        let mut table = self.limits.write().map_err(poison_err)?;

        if table.leases.remove(&(*limit_id, *run_id)).is_none() {
            drop(table);
            return Ok(false);
        }
        if let Some(limit) = table.limits.get_mut(limit_id) {
            limit.active_lease_count = limit.active_lease_count.saturating_sub(1);
        }
        drop(table);
        Ok(true)
    }

    async fn renew_lease(
        &self,
        limit_id: &LimitId,
        run_id: &RunId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut table = self.limits.write().map_err(poison_err)?;

        let renewed = if let Some(lease) = table.leases.get_mut(&(*limit_id, *run_id)) {
            lease.expires_at = expires_at;
            true
        } else {
            false
        };
        drop(table);
        Ok(renewed)
    }

    async fn leases_for_run(&self, run_id: &RunId) -> Result<Vec<Lease>> {
        let result = {
            let table = self.limits.read().map_err(poison_err)?;
            table
                .leases
                .values()
                .filter(|l| &l.run_id == run_id)
                .cloned()
                .collect()
        };
        Ok(result)
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let result = {
            let table = self.limits.read().map_err(poison_err)?;
            table
                .leases
                .values()
                .filter(|l| l.expires_at <= now)
                .cloned()
                .collect()
        };
        Ok(result)
    }

    async fn high_water_mark(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Option<DateTime<Utc>>> {
        let result = {
            let marks = self.high_water_marks.read().map_err(poison_err)?;
            marks.get(deployment_id).copied()
        };
        Ok(result)
    }

    async fn set_high_water_mark(
        &self,
        deployment_id: &DeploymentId,
        mark: DateTime<Utc>,
    ) -> Result<()> {
        let mut marks = self.high_water_marks.write().map_err(poison_err)?;
        marks.insert(*deployment_id, mark);
        drop(marks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{State, StateType};
    use std::sync::Arc;

    #[tokio::test]
    async fn insert_and_get_run() -> Result<()> {
        let store = InMemoryStore::new();
        let run = Run::pending_flow();

        assert!(store.insert_run(&run).await?);
        let loaded = store.get_run(&run.id).await?.expect("run exists");
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.version, 0);
        Ok(())
    }

    #[tokio::test]
    async fn insert_deduplicates_on_idempotency_key() -> Result<()> {
        let store = InMemoryStore::new();
        let deployment = DeploymentId::generate();
        let at = Utc::now();

        let first = Run::scheduled_flow(deployment, at, "sched:d:100");
        let second = Run::scheduled_flow(deployment, at, "sched:d:100");

        assert!(store.insert_run(&first).await?);
        assert!(!store.insert_run(&second).await?);
        assert_eq!(store.run_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn cas_update_succeeds_only_on_matching_version() -> Result<()> {
        let store = InMemoryStore::new();
        let mut run = Run::pending_flow();
        store.insert_run(&run).await?;

        run.state = State::new(StateType::Running);
        run.version = 1;
        assert!(store.cas_update_run(0, &run).await?.is_success());

        // A second writer still holding version 0 loses.
        let mut racer = run.clone();
        racer.state = State::new(StateType::Paused);
        racer.version = 1;
        let result = store.cas_update_run(0, &racer).await?;
        assert_eq!(result, CasResult::VersionConflict { actual: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn cas_update_missing_run_is_not_found() -> Result<()> {
        let store = InMemoryStore::new();
        let run = Run::pending_flow();
        assert_eq!(store.cas_update_run(0, &run).await?, CasResult::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn acquire_respects_slot_count_under_concurrency() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let limit = ConcurrencyLimit::new(LimitScope::Tag("db".into()), 3);
        store.upsert_limit(&limit).await?;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let limit_id = limit.id;
            handles.push(tokio::spawn(async move {
                let run_id = RunId::generate();
                let expires = Utc::now() + chrono::Duration::seconds(60);
                store.try_acquire_slot(&limit_id, &run_id, expires).await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            let result = handle.await.map_err(|e| Error::storage(e.to_string()))??;
            if matches!(result, SlotAcquireResult::Acquired(_)) {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);

        let stored = store
            .find_limit(&LimitScope::Tag("db".into()))
            .await?
            .expect("limit exists");
        assert!(stored.active_lease_count <= stored.slot_count);
        assert_eq!(stored.active_lease_count, 3);
        Ok(())
    }

    #[tokio::test]
    async fn release_is_idempotent_and_decrements_once() -> Result<()> {
        let store = InMemoryStore::new();
        let limit = ConcurrencyLimit::new(LimitScope::Tag("db".into()), 1);
        store.upsert_limit(&limit).await?;

        let run_id = RunId::generate();
        let expires = Utc::now() + chrono::Duration::seconds(60);
        store.try_acquire_slot(&limit.id, &run_id, expires).await?;

        assert!(store.release_slot(&limit.id, &run_id).await?);
        assert!(!store.release_slot(&limit.id, &run_id).await?);

        let stored = store
            .find_limit(&LimitScope::Tag("db".into()))
            .await?
            .expect("limit exists");
        assert_eq!(stored.active_lease_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn upsert_limit_preserves_active_count() -> Result<()> {
        let store = InMemoryStore::new();
        let mut limit = ConcurrencyLimit::new(LimitScope::Tag("db".into()), 2);
        store.upsert_limit(&limit).await?;

        let run_id = RunId::generate();
        let expires = Utc::now() + chrono::Duration::seconds(60);
        store.try_acquire_slot(&limit.id, &run_id, expires).await?;

        // Operator raises the slot count; the held lease survives.
        limit.slot_count = 5;
        store.upsert_limit(&limit).await?;

        let stored = store
            .find_limit(&LimitScope::Tag("db".into()))
            .await?
            .expect("limit exists");
        assert_eq!(stored.slot_count, 5);
        assert_eq!(stored.active_lease_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn expired_leases_filters_by_deadline() -> Result<()> {
        let store = InMemoryStore::new();
        let limit = ConcurrencyLimit::new(LimitScope::Tag("db".into()), 2);
        store.upsert_limit(&limit).await?;

        let now = Utc::now();
        let stale = RunId::generate();
        let fresh = RunId::generate();
        store
            .try_acquire_slot(&limit.id, &stale, now - chrono::Duration::seconds(10))
            .await?;
        store
            .try_acquire_slot(&limit.id, &fresh, now + chrono::Duration::seconds(60))
            .await?;

        let expired = store.expired_leases(now).await?;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].run_id, stale);
        Ok(())
    }

    #[tokio::test]
    async fn high_water_mark_round_trips() -> Result<()> {
        let store = InMemoryStore::new();
        let deployment = DeploymentId::generate();

        assert!(store.high_water_mark(&deployment).await?.is_none());
        let mark = Utc::now();
        store.set_high_water_mark(&deployment, mark).await?;
        assert_eq!(store.high_water_mark(&deployment).await?, Some(mark));
        Ok(())
    }

    #[tokio::test]
    async fn counts_runs_by_deployment_and_state() -> Result<()> {
        let store = InMemoryStore::new();
        let deployment = DeploymentId::generate();
        let other = DeploymentId::generate();
        let at = Utc::now();

        store
            .insert_run(&Run::scheduled_flow(deployment, at, "sched:a:1"))
            .await?;
        store
            .insert_run(&Run::scheduled_flow(deployment, at, "sched:a:2"))
            .await?;
        store
            .insert_run(&Run::scheduled_flow(other, at, "sched:b:1"))
            .await?;

        assert_eq!(
            store
                .count_runs_in_state(&deployment, StateType::Scheduled)
                .await?,
            2
        );
        assert_eq!(
            store
                .count_runs_in_state(&deployment, StateType::Running)
                .await?,
            0
        );
        Ok(())
    }
}
