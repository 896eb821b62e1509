//! Scheduler: materializes future runs from recurrence definitions.
//!
//! Each pass evaluates every enabled deployment schedule against the
//! persisted high-water mark (the last timestamp already materialized)
//! and creates `SCHEDULED` runs up to a lookahead bounded by
//! `max_active_scheduled_runs`. Idempotency comes from two layers:
//!
//! - the lookahead cap counts runs still in `SCHEDULED`, so a repeat
//!   pass with no time elapsed computes a zero-sized window
//! - each run carries a deterministic idempotency key derived from
//!   `(deployment_id, timestamp)`, so a crash between insert and
//!   high-water-mark persistence never doubles a logical slot
//!
//! The scheduler only creates new runs; it never mutates existing
//! ones, so it is safe to run concurrently with itself and with
//! arbitrary coordinator activity.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use cadence_core::DeploymentId;

use crate::error::{Error, Result};
use crate::metrics;
use crate::run::Run;
use crate::state::StateType;
use crate::store::Store;

/// A specification producing an ordered sequence of future start
/// timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecurrenceRule {
    /// Fixed interval from an anchor instant. Arithmetic is on UTC
    /// instants, so interval schedules are immune to DST transitions.
    Interval {
        /// Gap between occurrences; must be positive.
        every: Duration,
        /// The instant the sequence is phased against.
        anchor: DateTime<Utc>,
    },
    /// Calendar expression evaluated in a timezone.
    ///
    /// DST resolution is deterministic: a local time that does not
    /// exist (spring-forward gap) is skipped to the next occurrence;
    /// an ambiguous local time (fall-back overlap) resolves to the
    /// earliest UTC instant.
    Cron {
        /// A cron expression (seconds granularity).
        expression: String,
        /// IANA timezone name, e.g. `America/New_York`.
        timezone: String,
    },
    /// An explicit finite set of timestamps, exhausted once all are
    /// materialized.
    Explicit(Vec<DateTime<Utc>>),
}

impl RecurrenceRule {
    /// Computes up to `count` occurrences strictly after `after`, in
    /// ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecurrence`] for malformed cron
    /// expressions, unknown timezones, or non-positive intervals.
    pub fn occurrences_after(
        &self,
        deployment_id: &DeploymentId,
        after: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        match self {
            Self::Interval { every, anchor } => {
                interval_occurrences(deployment_id, *every, *anchor, after, count)
            }
            Self::Cron {
                expression,
                timezone,
            } => cron_occurrences(deployment_id, expression, timezone, after, count),
            Self::Explicit(timestamps) => {
                let mut due: Vec<DateTime<Utc>> = timestamps
                    .iter()
                    .copied()
                    .filter(|ts| *ts > after)
                    .collect();
                due.sort_unstable();
                due.dedup();
                due.truncate(count);
                Ok(due)
            }
        }
    }
}

fn interval_occurrences(
    deployment_id: &DeploymentId,
    every: Duration,
    anchor: DateTime<Utc>,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let step_ms = every.num_milliseconds();
    if step_ms <= 0 {
        return Err(Error::InvalidRecurrence {
            deployment_id: deployment_id.to_string(),
            message: "interval must be positive".into(),
        });
    }

    // First occurrence strictly after `after`, phase-locked to the anchor.
    let mut next = if anchor > after {
        anchor
    } else {
        let elapsed_ms = (after - anchor).num_milliseconds();
        let periods = elapsed_ms / step_ms + 1;
        anchor + Duration::milliseconds(periods * step_ms)
    };

    let mut occurrences = Vec::with_capacity(count);
    while occurrences.len() < count {
        occurrences.push(next);
        next += every;
    }
    Ok(occurrences)
}

fn cron_occurrences(
    deployment_id: &DeploymentId,
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let schedule = Schedule::from_str(expression).map_err(|e| Error::InvalidRecurrence {
        deployment_id: deployment_id.to_string(),
        message: format!("invalid cron expression '{expression}': {e}"),
    })?;
    let tz: Tz = timezone.parse().map_err(|_| Error::InvalidRecurrence {
        deployment_id: deployment_id.to_string(),
        message: format!("invalid timezone: {timezone}"),
    })?;

    Ok(schedule
        .after(&after.with_timezone(&tz))
        .take(count)
        .map(|occurrence| occurrence.with_timezone(&Utc))
        .collect())
}

/// A deployment's recurrence configuration.
#[derive(Debug, Clone)]
pub struct DeploymentSchedule {
    /// The deployment runs are materialized for.
    pub deployment_id: DeploymentId,
    /// The recurrence definition.
    pub rule: RecurrenceRule,
    /// Ceiling on runs simultaneously waiting in `SCHEDULED`.
    pub max_active_scheduled_runs: usize,
    /// Disabled schedules are skipped without error.
    pub enabled: bool,
}

impl DeploymentSchedule {
    /// Creates an enabled schedule.
    #[must_use]
    pub fn new(
        deployment_id: DeploymentId,
        rule: RecurrenceRule,
        max_active_scheduled_runs: usize,
    ) -> Self {
        Self {
            deployment_id,
            rule,
            max_active_scheduled_runs,
            enabled: true,
        }
    }
}

/// Totals for one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerPassSummary {
    /// Runs inserted this pass (duplicates excluded).
    pub runs_created: usize,
    /// Runs skipped because their idempotency key already existed.
    pub duplicates_skipped: usize,
    /// Deployments whose evaluation failed and was isolated.
    pub deployments_failed: usize,
}

/// Materializes `SCHEDULED` runs for recurrence-bearing deployments.
pub struct Scheduler {
    store: Arc<dyn Store>,
}

impl Scheduler {
    /// Creates a scheduler over the store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Deterministic idempotency key for one logical schedule slot.
    ///
    /// Format: `sched:{deployment_id}:{epoch_seconds}`
    #[must_use]
    pub fn idempotency_key(deployment_id: &DeploymentId, at: DateTime<Utc>) -> String {
        format!("sched:{deployment_id}:{}", at.timestamp())
    }

    /// Runs one scheduling pass over the given schedules.
    ///
    /// A failure on one deployment (e.g. a malformed recurrence
    /// definition) is logged and isolated; remaining deployments still
    /// materialize.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure; per-deployment
    /// evaluation failures are absorbed into the summary.
    pub async fn run_pass(
        &self,
        schedules: &[DeploymentSchedule],
        now: DateTime<Utc>,
    ) -> Result<SchedulerPassSummary> {
        let _timer = metrics::SchedulerPassTimer::start();
        let mut summary = SchedulerPassSummary::default();

        for schedule in schedules {
            if !schedule.enabled {
                continue;
            }
            match self.materialize_deployment(schedule, now).await {
                Ok((created, skipped)) => {
                    summary.runs_created += created;
                    summary.duplicates_skipped += skipped;
                }
                Err(error) => {
                    summary.deployments_failed += 1;
                    tracing::error!(
                        deployment_id = %schedule.deployment_id,
                        %error,
                        "scheduling failed for deployment; continuing with others"
                    );
                }
            }
        }

        metrics::record_scheduled_runs(summary.runs_created as u64);
        Ok(summary)
    }

    #[tracing::instrument(skip(self, schedule), fields(deployment_id = %schedule.deployment_id))]
    async fn materialize_deployment(
        &self,
        schedule: &DeploymentSchedule,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let deployment_id = schedule.deployment_id;

        let outstanding = self
            .store
            .count_runs_in_state(&deployment_id, StateType::Scheduled)
            .await?;
        let window = schedule.max_active_scheduled_runs.saturating_sub(outstanding);
        if window == 0 {
            return Ok((0, 0));
        }

        let mark = self.store.high_water_mark(&deployment_id).await?;
        let floor = mark.map_or(now, |m| m.max(now));

        let occurrences = schedule
            .rule
            .occurrences_after(&deployment_id, floor, window)?;

        let mut created = 0;
        let mut skipped = 0;
        for at in &occurrences {
            let key = Self::idempotency_key(&deployment_id, *at);
            let run = Run::scheduled_flow(deployment_id, *at, key);
            if self.store.insert_run(&run).await? {
                created += 1;
            } else {
                skipped += 1;
            }
        }

        if let Some(last) = occurrences.last() {
            self.store.set_high_water_mark(&deployment_id, *last).await?;
            tracing::debug!(
                created,
                skipped,
                high_water_mark = %last,
                "materialized scheduled runs"
            );
        }
        Ok((created, skipped))
    }
}
