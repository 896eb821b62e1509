//! Observability metrics for the orchestration engine.
//!
//! Metrics are exposed via the `metrics` crate facade and are designed
//! to support alerting on transition outcomes, limiter saturation, and
//! scheduler health.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `cadence_transitions_total` | Counter | `from_state`, `to_state` | Committed state transitions |
//! | `cadence_transition_outcomes_total` | Counter | `outcome` | Proposal outcomes (committed/rejected/deferred/conflict) |
//! | `cadence_leases_reclaimed_total` | Counter | - | Expired leases freed by reclamation |
//! | `cadence_scheduled_runs_total` | Counter | - | Runs materialized by the scheduler |
//! | `cadence_scheduler_pass_duration_seconds` | Histogram | - | Wall time of one scheduler pass |
//!
//! ## Integration
//!
//! Metrics flow to whatever recorder the host process installs; for
//! Prometheus:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: committed state transitions.
    pub const TRANSITIONS_TOTAL: &str = "cadence_transitions_total";
    /// Counter: proposal outcomes.
    pub const TRANSITION_OUTCOMES_TOTAL: &str = "cadence_transition_outcomes_total";
    /// Counter: expired leases freed by reclamation.
    pub const LEASES_RECLAIMED_TOTAL: &str = "cadence_leases_reclaimed_total";
    /// Counter: runs materialized by the scheduler.
    pub const SCHEDULED_RUNS_TOTAL: &str = "cadence_scheduled_runs_total";
    /// Histogram: wall time of one scheduler pass in seconds.
    pub const SCHEDULER_PASS_DURATION_SECONDS: &str = "cadence_scheduler_pass_duration_seconds";
}

/// Records a committed transition edge.
pub fn record_transition(from_state: &str, to_state: &str) {
    counter!(
        names::TRANSITIONS_TOTAL,
        "from_state" => from_state.to_string(),
        "to_state" => to_state.to_string(),
    )
    .increment(1);
}

/// Records a proposal outcome: `committed`, `rejected`, `deferred`, or
/// `version_conflict`.
pub fn record_outcome(outcome: &'static str) {
    counter!(names::TRANSITION_OUTCOMES_TOTAL, "outcome" => outcome).increment(1);
}

/// Records leases freed by a reclamation sweep.
pub fn record_leases_reclaimed(count: u64) {
    counter!(names::LEASES_RECLAIMED_TOTAL).increment(count);
}

/// Records runs materialized by a scheduler pass.
pub fn record_scheduled_runs(count: u64) {
    counter!(names::SCHEDULED_RUNS_TOTAL).increment(count);
}

/// Times one scheduler pass; records on drop.
#[derive(Debug)]
pub struct SchedulerPassTimer {
    started: Instant,
}

impl SchedulerPassTimer {
    /// Starts the timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SchedulerPassTimer {
    fn default() -> Self {
        Self::start()
    }
}

impl Drop for SchedulerPassTimer {
    fn drop(&mut self) {
        histogram!(names::SCHEDULER_PASS_DURATION_SECONDS)
            .record(self.started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_do_not_panic_without_a_recorder() {
        record_transition("PENDING", "RUNNING");
        record_outcome("committed");
        record_leases_reclaimed(2);
        record_scheduled_runs(3);
        let _timer = SchedulerPassTimer::start();
    }
}
