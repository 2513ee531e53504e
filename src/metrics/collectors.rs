//! Recording helpers used throughout the pipeline.
//!
//! Every helper is a no-op until [`super::init_metrics`] has run, so library
//! users and tests that never initialize metrics pay nothing.

use super::prometheus::metrics;

/// Records an opportunity state change (`created`, `scored`, `advanced`,
/// `validated` or `rejected`).
pub fn record_transition(kind: &str) {
    if let Some(m) = metrics() {
        m.transitions_total.with_label_values(&[kind]).inc();
    }
}

/// Records a stage visit deferred by backpressure.
pub fn record_backpressure(reason: &str, stage: &str) {
    if let Some(m) = metrics() {
        m.backpressure_total.with_label_values(&[reason, stage]).inc();
    }
}

pub fn record_proof_append(action: &str) {
    if let Some(m) = metrics() {
        m.proof_appends_total.with_label_values(&[action]).inc();
    }
}

/// Records the end of an agent task and how long the stage visit took.
pub fn record_task_outcome(outcome: &str, stage: &str, duration_secs: f64) {
    if let Some(m) = metrics() {
        m.agent_tasks_total.with_label_values(&[outcome]).inc();
        m.stage_duration.with_label_values(&[stage]).observe(duration_secs);
    }

    tracing::trace!(
        outcome = outcome,
        stage = stage,
        duration_secs = duration_secs,
        "Recorded task metric"
    );
}

/// Sets the busy-agent gauge.
pub fn set_busy_agents(count: usize) {
    if let Some(m) = metrics() {
        m.busy_agents.set(count as f64);
    }
}
