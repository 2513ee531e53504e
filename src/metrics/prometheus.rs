//! Prometheus metrics registration and export.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Registry plus every metric registered in it.
///
/// Built as one value so a reader never sees a registry from one
/// initialization and a collector from another.
pub struct Metrics {
    pub registry: Registry,
    /// Opportunity state changes, labeled by kind (created, scored,
    /// advanced, validated, rejected).
    pub transitions_total: CounterVec,
    /// Stage visits deferred for lack of capacity, labeled by reason and stage.
    pub backpressure_total: CounterVec,
    /// Proof log appends, labeled by action.
    pub proof_appends_total: CounterVec,
    /// Agent task outcomes, labeled by outcome (success, failure, cancelled).
    pub agent_tasks_total: CounterVec,
    /// Stage visit duration in seconds, labeled by stage.
    pub stage_duration: HistogramVec,
    /// Number of agents currently running a task.
    pub busy_agents: Gauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// The initialized metrics, if [`init_metrics`] has succeeded.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once and from several threads at once; exactly one
/// fully built set is published and the others are dropped.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let built = build_metrics()?;
    if METRICS.set(built).is_ok() {
        tracing::info!("Prometheus metrics initialized successfully");
    }
    Ok(())
}

fn build_metrics() -> Result<Metrics, prometheus::Error> {
    let registry = Registry::new();

    let transitions_total = CounterVec::new(
        Opts::new(
            "opportunity_forge_transitions_total",
            "Opportunity state changes by kind",
        ),
        &["kind"],
    )?;

    let backpressure_total = CounterVec::new(
        Opts::new(
            "opportunity_forge_backpressure_total",
            "Stage visits queued for lack of an eligible capability or idle agent",
        ),
        &["reason", "stage"],
    )?;

    let proof_appends_total = CounterVec::new(
        Opts::new("opportunity_forge_proof_appends_total", "Proof log appends"),
        &["action"],
    )?;

    let agent_tasks_total = CounterVec::new(
        Opts::new("opportunity_forge_agent_tasks_total", "Agent task outcomes"),
        &["outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "opportunity_forge_stage_duration_seconds",
            "Duration of a stage visit",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["stage"],
    )?;

    let busy_agents = Gauge::new(
        "opportunity_forge_busy_agents",
        "Number of agents currently running a task",
    )?;

    registry.register(Box::new(transitions_total.clone()))?;
    registry.register(Box::new(backpressure_total.clone()))?;
    registry.register(Box::new(proof_appends_total.clone()))?;
    registry.register(Box::new(agent_tasks_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(busy_agents.clone()))?;

    Ok(Metrics {
        registry,
        transitions_total,
        backpressure_total,
        proof_appends_total,
        agent_tasks_total,
        stage_duration,
        busy_agents,
    })
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(metrics) = METRICS.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
