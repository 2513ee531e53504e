//! Background scheduling loop.
//!
//! Runs [`PipelineOrchestrator::dispatch`] on a fixed interval until a
//! shutdown signal arrives on a broadcast channel, then waits (bounded by the
//! shutdown timeout) for in-flight visits to drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::orchestrator::PipelineOrchestrator;

/// Errors raised by the runner lifecycle.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Runner is already running")]
    AlreadyRunning,

    #[error("Runner is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Drives the orchestrator in the background.
pub struct PipelineRunner {
    orchestrator: Arc<PipelineOrchestrator>,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    is_running: Arc<AtomicBool>,
}

impl PipelineRunner {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        tick_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            orchestrator,
            tick_interval,
            shutdown_timeout,
            shutdown_tx,
            handle: None,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the scheduling loop.
    pub fn start(&mut self) -> Result<(), RunnerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyRunning);
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tick_interval = self.tick_interval;

        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = tick_interval.as_millis() as u64, "Pipeline runner started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Pipeline runner received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        match orchestrator.dispatch().await {
                            Ok(report) => {
                                debug!(
                                    started = report.jobs.len(),
                                    queued = report.queued.len(),
                                    "Scheduling pass finished"
                                );
                            }
                            Err(e) => error!(error = %e, "Scheduling pass failed"),
                        }
                    }
                }
            }

            info!("Pipeline runner stopped");
        }));

        Ok(())
    }

    /// Stops the loop and waits for in-flight visits to finish.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::ShutdownTimeout` if visits are still running
    /// when the timeout expires.
    pub async fn shutdown(&mut self) -> Result<(), RunnerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(RunnerError::NotRunning);
        }

        info!("Initiating pipeline runner shutdown");
        // The loop may already have exited; a send error is fine.
        let _ = self.shutdown_tx.send(());

        let handle = self.handle.take();
        let orchestrator = Arc::clone(&self.orchestrator);
        let drain = async move {
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    error!(error = %e, "Runner task panicked during shutdown");
                }
            }
            while orchestrator.in_flight_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };

        let result = tokio::time::timeout(self.shutdown_timeout, drain).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Pipeline runner shutdown complete");
                Ok(())
            }
            Err(_) => Err(RunnerError::ShutdownTimeout(self.shutdown_timeout)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}
