//! Pipeline orchestrator.
//!
//! Drives opportunities through the configured stages. Each scheduling pass
//! walks the stages in order, and for every resident, non-terminal,
//! not-in-flight opportunity:
//!
//! 1. looks up capabilities eligible for the stage's category and threshold,
//! 2. claims an idle agent and spawns a stage visit on it,
//! 3. the visit drives the agent through its phases while the scorer runs
//!    (scoring stages only), completes the task and then applies exactly one
//!    of advance, validate or reject to the opportunity.
//!
//! Every opportunity mutation is paired with exactly one proof entry. Missing
//! capacity is reported as a [`QueueReason`], never as an error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::config::PipelineConfig;
use super::scorer::{OpportunityScorer, StageAssessment};
use super::stages::{PipelineStage, StageCatalog, StageDefinition};
use crate::agent::{AgentRoster, AiStatus, TaskLease, TaskOutcome};
use crate::capability::CapabilityRegistry;
use crate::error::{AgentError, CapabilityError, OrchestratorError};
use crate::metrics;
use crate::opportunity::{Opportunity, OpportunityCandidate, OpportunityStore};
use crate::proof::{actions, run_audit, AuditReport, ProofLog, ProofVerifier};
use crate::storage::{MemoryRepository, Repository};

/// Agent name used for proof entries written by the orchestrator itself.
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

/// Attempts at writing the proof entry that pairs an applied mutation.
const PROOF_APPEND_ATTEMPTS: u32 = 3;
const PROOF_APPEND_BACKOFF: Duration = Duration::from_millis(20);

/// The owned subsystems the orchestrator coordinates.
#[derive(Clone)]
pub struct PipelineComponents {
    pub catalog: Arc<StageCatalog>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub proof_log: Arc<ProofLog>,
    pub store: Arc<OpportunityStore>,
    pub agents: Arc<AgentRoster>,
    pub repository: Arc<dyn Repository>,
}

impl PipelineComponents {
    /// Builds every subsystem over `repository`, restores persisted state,
    /// registers seed capabilities not yet known and the agent pool.
    pub async fn open(
        config: &PipelineConfig,
        repository: Arc<dyn Repository>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let catalog = Arc::new(config.catalog()?);

        let capabilities = Arc::new(CapabilityRegistry::new(
            config.confidence_alpha,
            repository.clone(),
        ));
        let restored = capabilities.hydrate().await?;
        for seed in &config.capabilities {
            match capabilities.register(seed.to_capability()).await {
                Ok(()) | Err(CapabilityError::Duplicate(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let proof_log = Arc::new(ProofLog::new(config.timestamp_policy, repository.clone()));
        let entries = proof_log.hydrate().await?;

        let store = Arc::new(OpportunityStore::new(catalog.clone(), repository.clone()));
        let opportunities = store.hydrate().await?;

        let agents = Arc::new(AgentRoster::new(capabilities.clone(), proof_log.clone()));
        for agent_id in config.agent_ids() {
            agents.register(&agent_id).await?;
        }

        info!(
            capabilities = restored,
            proof_entries = entries,
            opportunities,
            agents = config.num_agents,
            "Pipeline components ready"
        );

        Ok(Self {
            catalog,
            capabilities,
            proof_log,
            store,
            agents,
            repository,
        })
    }

    /// Builds the components over a fresh in-memory repository.
    pub async fn in_memory(config: &PipelineConfig) -> Result<Self, OrchestratorError> {
        Self::open(config, Arc::new(MemoryRepository::new())).await
    }
}

/// Why an opportunity was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ScoreBelowFloor,
    MaxRetriesExceeded,
    Manual(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ScoreBelowFloor => write!(f, "score-below-floor"),
            RejectReason::MaxRetriesExceeded => write!(f, "max-retries-exceeded"),
            RejectReason::Manual(reason) => write!(f, "{}", reason),
        }
    }
}

/// Why a stage visit was not started on this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    NoEligibleCapability,
    NoIdleAgent,
}

impl fmt::Display for QueueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueReason::NoEligibleCapability => write!(f, "no-eligible-capability"),
            QueueReason::NoIdleAgent => write!(f, "no-idle-agent"),
        }
    }
}

/// A stage visit deferred by backpressure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedVisit {
    pub opportunity_id: Uuid,
    pub stage_id: String,
    pub reason: QueueReason,
}

/// What a stage visit did to its opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VisitResult {
    Advanced { to: String },
    Validated,
    Rejected { reason: RejectReason },
    /// The task failed and the opportunity stays queued in its stage.
    Retrying { failures: u32 },
    /// Cancelled or timed out; the opportunity stays queued in its stage.
    Cancelled,
    Errored { message: String },
}

/// Outcome of one stage visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitOutcome {
    pub opportunity_id: Uuid,
    pub stage_id: String,
    pub agent_id: String,
    pub result: VisitResult,
}

/// Visits started by [`PipelineOrchestrator::dispatch`].
pub struct DispatchReport {
    pub jobs: Vec<JoinHandle<VisitOutcome>>,
    pub queued: Vec<QueuedVisit>,
}

/// Result of a full scheduling tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub outcomes: Vec<VisitOutcome>,
    pub queued: Vec<QueuedVisit>,
}

/// Pipeline statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub visits: u64,
    pub successful_visits: u64,
    pub failed_visits: u64,
    pub cancelled_visits: u64,
    pub advanced: u64,
    pub validated: u64,
    pub rejected: u64,
    pub queued_no_capability: u64,
    pub queued_no_agent: u64,
    /// Average duration of finished visits.
    pub average_visit_duration: Duration,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_success(&mut self, duration: Duration) {
        self.visits += 1;
        self.successful_visits += 1;
        self.update_average_duration(duration);
    }

    fn record_failure(&mut self, duration: Duration) {
        self.visits += 1;
        self.failed_visits += 1;
        self.update_average_duration(duration);
    }

    fn record_cancelled(&mut self, duration: Duration) {
        self.visits += 1;
        self.cancelled_visits += 1;
        self.update_average_duration(duration);
    }

    fn record_queued(&mut self, reason: QueueReason) {
        match reason {
            QueueReason::NoEligibleCapability => self.queued_no_capability += 1,
            QueueReason::NoIdleAgent => self.queued_no_agent += 1,
        }
    }

    fn update_average_duration(&mut self, duration: Duration) {
        if self.visits == 1 {
            self.average_visit_duration = duration;
        } else {
            // Incremental average: avg = avg + (new - avg) / n
            let n = self.visits as f64;
            let old_avg = self.average_visit_duration.as_secs_f64();
            let new_val = duration.as_secs_f64();
            let new_avg = old_avg + (new_val - old_avg) / n;
            self.average_visit_duration = Duration::from_secs_f64(new_avg.max(0.0));
        }
    }
}

struct InFlight {
    lease: TaskLease,
    cancel: Arc<Notify>,
}

enum Interrupt {
    Cancelled,
    Deadline,
}

/// Coordinates stores, agents, capabilities and the proof log.
pub struct PipelineOrchestrator {
    components: PipelineComponents,
    scorer: Arc<dyn OpportunityScorer>,
    max_retries: u32,
    task_deadline: Option<Duration>,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    /// Consecutive failures per (opportunity, stage).
    failures: Mutex<HashMap<(Uuid, String), u32>>,
    stats: RwLock<PipelineStats>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        components: PipelineComponents,
        scorer: Arc<dyn OpportunityScorer>,
    ) -> Self {
        Self {
            components,
            scorer,
            max_retries: config.max_retries,
            task_deadline: config.task_deadline(),
            in_flight: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            stats: RwLock::new(PipelineStats::new()),
        }
    }

    pub fn components(&self) -> &PipelineComponents {
        &self.components
    }

    /// Creates an opportunity in the first stage and logs it.
    pub async fn submit(
        &self,
        candidate: OpportunityCandidate,
    ) -> Result<Opportunity, OrchestratorError> {
        let opportunity = self.components.store.create(candidate).await?;
        self.components
            .proof_log
            .record(
                actions::OPPORTUNITY_CREATED,
                ORCHESTRATOR_AGENT,
                format!("opportunity {} created in {}", opportunity.id, opportunity.stage),
            )
            .await?;

        metrics::record_transition("created");
        self.stats.write().await.submitted += 1;
        Ok(opportunity)
    }

    /// Rejects an opportunity on request. Fails while a visit is in flight.
    pub async fn reject(&self, id: Uuid, reason: &str) -> Result<Opportunity, OrchestratorError> {
        if self.in_flight.lock().await.contains_key(&id) {
            return Err(OrchestratorError::InFlight(id));
        }
        let reason = RejectReason::Manual(reason.to_string());
        self.apply_reject(id, &reason, ORCHESTRATOR_AGENT).await
    }

    /// Cancels the visit the agent is running.
    ///
    /// The agent is forced to idle with a `cancelled` proof entry and the
    /// opportunity stays queued in its stage. Cancellation does not count as
    /// a failed attempt.
    pub async fn cancel_agent(
        &self,
        agent_id: &str,
        reason: &str,
    ) -> Result<AiStatus, OrchestratorError> {
        let lease = self
            .components
            .agents
            .get(agent_id)
            .await?
            .lease()
            .ok_or_else(|| OrchestratorError::NoAssignment(agent_id.to_string()))?;
        {
            let in_flight = self.in_flight.lock().await;
            let visit = in_flight
                .values()
                .find(|v| v.lease == lease)
                .ok_or_else(|| OrchestratorError::NoAssignment(agent_id.to_string()))?;
            visit.cancel.notify_one();
        }
        let status = self.components.agents.cancel_task_for(&lease, reason).await?;
        info!(agent_id = %agent_id, reason = %reason, "Cancelled agent visit");
        Ok(status)
    }

    /// Stage views with resident counts computed now.
    pub async fn stages(&self) -> Vec<PipelineStage> {
        let counts = self.components.store.count_by_stage().await;
        self.components.catalog.view(&counts)
    }

    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Number of visits currently running.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Runs an audit pass over the whole proof log.
    pub async fn audit(&self, verifier: &dyn ProofVerifier) -> Result<AuditReport, OrchestratorError> {
        Ok(run_audit(&self.components.proof_log, verifier, 1, u64::MAX).await?)
    }

    /// Starts a visit for every opportunity that has capacity and returns
    /// without waiting for them.
    pub async fn dispatch(self: &Arc<Self>) -> Result<DispatchReport, OrchestratorError> {
        let mut jobs = Vec::new();
        let mut queued = Vec::new();

        for stage in self.components.catalog.iter() {
            let residents: Vec<Opportunity> = self
                .components
                .store
                .list_by_stage(&stage.id)
                .collect()
                .await;
            if residents.is_empty() {
                continue;
            }

            let eligible = self
                .components
                .capabilities
                .eligible(stage.category, stage.min_confidence)
                .await;

            for opportunity in residents {
                if opportunity.is_terminal() {
                    continue;
                }

                let Some(capability) = eligible.first() else {
                    queued.push(self.queue(&opportunity, stage, QueueReason::NoEligibleCapability).await);
                    continue;
                };

                let mut in_flight = self.in_flight.lock().await;
                if in_flight.contains_key(&opportunity.id) {
                    continue;
                }

                let description = format!("{}: {}", stage.name, opportunity.title);
                let Some(lease) = self
                    .components
                    .agents
                    .claim_idle(&description, &capability.id)
                    .await?
                else {
                    drop(in_flight);
                    queued.push(self.queue(&opportunity, stage, QueueReason::NoIdleAgent).await);
                    continue;
                };

                let cancel = Arc::new(Notify::new());
                in_flight.insert(
                    opportunity.id,
                    InFlight {
                        lease: lease.clone(),
                        cancel: cancel.clone(),
                    },
                );
                drop(in_flight);

                info!(
                    opportunity_id = %opportunity.id,
                    stage = %stage.id,
                    agent_id = %lease.agent_id,
                    task_id = %lease.task_id,
                    capability_id = %capability.id,
                    "Dispatching stage visit"
                );

                let this = Arc::clone(self);
                let stage = stage.clone();
                jobs.push(tokio::spawn(async move {
                    this.run_visit(opportunity.id, stage, lease, cancel).await
                }));
            }
        }

        metrics::set_busy_agents(self.components.agents.busy_count().await);
        Ok(DispatchReport { jobs, queued })
    }

    /// Dispatches and waits for every started visit.
    pub async fn tick(self: &Arc<Self>) -> Result<TickReport, OrchestratorError> {
        let DispatchReport { jobs, queued } = self.dispatch().await?;

        let mut outcomes = Vec::with_capacity(jobs.len());
        for joined in join_all(jobs).await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Stage visit task panicked"),
            }
        }

        Ok(TickReport { outcomes, queued })
    }

    async fn queue(
        &self,
        opportunity: &Opportunity,
        stage: &StageDefinition,
        reason: QueueReason,
    ) -> QueuedVisit {
        metrics::record_backpressure(&reason.to_string(), &stage.id);
        self.stats.write().await.record_queued(reason);
        QueuedVisit {
            opportunity_id: opportunity.id,
            stage_id: stage.id.clone(),
            reason,
        }
    }

    async fn run_visit(
        self: Arc<Self>,
        opportunity_id: Uuid,
        stage: StageDefinition,
        lease: TaskLease,
        cancel: Arc<Notify>,
    ) -> VisitOutcome {
        let started = Instant::now();
        let result = match self
            .execute_visit(opportunity_id, &stage, &lease, cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => self.recover_visit(opportunity_id, &stage, &lease, e).await,
        };

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight
                .get(&opportunity_id)
                .is_some_and(|v| v.lease == lease)
            {
                in_flight.remove(&opportunity_id);
            }
        }

        let elapsed = started.elapsed();
        let outcome_label = {
            let mut stats = self.stats.write().await;
            match &result {
                VisitResult::Cancelled => {
                    stats.record_cancelled(elapsed);
                    "cancelled"
                }
                VisitResult::Retrying { .. }
                | VisitResult::Rejected {
                    reason: RejectReason::MaxRetriesExceeded,
                }
                | VisitResult::Errored { .. } => {
                    stats.record_failure(elapsed);
                    "failure"
                }
                _ => {
                    stats.record_success(elapsed);
                    "success"
                }
            }
        };
        metrics::record_task_outcome(outcome_label, &stage.id, elapsed.as_secs_f64());
        metrics::set_busy_agents(self.components.agents.busy_count().await);

        VisitOutcome {
            opportunity_id,
            stage_id: stage.id,
            agent_id: lease.agent_id,
            result,
        }
    }

    /// Cleans up after a visit that stopped on an error.
    ///
    /// The agent is freed if it still runs this visit's task and the error
    /// counts as a failed attempt, so a persistent fault ends in rejection
    /// instead of an endless retry loop.
    async fn recover_visit(
        &self,
        opportunity_id: Uuid,
        stage: &StageDefinition,
        lease: &TaskLease,
        err: OrchestratorError,
    ) -> VisitResult {
        error!(
            opportunity_id = %opportunity_id,
            stage = %stage.id,
            agent_id = %lease.agent_id,
            error = %err,
            "Stage visit failed"
        );

        match self
            .components
            .agents
            .cancel_task_for(lease, "stage visit failed")
            .await
        {
            Err(e) if !lost_task(&e) => warn!(
                agent_id = %lease.agent_id,
                error = %e,
                "Agent freed without a cancellation entry"
            ),
            _ => {}
        }

        let failures = self.count_failure(opportunity_id, &stage.id).await;
        if failures > self.max_retries {
            let reason = RejectReason::MaxRetriesExceeded;
            match self.apply_reject(opportunity_id, &reason, &lease.agent_id).await {
                Ok(_) => return VisitResult::Rejected { reason },
                Err(e) => error!(
                    opportunity_id = %opportunity_id,
                    error = %e,
                    "Could not reject after exhausting retries"
                ),
            }
        }

        VisitResult::Errored {
            message: err.to_string(),
        }
    }

    /// Bumps the consecutive failure count and returns it. The count resets
    /// once it passes `max_retries`.
    async fn count_failure(&self, opportunity_id: Uuid, stage_id: &str) -> u32 {
        let mut failures = self.failures.lock().await;
        let key = (opportunity_id, stage_id.to_string());
        let count = {
            let count = failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count > self.max_retries {
            failures.remove(&key);
        }
        count
    }

    /// Writes the proof entry pairing a mutation that is already committed.
    ///
    /// The append is retried a few times; if it still fails the error is
    /// returned and the mutation stands without its entry.
    async fn record_committed(
        &self,
        action: &str,
        agent: &str,
        result: String,
    ) -> Result<(), OrchestratorError> {
        let mut attempt = 1;
        loop {
            match self
                .components
                .proof_log
                .record(action, agent, result.clone())
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if attempt < PROOF_APPEND_ATTEMPTS => {
                    warn!(action = %action, attempt, error = %e, "Proof append failed, retrying");
                    tokio::time::sleep(PROOF_APPEND_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        action = %action,
                        agent = %agent,
                        result = %result,
                        error = %e,
                        "Committed mutation has no proof entry"
                    );
                    return Err(e.into());
                }
            }
        }
    }

    async fn execute_visit(
        &self,
        opportunity_id: Uuid,
        stage: &StageDefinition,
        lease: &TaskLease,
        cancel: Arc<Notify>,
    ) -> Result<VisitResult, OrchestratorError> {
        let agents = &self.components.agents;
        let agent_id = lease.agent_id.as_str();

        let work = async {
            agents.advance_phase_for(lease).await?;
            agents.set_progress_for(lease, 25).await?;

            let opportunity = self.components.store.get(opportunity_id).await?;
            let assessment = if stage.scoring {
                self.scorer
                    .assess(&opportunity, stage)
                    .await
                    .and_then(StageAssessment::validate)
            } else {
                Ok(StageAssessment::new(opportunity.score, opportunity.trend))
            };

            agents.advance_phase_for(lease).await?;
            agents.set_progress_for(lease, 75).await?;
            agents.advance_phase_for(lease).await?;
            agents.set_progress_for(lease, 100).await?;
            Ok::<_, OrchestratorError>(assessment)
        };

        let deadline = self.task_deadline;
        let bounded = async move {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .map_err(|_| Interrupt::Deadline),
                None => Ok(work.await),
            }
        };

        let raced = tokio::select! {
            biased;
            _ = cancel.notified() => Err(Interrupt::Cancelled),
            result = bounded => result,
        };

        let assessment = match raced {
            Ok(Ok(assessment)) => assessment,
            Ok(Err(OrchestratorError::Agent(e))) if lost_task(&e) => {
                // Someone else already freed the agent for this task.
                return Ok(VisitResult::Cancelled);
            }
            Ok(Err(e)) => return Err(e),
            Err(Interrupt::Cancelled) => {
                // cancel_agent already forced the agent idle and logged it.
                return Ok(VisitResult::Cancelled);
            }
            Err(Interrupt::Deadline) => {
                warn!(
                    opportunity_id = %opportunity_id,
                    stage = %stage.id,
                    agent_id = %agent_id,
                    "Stage visit exceeded its deadline"
                );
                match agents.cancel_task_for(lease, "deadline exceeded").await {
                    Err(e) if !lost_task(&e) => return Err(e.into()),
                    _ => {}
                }
                return Ok(VisitResult::Cancelled);
            }
        };

        let outcome = match assessment {
            Ok(_) => TaskOutcome::Success,
            Err(_) => TaskOutcome::Failure,
        };
        match agents.complete_task_for(lease, outcome).await {
            Err(e) if lost_task(&e) => return Ok(VisitResult::Cancelled),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        match assessment {
            Ok(assessment) => {
                self.failures
                    .lock()
                    .await
                    .remove(&(opportunity_id, stage.id.clone()));
                self.apply_assessment(opportunity_id, stage, agent_id, assessment)
                    .await
            }
            Err(scorer_error) => {
                let failures = self.count_failure(opportunity_id, &stage.id).await;

                if failures > self.max_retries {
                    warn!(
                        opportunity_id = %opportunity_id,
                        stage = %stage.id,
                        failures,
                        error = %scorer_error,
                        "Retries exhausted"
                    );
                    let reason = RejectReason::MaxRetriesExceeded;
                    self.apply_reject(opportunity_id, &reason, agent_id).await?;
                    Ok(VisitResult::Rejected { reason })
                } else {
                    warn!(
                        opportunity_id = %opportunity_id,
                        stage = %stage.id,
                        failures,
                        max_retries = self.max_retries,
                        error = %scorer_error,
                        "Stage visit failed, will retry"
                    );
                    Ok(VisitResult::Retrying { failures })
                }
            }
        }
    }

    async fn apply_assessment(
        &self,
        opportunity_id: Uuid,
        stage: &StageDefinition,
        agent_id: &str,
        assessment: StageAssessment,
    ) -> Result<VisitResult, OrchestratorError> {
        let store = &self.components.store;

        if stage.scoring {
            store
                .update_score(opportunity_id, assessment.score, assessment.trend)
                .await?;
            self.record_committed(
                actions::OPPORTUNITY_SCORED,
                agent_id,
                format!(
                    "opportunity {} scored {:.3} (trend {:+.3}) at {}",
                    opportunity_id, assessment.score, assessment.trend, stage.id
                ),
            )
            .await?;
            metrics::record_transition("scored");
        }

        if assessment.score < stage.score_floor {
            let reason = RejectReason::ScoreBelowFloor;
            self.apply_reject(opportunity_id, &reason, agent_id).await?;
            return Ok(VisitResult::Rejected { reason });
        }

        match self.components.catalog.next_after(&stage.id) {
            Some(next) => {
                store.advance(opportunity_id, &next.id).await?;
                self.record_committed(
                    actions::OPPORTUNITY_ADVANCED,
                    agent_id,
                    format!("opportunity {}: {} -> {}", opportunity_id, stage.id, next.id),
                )
                .await?;
                info!(
                    opportunity_id = %opportunity_id,
                    from = %stage.id,
                    to = %next.id,
                    "Opportunity advanced"
                );
                metrics::record_transition("advanced");
                self.stats.write().await.advanced += 1;
                Ok(VisitResult::Advanced {
                    to: next.id.clone(),
                })
            }
            None => {
                store.mark_validated(opportunity_id).await?;
                self.record_committed(
                    actions::OPPORTUNITY_VALIDATED,
                    agent_id,
                    format!("opportunity {} validated at {}", opportunity_id, stage.id),
                )
                .await?;
                info!(opportunity_id = %opportunity_id, stage = %stage.id, "Opportunity validated");
                metrics::record_transition("validated");
                self.stats.write().await.validated += 1;
                Ok(VisitResult::Validated)
            }
        }
    }

    async fn apply_reject(
        &self,
        opportunity_id: Uuid,
        reason: &RejectReason,
        agent: &str,
    ) -> Result<Opportunity, OrchestratorError> {
        let reason_text = reason.to_string();
        let rejected = self
            .components
            .store
            .reject(opportunity_id, &reason_text)
            .await?;
        self.record_committed(
            actions::OPPORTUNITY_REJECTED,
            agent,
            format!("opportunity {} rejected: {}", opportunity_id, reason_text),
        )
        .await?;

        info!(opportunity_id = %opportunity_id, reason = %reason_text, "Opportunity rejected");
        metrics::record_transition("rejected");
        self.stats.write().await.rejected += 1;
        Ok(rejected)
    }
}

/// Whether the agent no longer runs the task the caller holds.
fn lost_task(err: &AgentError) -> bool {
    matches!(
        err,
        AgentError::NoActiveTask(_) | AgentError::TaskSuperseded { .. }
    )
}
