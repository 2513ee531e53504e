//! Agent status machine.
//!
//! Each agent cycles through
//! `idle -> thinking -> researching -> building -> deploying -> idle`.
//! A task starts only from `idle`, phases advance one step at a time, and only
//! [`AgentRoster::complete_task`] leaves `deploying`. Completing a task feeds
//! the outcome back into the capability it exercised and appends one proof
//! entry. Phase changes and progress updates are not audited.
//!
//! Every claimed task gets a [`TaskLease`]; the `*_for` operations act only
//! while the agent still runs that task.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::error::AgentError;
use crate::proof::{actions, ProofLog};

/// Phase of an agent's status cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    #[default]
    Idle,
    Thinking,
    Researching,
    Building,
    Deploying,
}

impl AgentPhase {
    /// Phase reached by `advance_phase`, if any.
    pub fn next(self) -> Option<AgentPhase> {
        match self {
            AgentPhase::Idle => None,
            AgentPhase::Thinking => Some(AgentPhase::Researching),
            AgentPhase::Researching => Some(AgentPhase::Building),
            AgentPhase::Building => Some(AgentPhase::Deploying),
            AgentPhase::Deploying => None,
        }
    }

    pub fn is_idle(self) -> bool {
        self == AgentPhase::Idle
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentPhase::Idle => write!(f, "idle"),
            AgentPhase::Thinking => write!(f, "thinking"),
            AgentPhase::Researching => write!(f, "researching"),
            AgentPhase::Building => write!(f, "building"),
            AgentPhase::Deploying => write!(f, "deploying"),
        }
    }
}

/// Whether a task achieved its goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Failure,
}

impl TaskOutcome {
    pub fn is_success(self) -> bool {
        self == TaskOutcome::Success
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Success => write!(f, "success"),
            TaskOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Observable status of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiStatus {
    pub agent_id: String,
    pub status: AgentPhase,
    /// Cleared whenever the agent returns to idle.
    pub current_task: Option<String>,
    /// Percentage in `[0, 100]`.
    pub progress: u8,
    pub capability_id: Option<String>,
    /// Fresh for every task; cleared with `current_task`.
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

impl AiStatus {
    fn idle(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentPhase::Idle,
            current_task: None,
            progress: 0,
            capability_id: None,
            task_id: None,
        }
    }

    fn reset(&mut self) {
        self.status = AgentPhase::Idle;
        self.current_task = None;
        self.progress = 0;
        self.capability_id = None;
        self.task_id = None;
    }

    fn begin(&mut self, description: &str, capability_id: &str) -> TaskLease {
        let task_id = Uuid::new_v4();
        self.status = AgentPhase::Thinking;
        self.current_task = Some(description.to_string());
        self.progress = 0;
        self.capability_id = Some(capability_id.to_string());
        self.task_id = Some(task_id);
        TaskLease {
            agent_id: self.agent_id.clone(),
            task_id,
        }
    }

    /// The running task, if any.
    pub fn lease(&self) -> Option<TaskLease> {
        self.task_id.map(|task_id| TaskLease {
            agent_id: self.agent_id.clone(),
            task_id,
        })
    }

    fn ensure_runs(&self, expected: Option<Uuid>) -> Result<(), AgentError> {
        if self.status.is_idle() {
            return Err(AgentError::NoActiveTask(self.agent_id.clone()));
        }
        match expected {
            Some(task_id) if self.task_id != Some(task_id) => Err(AgentError::TaskSuperseded {
                agent_id: self.agent_id.clone(),
                task_id,
            }),
            _ => Ok(()),
        }
    }
}

/// One task run by one agent.
///
/// Operations addressed through a lease fail with
/// [`AgentError::TaskSuperseded`] once the agent has moved on to another
/// task, so a late caller never touches work it does not own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskLease {
    pub agent_id: String,
    pub task_id: Uuid,
}

/// The set of agents and their status machines.
pub struct AgentRoster {
    agents: RwLock<BTreeMap<String, Arc<Mutex<AiStatus>>>>,
    capabilities: Arc<CapabilityRegistry>,
    proof_log: Arc<ProofLog>,
}

impl AgentRoster {
    pub fn new(capabilities: Arc<CapabilityRegistry>, proof_log: Arc<ProofLog>) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            capabilities,
            proof_log,
        }
    }

    /// Registers an idle agent.
    pub async fn register(&self, agent_id: &str) -> Result<AiStatus, AgentError> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(agent_id) {
            return Err(AgentError::Duplicate(agent_id.to_string()));
        }
        let status = AiStatus::idle(agent_id);
        agents.insert(agent_id.to_string(), Arc::new(Mutex::new(status.clone())));
        Ok(status)
    }

    pub async fn get(&self, agent_id: &str) -> Result<AiStatus, AgentError> {
        let slot = self.slot(agent_id).await?;
        let status = slot.lock().await;
        Ok(status.clone())
    }

    /// All agents ordered by id.
    pub async fn list(&self) -> Vec<AiStatus> {
        let slots: Vec<Arc<Mutex<AiStatus>>> = self.agents.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(slots.len());
        for slot in slots {
            statuses.push(slot.lock().await.clone());
        }
        statuses
    }

    /// Number of agents not idle.
    pub async fn busy_count(&self) -> usize {
        self.list()
            .await
            .iter()
            .filter(|s| !s.status.is_idle())
            .count()
    }

    /// Starts a task on an idle agent.
    ///
    /// # Errors
    ///
    /// - `AgentError::Capability` if the capability is unknown
    /// - `AgentError::AgentBusy` if the agent is not idle
    pub async fn start_task(
        &self,
        agent_id: &str,
        description: &str,
        capability_id: &str,
    ) -> Result<AiStatus, AgentError> {
        self.capabilities.get(capability_id).await?;

        let slot = self.slot(agent_id).await?;
        let mut status = slot.lock().await;
        if !status.status.is_idle() {
            return Err(AgentError::AgentBusy {
                agent_id: agent_id.to_string(),
                status: status.status.to_string(),
            });
        }
        status.begin(description, capability_id);

        info!(agent_id = %agent_id, capability_id = %capability_id, task = %description, "Agent started task");
        Ok(status.clone())
    }

    /// Starts a task on the first idle agent, by id order.
    ///
    /// Returns `None` when every agent is busy.
    pub async fn claim_idle(
        &self,
        description: &str,
        capability_id: &str,
    ) -> Result<Option<TaskLease>, AgentError> {
        self.capabilities.get(capability_id).await?;

        let slots: Vec<Arc<Mutex<AiStatus>>> = self.agents.read().await.values().cloned().collect();
        for slot in slots {
            let mut status = slot.lock().await;
            if status.status.is_idle() {
                let lease = status.begin(description, capability_id);
                info!(
                    agent_id = %lease.agent_id,
                    task_id = %lease.task_id,
                    capability_id = %capability_id,
                    task = %description,
                    "Agent claimed for task"
                );
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    /// Moves the agent one phase forward.
    ///
    /// # Errors
    ///
    /// - `AgentError::NoActiveTask` from `idle`
    /// - `AgentError::InvalidState` from `deploying`
    pub async fn advance_phase(&self, agent_id: &str) -> Result<AiStatus, AgentError> {
        self.advance_phase_checked(agent_id, None).await
    }

    /// [`Self::advance_phase`] for the task held by `lease`.
    pub async fn advance_phase_for(&self, lease: &TaskLease) -> Result<AiStatus, AgentError> {
        self.advance_phase_checked(&lease.agent_id, Some(lease.task_id))
            .await
    }

    /// Sets task progress, clamped to `[0, 100]`. Does not change phase.
    pub async fn set_progress(&self, agent_id: &str, progress: i64) -> Result<AiStatus, AgentError> {
        self.set_progress_checked(agent_id, None, progress).await
    }

    pub async fn set_progress_for(
        &self,
        lease: &TaskLease,
        progress: i64,
    ) -> Result<AiStatus, AgentError> {
        self.set_progress_checked(&lease.agent_id, Some(lease.task_id), progress)
            .await
    }

    /// Finishes the task of a deploying agent.
    ///
    /// Appends one proof entry, records the outcome against the exercised
    /// capability and returns the agent to idle. If the proof append fails
    /// nothing is recorded and the agent stays in `deploying`. Once the entry
    /// is written the agent returns to idle even if the capability update
    /// fails; that error is still returned.
    pub async fn complete_task(
        &self,
        agent_id: &str,
        outcome: TaskOutcome,
    ) -> Result<AiStatus, AgentError> {
        self.complete_task_checked(agent_id, None, outcome).await
    }

    pub async fn complete_task_for(
        &self,
        lease: &TaskLease,
        outcome: TaskOutcome,
    ) -> Result<AiStatus, AgentError> {
        self.complete_task_checked(&lease.agent_id, Some(lease.task_id), outcome)
            .await
    }

    /// Forces the agent back to idle and logs the cancellation.
    ///
    /// Capability confidence is left untouched. The agent is freed even when
    /// the proof append fails; that error is still returned.
    pub async fn cancel_task(&self, agent_id: &str, reason: &str) -> Result<AiStatus, AgentError> {
        self.cancel_task_checked(agent_id, None, reason).await
    }

    /// [`Self::cancel_task`] for the task held by `lease`. Another task the
    /// agent has since picked up is left alone.
    pub async fn cancel_task_for(
        &self,
        lease: &TaskLease,
        reason: &str,
    ) -> Result<AiStatus, AgentError> {
        self.cancel_task_checked(&lease.agent_id, Some(lease.task_id), reason)
            .await
    }

    async fn advance_phase_checked(
        &self,
        agent_id: &str,
        task_id: Option<Uuid>,
    ) -> Result<AiStatus, AgentError> {
        let slot = self.slot(agent_id).await?;
        let mut status = slot.lock().await;
        status.ensure_runs(task_id)?;
        let next = status.status.next().ok_or_else(|| AgentError::InvalidState {
            agent_id: agent_id.to_string(),
            status: status.status.to_string(),
            operation: "advance phase".to_string(),
        })?;
        status.status = next;

        debug!(agent_id = %agent_id, phase = %next, "Agent advanced phase");
        Ok(status.clone())
    }

    async fn set_progress_checked(
        &self,
        agent_id: &str,
        task_id: Option<Uuid>,
        progress: i64,
    ) -> Result<AiStatus, AgentError> {
        let slot = self.slot(agent_id).await?;
        let mut status = slot.lock().await;
        status.ensure_runs(task_id)?;
        status.progress = progress.clamp(0, 100) as u8;
        Ok(status.clone())
    }

    async fn complete_task_checked(
        &self,
        agent_id: &str,
        task_id: Option<Uuid>,
        outcome: TaskOutcome,
    ) -> Result<AiStatus, AgentError> {
        let slot = self.slot(agent_id).await?;
        let mut status = slot.lock().await;
        status.ensure_runs(task_id)?;
        if status.status != AgentPhase::Deploying {
            return Err(AgentError::InvalidState {
                agent_id: agent_id.to_string(),
                status: status.status.to_string(),
                operation: "complete task".to_string(),
            });
        }

        let task = status.current_task.clone().unwrap_or_default();
        let action = match outcome {
            TaskOutcome::Success => actions::TASK_COMPLETED,
            TaskOutcome::Failure => actions::TASK_FAILED,
        };
        self.proof_log
            .record(action, agent_id, format!("{}: {}", outcome, task))
            .await?;

        let capability_id = status.capability_id.clone();
        status.reset();
        info!(agent_id = %agent_id, outcome = %outcome, task = %task, "Agent completed task");

        if let Some(capability_id) = capability_id {
            if let Err(e) = self
                .capabilities
                .record_usage(&capability_id, outcome.is_success())
                .await
            {
                warn!(
                    agent_id = %agent_id,
                    capability_id = %capability_id,
                    error = %e,
                    "Failed to record capability usage"
                );
                return Err(e.into());
            }
        }
        Ok(status.clone())
    }

    async fn cancel_task_checked(
        &self,
        agent_id: &str,
        task_id: Option<Uuid>,
        reason: &str,
    ) -> Result<AiStatus, AgentError> {
        let slot = self.slot(agent_id).await?;
        let mut status = slot.lock().await;
        status.ensure_runs(task_id)?;

        let task = status.current_task.clone().unwrap_or_default();
        let logged = self
            .proof_log
            .record(
                actions::TASK_CANCELLED,
                agent_id,
                format!("cancelled: {} ({})", task, reason),
            )
            .await;

        status.reset();
        match logged {
            Ok(_) => {
                info!(agent_id = %agent_id, reason = %reason, "Agent task cancelled");
                Ok(status.clone())
            }
            Err(e) => {
                warn!(agent_id = %agent_id, reason = %reason, error = %e, "Agent freed without a cancellation entry");
                Err(e.into())
            }
        }
    }

    async fn slot(&self, agent_id: &str) -> Result<Arc<Mutex<AiStatus>>, AgentError> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))
    }
}
