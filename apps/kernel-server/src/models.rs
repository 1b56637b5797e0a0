use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Deployment logs keep only this many most recent lines.
pub const MAX_DEPLOYMENT_LOGS: usize = 50;

// === AGENTS ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Available,
    Deployed,
    Active,
    Completed,
    Recalled,
}

impl AgentStatus {
    pub fn is_busy(self) -> bool {
        matches!(self, AgentStatus::Deployed | AgentStatus::Active)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Available => "available",
            AgentStatus::Deployed => "deployed",
            AgentStatus::Active => "active",
            AgentStatus::Completed => "completed",
            AgentStatus::Recalled => "recalled",
        };
        f.write_str(s)
    }
}

/// Immutable template of one agent kind in the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub role: String,
    pub capabilities: Vec<String>,
}

impl AgentDefinition {
    pub fn new(id: &str, name: &str, role: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// The fixed roster every pool starts with.
    pub fn roster() -> Vec<AgentDefinition> {
        vec![
            Self::new(
                "pm",
                "PROJECT MANAGER",
                "Mission Coordinator",
                &["project planning", "coordination", "stakeholder management"],
            ),
            Self::new(
                "architect",
                "SYSTEM ARCHITECT",
                "Infrastructure Designer",
                &["system design", "architecture planning", "technical documentation"],
            ),
            Self::new(
                "dev",
                "CORE DEVELOPER",
                "Code Implementation Specialist",
                &["code development", "implementation", "debugging", "testing"],
            ),
            Self::new(
                "qa",
                "QUALITY ASSURANCE",
                "Testing and Validation Unit",
                &["testing", "quality validation", "performance analysis"],
            ),
            Self::new(
                "ux-expert",
                "UX SPECIALIST",
                "User Experience Designer",
                &["ui design", "user research", "accessibility"],
            ),
            Self::new(
                "po",
                "PRODUCT OWNER",
                "Requirements and Vision Keeper",
                &["requirements gathering", "user stories", "acceptance criteria"],
            ),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub tasks_completed: u64,
    pub tasks_recalled: u64,
    pub total_execution_ms: i64,
    pub success_rate: f64,
    pub last_deployment: Option<DateTime<Utc>>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        PerformanceMetrics {
            tasks_completed: 0,
            tasks_recalled: 0,
            total_execution_ms: 0,
            success_rate: 100.0,
            last_deployment: None,
        }
    }
}

impl PerformanceMetrics {
    pub(crate) fn refresh_success_rate(&mut self) {
        let finished = self.tasks_completed + self.tasks_recalled;
        self.success_rate = if finished == 0 {
            100.0
        } else {
            self.tasks_completed as f64 / finished as f64 * 100.0
        };
    }
}

/// Mutable per-agent fields, joined to an [`AgentDefinition`] by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRuntimeState {
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub load: u32,
    pub performance: PerformanceMetrics,
}

impl Default for AgentRuntimeState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Available,
            current_task: None,
            load: 0,
            performance: PerformanceMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    #[serde(flatten)]
    pub definition: AgentDefinition,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub load: u32,
    pub performance: PerformanceMetrics,
    pub active_deployments: usize,
}

/// An agent as seen from inside a running step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepAgent {
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub status: DeploymentStatus,
    pub progress: u8,
    pub current_task: String,
}

// === DEPLOYMENTS ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Deployed,
    Active,
    Completed,
    Recalled,
}

impl DeploymentStatus {
    pub fn is_live(self) -> bool {
        matches!(self, DeploymentStatus::Deployed | DeploymentStatus::Active)
    }
}

/// Composite key of one agent inside one deployment batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeploymentKey {
    pub deployment_id: String,
    pub agent_id: String,
}

impl DeploymentKey {
    pub fn new(deployment_id: &str, agent_id: &str) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            agent_id: agent_id.to_string(),
        }
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.deployment_id, self.agent_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub deployment_id: String,
    pub agent_id: String,
    pub project_id: String,
    pub task: String,
    pub status: DeploymentStatus,
    pub progress: u8,
    pub logs: Vec<String>,
    pub deployed_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub recalled_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.deployment_id, &self.agent_id)
    }

    /// Appends lines, then drops the oldest beyond [`MAX_DEPLOYMENT_LOGS`].
    pub fn append_logs<I>(&mut self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.logs.extend(lines);
        if self.logs.len() > MAX_DEPLOYMENT_LOGS {
            let excess = self.logs.len() - MAX_DEPLOYMENT_LOGS;
            self.logs.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedDeployment {
    pub agent_id: String,
    pub reason: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchResult {
    pub success: bool,
    pub deployment_id: String,
    pub deployed: Vec<Deployment>,
    pub failed: Vec<FailedDeployment>,
    pub total_requested: usize,
    pub total_deployed: usize,
}

/// Write-once audit entry of one batch request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub deployment_id: String,
    pub project_id: String,
    pub task: String,
    pub agents_requested: Vec<String>,
    pub agents_deployed: Vec<String>,
    pub failed_deployments: Vec<FailedDeployment>,
    pub deployed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentUtilization {
    pub status: AgentStatus,
    pub load: u32,
    pub tasks_completed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorStats {
    pub total_agents: usize,
    pub active_deployments: usize,
    pub total_deployments: usize,
    pub deployment_history_size: usize,
    pub agent_utilization: BTreeMap<String, AgentUtilization>,
}

// === WORKFLOWS ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Completed | RunStatus::Error)
    }

    /// Error is reachable from Paused because an executor call that was
    /// already in flight can still fail after the pause landed.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Running, Paused) | (Running, Stopped) | (Running, Completed) | (Running, Error)
                | (Paused, Running) | (Paused, Stopped) | (Paused, Error)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepOutcome,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub agents_used: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agents: Vec<String>,
    /// Display only; never drives timing.
    #[serde(default)]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<StepResult>,
}

impl Step {
    pub fn new(id: &str, name: &str, description: &str, agents: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            estimated_duration: None,
            outputs: Vec::new(),
            status: StepStatus::Pending,
            result: None,
        }
    }

    pub fn with_duration(mut self, duration: &str) -> Self {
        self.estimated_duration = Some(duration.to_string());
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|o| o.to_string()).collect();
        self
    }
}

/// Roster entry captured when a run starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowAgent {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default = "default_roster_status")]
    pub status: String,
}

fn default_roster_status() -> String {
    "idle".to_string()
}

impl WorkflowAgent {
    pub fn idle(definition: &AgentDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            role: definition.role.clone(),
            status: default_roster_status(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTemplate {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub agents: Vec<WorkflowAgent>,
}

impl Default for WorkflowTemplate {
    fn default() -> Self {
        let steps = vec![
            Step::new(
                "planning",
                "MISSION PLANNING",
                "Requirements analysis and project scope definition",
                &["pm", "architect"],
            )
            .with_duration("2-4 minutes")
            .with_outputs(&["requirements.md", "project_brief.md"]),
            Step::new(
                "architecture",
                "SYSTEM ARCHITECTURE",
                "Technical design and infrastructure planning",
                &["architect", "dev"],
            )
            .with_duration("3-6 minutes")
            .with_outputs(&["architecture.md", "api_spec.yaml"]),
            Step::new(
                "development",
                "CODE DEPLOYMENT",
                "Implementation of core functionality",
                &["dev", "architect"],
            )
            .with_duration("8-15 minutes")
            .with_outputs(&["source_code", "config_files"]),
            Step::new(
                "testing",
                "QUALITY VALIDATION",
                "Testing and performance optimization",
                &["qa", "dev"],
            )
            .with_duration("4-8 minutes")
            .with_outputs(&["test_results.md", "quality_report.md"]),
            Step::new(
                "deployment",
                "MISSION DEPLOYMENT",
                "Final deployment and system activation",
                &["pm", "dev", "qa"],
            )
            .with_duration("2-3 minutes")
            .with_outputs(&["deployment_log.md", "system_status.md"]),
        ];

        let agents = AgentDefinition::roster()
            .iter()
            .filter(|d| matches!(d.id.as_str(), "pm" | "architect" | "dev" | "qa"))
            .map(WorkflowAgent::idle)
            .collect();

        WorkflowTemplate { steps, agents }
    }
}

/// Live execution of one project's step sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub project_id: String,
    pub status: RunStatus,
    pub current_step: usize,
    pub steps: Vec<Step>,
    pub agents: Vec<WorkflowAgent>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn new(project_id: &str, template: WorkflowTemplate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            status: RunStatus::Running,
            current_step: 0,
            steps: template.steps,
            agents: template.agents,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }

    pub fn steps_completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// Distinct agents of the completed steps, in first-use order.
    pub fn agents_used(&self) -> Vec<String> {
        let mut used: Vec<String> = Vec::new();
        for step in self.steps.iter().filter(|s| s.status == StepStatus::Completed) {
            for agent in &step.agents {
                if !used.contains(agent) {
                    used.push(agent.clone());
                }
            }
        }
        used
    }

    pub fn outputs(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .flat_map(|s| s.outputs.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryMetrics {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub agents_deployed: usize,
    pub execution_time_ms: i64,
}

/// Final report attached to `workflow_completed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectSummary {
    pub project_id: String,
    pub status: String,
    pub completion_time: DateTime<Utc>,
    pub artifacts_generated: Vec<String>,
    pub metrics: SummaryMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub status: String,
    pub uptime_secs: i64,
    pub active_workflows: usize,
    pub active_agents: usize,
    pub projects_created: u64,
    pub workflows_executed: u64,
    pub connections: usize,
    pub version: String,
}
