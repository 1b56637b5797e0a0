// [[MISSION]]/apps/kernel-server/src/events.rs
// Purpose: Messages pushed to observers over the real-time channel.
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono, Uuid

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FailedDeployment, ProjectSummary, Step, StepAgent, StepResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelEvent {
    ConnectionEstablished {
        message: String,
    },
    SubscriptionConfirmed {
        project_id: String,
        message: String,
    },
    SubscriptionRemoved {
        project_id: String,
        message: String,
    },
    Pong,
    ProjectCreated {
        project_id: String,
        name: String,
    },
    AgentsDeployed {
        project_id: String,
        deployment_id: String,
        deployed: Vec<String>,
        failed: Vec<FailedDeployment>,
    },
    AgentsRecalled {
        project_id: String,
        recalled: Vec<String>,
    },
    StepStarted {
        project_id: String,
        step_index: usize,
        step: Step,
    },
    StepProgress {
        project_id: String,
        step_index: usize,
        progress: u8,
        agents: Vec<StepAgent>,
    },
    StepCompleted {
        project_id: String,
        step_index: usize,
        result: StepResult,
    },
    WorkflowPaused {
        project_id: String,
    },
    WorkflowResumed {
        project_id: String,
    },
    WorkflowStopped {
        project_id: String,
    },
    WorkflowCompleted {
        project_id: String,
        final_result: ProjectSummary,
    },
    WorkflowError {
        project_id: String,
        error: String,
    },
}

impl KernelEvent {
    /// The `type` tag as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            KernelEvent::ConnectionEstablished { .. } => "connection_established",
            KernelEvent::SubscriptionConfirmed { .. } => "subscription_confirmed",
            KernelEvent::SubscriptionRemoved { .. } => "subscription_removed",
            KernelEvent::Pong => "pong",
            KernelEvent::ProjectCreated { .. } => "project_created",
            KernelEvent::AgentsDeployed { .. } => "agents_deployed",
            KernelEvent::AgentsRecalled { .. } => "agents_recalled",
            KernelEvent::StepStarted { .. } => "step_started",
            KernelEvent::StepProgress { .. } => "step_progress",
            KernelEvent::StepCompleted { .. } => "step_completed",
            KernelEvent::WorkflowPaused { .. } => "workflow_paused",
            KernelEvent::WorkflowResumed { .. } => "workflow_resumed",
            KernelEvent::WorkflowStopped { .. } => "workflow_stopped",
            KernelEvent::WorkflowCompleted { .. } => "workflow_completed",
            KernelEvent::WorkflowError { .. } => "workflow_error",
        }
    }
}

/// Wire form of every event: an id and timestamp around the tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: KernelEvent,
}

impl EventEnvelope {
    pub fn new(event: KernelEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Messages an observer may send up the socket.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe { project_id: String },
    Unsubscribe { project_id: String },
}
