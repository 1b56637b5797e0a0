// [[MISSION]]/apps/kernel-server/src/ledger.rs
// Purpose: Batch deployments over the agent pool, with an append-only audit trail.
// Architecture: Domain Logic Layer
// Dependencies: Chrono

use chrono::Utc;
use std::sync::{Arc, RwLock};

use crate::error::{KernelError, KernelResult};
use crate::models::*;
use crate::pool::AgentPool;

pub struct DeploymentLedger {
    pool: Arc<AgentPool>,
    history: RwLock<Vec<DeploymentRecord>>,
}

impl DeploymentLedger {
    pub fn new(pool: Arc<AgentPool>) -> Self {
        Self {
            pool,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Second-resolution batch id. Two identical requests within one second
    /// share an id.
    pub fn deployment_id(project_id: &str) -> String {
        format!("deploy_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), project_id)
    }

    /// Tries every requested agent on its own; a busy or unknown agent is
    /// reported in `failed` and never blocks the rest.
    pub fn deploy_batch(
        &self,
        project_id: &str,
        agent_ids: &[String],
        task: &str,
    ) -> KernelResult<BatchResult> {
        if project_id.trim().is_empty() {
            return Err(KernelError::Validation("project id must not be empty".into()));
        }
        if agent_ids.is_empty() {
            return Err(KernelError::Validation("at least one agent id is required".into()));
        }

        let deployment_id = Self::deployment_id(project_id);
        let mut deployed = Vec::new();
        let mut failed = Vec::new();

        for agent_id in agent_ids {
            match self.pool.deploy(&deployment_id, agent_id, project_id, task) {
                Ok(deployment) => deployed.push(deployment),
                Err(e) => {
                    tracing::warn!("Deployment of {} to {} rejected: {}", agent_id, project_id, e);
                    failed.push(FailedDeployment {
                        agent_id: agent_id.clone(),
                        reason: e.to_string(),
                        kind: e.kind().to_string(),
                    });
                }
            }
        }

        let record = DeploymentRecord {
            deployment_id: deployment_id.clone(),
            project_id: project_id.to_string(),
            task: task.to_string(),
            agents_requested: agent_ids.to_vec(),
            agents_deployed: deployed.iter().map(|d| d.agent_id.clone()).collect(),
            failed_deployments: failed.clone(),
            deployed_at: Utc::now(),
        };
        self.history
            .write()
            .map_err(|_| KernelError::Internal("deployment history lock poisoned".into()))?
            .push(record);

        Ok(BatchResult {
            success: !deployed.is_empty(),
            deployment_id,
            total_requested: agent_ids.len(),
            total_deployed: deployed.len(),
            deployed,
            failed,
        })
    }

    pub fn history(&self) -> Vec<DeploymentRecord> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> OrchestratorStats {
        let history_size = self.history_len();
        OrchestratorStats {
            total_agents: self.pool.len(),
            active_deployments: self.pool.live_deployment_count(),
            total_deployments: history_size,
            deployment_history_size: history_size,
            agent_utilization: self.pool.utilization(),
        }
    }
}
