// [[MISSION]]/apps/kernel-server/src/pool.rs
// Purpose: Fixed agent registry and per-agent lifecycle transitions.
// Architecture: Domain Logic Layer
// Dependencies: DashMap, Chrono

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::error::{KernelError, KernelResult};
use crate::models::*;
use crate::ticker::{TickPolicy, Wake};

/// Lock order: an agent entry may be held while touching `deployments`,
/// never the other way round.
pub struct AgentPool {
    definitions: BTreeMap<String, AgentDefinition>,
    states: DashMap<String, AgentRuntimeState>,
    deployments: DashMap<DeploymentKey, Deployment>,
}

impl AgentPool {
    pub fn new(roster: Vec<AgentDefinition>) -> Self {
        let states = DashMap::new();
        let mut definitions = BTreeMap::new();
        for definition in roster {
            states.insert(definition.id.clone(), AgentRuntimeState::default());
            definitions.insert(definition.id.clone(), definition);
        }
        tracing::info!("Agent pool initialized with {} agents", definitions.len());

        Self {
            definitions,
            states,
            deployments: DashMap::new(),
        }
    }

    pub fn with_default_roster() -> Self {
        Self::new(AgentDefinition::roster())
    }

    pub fn definition(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.definitions.get(agent_id)
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &String> {
        self.definitions.keys()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Assigns one agent to a project task.
    pub fn deploy(
        &self,
        deployment_id: &str,
        agent_id: &str,
        project_id: &str,
        task: &str,
    ) -> KernelResult<Deployment> {
        let mut state = self
            .states
            .get_mut(agent_id)
            .ok_or_else(|| KernelError::NotFound(format!("agent not found in pool: {}", agent_id)))?;

        if state.status != AgentStatus::Available {
            return Err(KernelError::Conflict(format!("agent busy: {}", state.status)));
        }

        let now = Utc::now();
        state.status = AgentStatus::Deployed;
        state.current_task = Some(task.to_string());
        state.load += 1;
        state.performance.last_deployment = Some(now);

        let deployment = Deployment {
            deployment_id: deployment_id.to_string(),
            agent_id: agent_id.to_string(),
            project_id: project_id.to_string(),
            task: task.to_string(),
            status: DeploymentStatus::Deployed,
            progress: 0,
            logs: vec![format!("Agent {} deployed for task: {}", agent_id, task)],
            deployed_at: now,
            updated_at: None,
            completed_at: None,
            recalled_at: None,
        };
        self.deployments.insert(deployment.key(), deployment.clone());
        drop(state);

        tracing::info!("Deployed agent {} to project {} ({})", agent_id, project_id, deployment_id);
        Ok(deployment)
    }

    /// Deployed -> active. Returns false for unknown or finished deployments.
    pub fn activate(&self, key: &DeploymentKey) -> bool {
        let activated = match self.deployments.get_mut(key) {
            Some(mut deployment) if deployment.status == DeploymentStatus::Deployed => {
                deployment.status = DeploymentStatus::Active;
                deployment.updated_at = Some(Utc::now());
                true
            }
            Some(deployment) => deployment.status == DeploymentStatus::Active,
            None => false,
        };

        if activated {
            if let Some(mut state) = self.states.get_mut(&key.agent_id) {
                if state.status == AgentStatus::Deployed {
                    state.status = AgentStatus::Active;
                }
            }
        }
        activated
    }

    /// Records progress on one deployment. Progress never moves backwards; a
    /// lower value only appends its logs. Reaching 100 completes the deployment
    /// and frees the agent, and repeating that on a finished deployment changes
    /// nothing. Unknown handles are a silent `false`.
    pub fn update_progress(&self, key: &DeploymentKey, progress: i64, logs: Vec<String>) -> bool {
        let completed_after_ms = {
            let mut deployment = match self.deployments.get_mut(key) {
                Some(d) => d,
                None => return false,
            };

            if !deployment.status.is_live() {
                return true;
            }

            let now = Utc::now();
            deployment.progress = deployment.progress.max(progress.clamp(0, 100) as u8);
            deployment.updated_at = Some(now);
            deployment.append_logs(logs);

            if progress >= 100 {
                deployment.status = DeploymentStatus::Completed;
                deployment.completed_at = Some(now);
                Some((now - deployment.deployed_at).num_milliseconds())
            } else {
                None
            }
        };

        if let Some(elapsed_ms) = completed_after_ms {
            self.release_agent(&key.agent_id, |metrics| {
                metrics.tasks_completed += 1;
                metrics.total_execution_ms += elapsed_ms;
            });
            tracing::info!("Deployment {} completed", key);
        }
        true
    }

    /// Recalls every live deployment of a project and returns the agent ids
    /// that were working on it. Completed deployments are left in place.
    pub fn recall(&self, project_id: &str) -> Vec<String> {
        let candidates: Vec<DeploymentKey> = self
            .deployments
            .iter()
            .filter(|d| d.project_id == project_id && d.status.is_live())
            .map(|d| d.key().clone())
            .collect();

        let mut recalled = Vec::new();
        for key in candidates {
            let removed = self
                .deployments
                .remove_if(&key, |_, d| d.project_id == project_id && d.status.is_live());

            if let Some((_, mut deployment)) = removed {
                deployment.status = DeploymentStatus::Recalled;
                deployment.recalled_at = Some(Utc::now());
                self.release_agent(&deployment.agent_id, |metrics| metrics.tasks_recalled += 1);
                recalled.push(deployment.agent_id);
            }
        }

        if !recalled.is_empty() {
            tracing::info!("Recalled {} agents from project {}", recalled.len(), project_id);
        }
        recalled
    }

    fn release_agent<F>(&self, agent_id: &str, record: F)
    where
        F: FnOnce(&mut PerformanceMetrics),
    {
        if let Some(mut state) = self.states.get_mut(agent_id) {
            state.load = state.load.saturating_sub(1);
            if state.load == 0 {
                state.status = AgentStatus::Available;
                state.current_task = None;
            }
            record(&mut state.performance);
            state.performance.refresh_success_rate();
        }
    }

    pub fn status_of(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let definition = self.definitions.get(agent_id)?;
        let state = self.states.get(agent_id)?.clone();

        let active_deployments = self
            .deployments
            .iter()
            .filter(|d| d.agent_id == agent_id && d.status.is_live())
            .count();

        Some(AgentSnapshot {
            definition: definition.clone(),
            status: state.status,
            current_task: state.current_task,
            load: state.load,
            performance: state.performance,
            active_deployments,
        })
    }

    pub fn all_statuses(&self) -> Vec<AgentSnapshot> {
        self.definitions
            .keys()
            .filter_map(|id| self.status_of(id))
            .collect()
    }

    pub fn active_agent_count(&self) -> usize {
        self.states.iter().filter(|s| s.status.is_busy()).count()
    }

    pub fn deployment(&self, key: &DeploymentKey) -> Option<Deployment> {
        self.deployments.get(key).map(|d| d.clone())
    }

    pub fn live_deployment_count(&self) -> usize {
        self.deployments.iter().filter(|d| d.status.is_live()).count()
    }

    /// Live deployment handles of a project, optionally narrowed to a set of agents.
    pub fn live_keys(&self, project_id: &str, agents: Option<&[String]>) -> Vec<DeploymentKey> {
        self.deployments
            .iter()
            .filter(|d| d.project_id == project_id && d.status.is_live())
            .filter(|d| agents.map_or(true, |ids| ids.contains(&d.agent_id)))
            .map(|d| d.key().clone())
            .collect()
    }

    /// Agents of a project that are assigned to the given step.
    pub fn step_agents(&self, project_id: &str, agents: &[String]) -> Vec<StepAgent> {
        let keys = self.live_keys(project_id, Some(agents));
        self.snapshot_step(&keys)
    }

    /// Moves the step's live deployments on a project to `progress` in
    /// lockstep with the workflow and returns their snapshots. Deployments
    /// finished by this call are still part of the returned snapshot.
    pub fn advance_step(
        &self,
        project_id: &str,
        agents: &[String],
        progress: u8,
        log: &str,
    ) -> Vec<StepAgent> {
        let keys = self.live_keys(project_id, Some(agents));
        for key in &keys {
            self.activate(key);
            self.update_progress(key, i64::from(progress), vec![log.to_string()]);
        }
        self.snapshot_step(&keys)
    }

    fn snapshot_step(&self, keys: &[DeploymentKey]) -> Vec<StepAgent> {
        let mut working: Vec<StepAgent> = keys
            .iter()
            .filter_map(|key| {
                let d = self.deployments.get(key)?;
                let definition = self.definitions.get(&d.agent_id)?;
                Some(StepAgent {
                    agent_id: d.agent_id.clone(),
                    name: definition.name.clone(),
                    role: definition.role.clone(),
                    status: d.status,
                    progress: d.progress,
                    current_task: d.task.clone(),
                })
            })
            .collect();
        working.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        working
    }

    /// Walks one deployment through the progress ladder in the background of
    /// the caller. Stops early once the deployment is recalled.
    pub async fn simulate_work(&self, key: &DeploymentKey, ticker: &TickPolicy, cancel: &CancellationToken) {
        if !self.activate(key) {
            return;
        }

        for progress in ticker.ladder() {
            let still_live = self
                .deployments
                .get(key)
                .map(|d| d.status.is_live())
                .unwrap_or(false);
            if !still_live {
                tracing::debug!("Simulation for {} ended early", key);
                break;
            }

            self.update_progress(
                key,
                i64::from(progress),
                vec![format!("Progress update: {}% complete", progress)],
            );

            if ticker.tick(cancel).await == Wake::Cancelled {
                break;
            }
        }
    }

    pub fn utilization(&self) -> BTreeMap<String, AgentUtilization> {
        self.definitions
            .keys()
            .filter_map(|id| {
                let state = self.states.get(id)?;
                Some((
                    id.clone(),
                    AgentUtilization {
                        status: state.status,
                        load: state.load,
                        tasks_completed: state.performance.tasks_completed,
                        success_rate: state.performance.success_rate,
                    },
                ))
            })
            .collect()
    }
}
