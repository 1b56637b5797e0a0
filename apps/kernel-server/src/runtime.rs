// [[MISSION]]/apps/kernel-server/src/runtime.rs
// Purpose: Owns the kernel's shared state and wires the collaborators together.
//          Built once at boot, torn down by `shutdown()`.
// Architecture: Application Core
// Dependencies: tokio-util, redis, reqwest (through store/executor)

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::events::KernelEvent;
use crate::executor::{backend_from_config, ProjectSummarizer, StepExecutor};
use crate::hub::NotificationHub;
use crate::ledger::DeploymentLedger;
use crate::models::*;
use crate::pool::AgentPool;
use crate::store::{
    project_stats, InMemoryProjectStore, ProjectConfig, ProjectRecord, ProjectStats,
    ProjectStore, RedisProjectStore,
};
use crate::ticker::TickPolicy;
use crate::workflow::{RunnerSettings, WorkflowRunner};

fn default_task() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub project_id: String,
    pub agent_ids: Vec<String>,
    #[serde(default = "default_task")]
    pub task: String,
    /// Walk each deployed agent through the progress ladder on its own.
    #[serde(default)]
    pub simulate: bool,
}

pub struct KernelRuntime {
    config: KernelConfig,
    pub pool: Arc<AgentPool>,
    pub ledger: DeploymentLedger,
    pub runner: Arc<WorkflowRunner>,
    pub hub: Arc<NotificationHub>,
    pub store: Arc<dyn ProjectStore>,
    started_at: DateTime<Utc>,
    projects_created: AtomicU64,
    shutdown: CancellationToken,
}

impl KernelRuntime {
    pub fn new(
        config: KernelConfig,
        store: Arc<dyn ProjectStore>,
        executor: Arc<dyn StepExecutor>,
        summarizer: Arc<dyn ProjectSummarizer>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let pool = Arc::new(AgentPool::with_default_roster());
        let hub = Arc::new(NotificationHub::new());
        let ledger = DeploymentLedger::new(pool.clone());
        let runner = Arc::new(WorkflowRunner::new(
            pool.clone(),
            hub.clone(),
            executor,
            summarizer,
            store.clone(),
            RunnerSettings::from_config(&config),
            shutdown.clone(),
        ));

        Self {
            config,
            pool,
            ledger,
            runner,
            hub,
            store,
            started_at: Utc::now(),
            projects_created: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Redis-backed projects when `REDIS_URL` is usable, in-memory otherwise.
    pub fn from_config(config: KernelConfig) -> KernelResult<Self> {
        let store: Arc<dyn ProjectStore> = match &config.redis_url {
            Some(url) => match RedisProjectStore::open(url) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    tracing::warn!("Failed to create Redis client: {}. Persistence disabled.", e);
                    Arc::new(InMemoryProjectStore::new())
                }
            },
            None => {
                tracing::warn!("REDIS_URL not set. Running without persistence.");
                Arc::new(InMemoryProjectStore::new())
            }
        };
        let (executor, summarizer) = backend_from_config(&config)?;
        Ok(Self::new(config, store, executor, summarizer))
    }

    // === PROJECTS ===

    pub async fn create_project(&self, config: ProjectConfig) -> KernelResult<ProjectRecord> {
        let record = ProjectRecord::new(&ProjectRecord::short_id(), config);
        let record = self.store.create(record).await?;
        self.projects_created.fetch_add(1, Ordering::Relaxed);

        tracing::info!("Created project {} ({})", record.id, record.name);
        self.hub.broadcast(KernelEvent::ProjectCreated {
            project_id: record.id.clone(),
            name: record.name.clone(),
        });
        Ok(record)
    }

    pub async fn project(&self, project_id: &str) -> KernelResult<ProjectRecord> {
        self.store
            .get(project_id)
            .await?
            .ok_or_else(|| KernelError::NotFound(format!("project not found: {}", project_id)))
    }

    pub async fn list_projects(&self) -> KernelResult<Vec<ProjectRecord>> {
        self.store.list().await
    }

    /// Refused while the project has a live workflow.
    pub async fn delete_project(&self, project_id: &str) -> KernelResult<()> {
        if let Ok(run) = self.runner.status_of(project_id) {
            if !run.status.is_terminal() {
                return Err(KernelError::Conflict(format!(
                    "workflow {} for project: {}",
                    run.status, project_id
                )));
            }
        }
        if !self.store.delete(project_id).await? {
            return Err(KernelError::NotFound(format!("project not found: {}", project_id)));
        }
        if self.runner.forget(project_id) {
            tracing::debug!("Dropped finished workflow of project {}", project_id);
        }
        tracing::info!("Deleted project {}", project_id);
        Ok(())
    }

    pub async fn project_stats(&self) -> KernelResult<ProjectStats> {
        project_stats(self.store.as_ref()).await
    }

    // === AGENTS ===

    pub fn deploy_agents(&self, request: DeployRequest) -> KernelResult<BatchResult> {
        let result =
            self.ledger
                .deploy_batch(&request.project_id, &request.agent_ids, &request.task)?;

        self.hub.broadcast(KernelEvent::AgentsDeployed {
            project_id: request.project_id.clone(),
            deployment_id: result.deployment_id.clone(),
            deployed: result.deployed.iter().map(|d| d.agent_id.clone()).collect(),
            failed: result.failed.clone(),
        });

        if request.simulate {
            let ticker = TickPolicy::from_config(&self.config);
            for deployment in &result.deployed {
                let pool = self.pool.clone();
                let key = deployment.key();
                let ticker = ticker.clone();
                let cancel = self.shutdown.clone();
                tokio::spawn(async move {
                    pool.simulate_work(&key, &ticker, &cancel).await;
                });
            }
        }
        Ok(result)
    }

    pub fn update_progress(
        &self,
        key: &DeploymentKey,
        progress: i64,
        logs: Vec<String>,
    ) -> KernelResult<Deployment> {
        if !self.pool.update_progress(key, progress, logs) {
            return Err(KernelError::NotFound(format!("deployment not found: {}", key)));
        }
        self.pool
            .deployment(key)
            .ok_or_else(|| KernelError::NotFound(format!("deployment not found: {}", key)))
    }

    pub fn recall_agents(&self, project_id: &str) -> Vec<String> {
        let recalled = self.pool.recall(project_id);
        self.hub.broadcast(KernelEvent::AgentsRecalled {
            project_id: project_id.to_string(),
            recalled: recalled.clone(),
        });
        recalled
    }

    pub fn agent(&self, agent_id: &str) -> KernelResult<AgentSnapshot> {
        self.pool
            .status_of(agent_id)
            .ok_or_else(|| KernelError::NotFound(format!("agent not found in pool: {}", agent_id)))
    }

    pub fn orchestrator_stats(&self) -> OrchestratorStats {
        self.ledger.stats()
    }

    // === SYSTEM ===

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            status: if self.shutdown.is_cancelled() { "stopping" } else { "operational" }
                .to_string(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            active_workflows: self.runner.active_count(),
            active_agents: self.pool.active_agent_count(),
            projects_created: self.projects_created.load(Ordering::Relaxed),
            workflows_executed: self.runner.workflows_started(),
            connections: self.hub.connection_count(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Stops live runs, wakes sleeping loops and closes every observer.
    pub async fn shutdown(&self) {
        let stopped = self.runner.stop_all().await;
        self.shutdown.cancel();
        let closed = self.hub.disconnect_all();
        tracing::info!(
            "Kernel shut down: {} workflows stopped, {} observers closed",
            stopped,
            closed
        );
    }
}
