// [[MISSION]]/apps/kernel-server/src/store.rs
// Purpose: Project records. The kernel only checks existence and appends
//          run statistics; everything else is plain bookkeeping.
// Architecture: Persistence Collaborator
// Dependencies: async-trait, DashMap, redis, Serde

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{KernelError, KernelResult};
use crate::models::RunStatus;

const PROJECT_INDEX_KEY: &str = "sys:projects";

fn default_project_type() -> String {
    "greenfield-fullstack".to_string()
}

fn default_agent_team() -> String {
    "team-fullstack".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_project_type")]
    pub project_type: String,
    #[serde(default, alias = "techStack")]
    pub tech_stack: BTreeMap<String, String>,
    #[serde(default = "default_agent_team", alias = "agentTeam")]
    pub agent_team: String,
    #[serde(default)]
    pub objectives: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectMetrics {
    pub workflows_executed: u64,
    pub agents_deployed: u64,
}

/// What one finished run contributed to its project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agents_used: Vec<String>,
    pub steps_completed: usize,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub project_type: String,
    pub tech_stack: BTreeMap<String, String>,
    pub agent_team: String,
    pub objectives: Vec<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workflow_history: Vec<WorkflowExecution>,
    pub metrics: ProjectMetrics,
}

impl ProjectRecord {
    pub fn new(id: &str, config: ProjectConfig) -> Self {
        let now = Utc::now();
        let name = if config.name.trim().is_empty() {
            format!("Project-{}", id)
        } else {
            config.name
        };
        Self {
            id: id.to_string(),
            name,
            description: config.description,
            project_type: config.project_type,
            tech_stack: config.tech_stack,
            agent_team: config.agent_team,
            objectives: config.objectives,
            status: "created".to_string(),
            created_at: now,
            updated_at: now,
            workflow_history: Vec::new(),
            metrics: ProjectMetrics::default(),
        }
    }

    /// Eight-character id, short enough for URLs.
    pub fn short_id() -> String {
        Uuid::new_v4().simple().to_string()[..8].to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectStats {
    pub total_projects: usize,
    pub status_distribution: BTreeMap<String, usize>,
    pub type_distribution: BTreeMap<String, usize>,
    pub team_distribution: BTreeMap<String, usize>,
    pub total_workflows_executed: u64,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Conflict when the id is taken.
    async fn create(&self, record: ProjectRecord) -> KernelResult<ProjectRecord>;
    async fn get(&self, project_id: &str) -> KernelResult<Option<ProjectRecord>>;
    /// NotFound when the record does not exist.
    async fn update(&self, record: ProjectRecord) -> KernelResult<()>;
    async fn delete(&self, project_id: &str) -> KernelResult<bool>;
    async fn list(&self) -> KernelResult<Vec<ProjectRecord>>;

    async fn exists(&self, project_id: &str) -> KernelResult<bool> {
        Ok(self.get(project_id).await?.is_some())
    }
}

/// Appends a run to the project's history and bumps its counters.
pub async fn record_workflow_execution(
    store: &dyn ProjectStore,
    project_id: &str,
    execution: WorkflowExecution,
) -> KernelResult<()> {
    let mut project = store
        .get(project_id)
        .await?
        .ok_or_else(|| KernelError::NotFound(format!("project not found: {}", project_id)))?;

    project.status = execution.status.to_string();
    project.metrics.workflows_executed += 1;
    project.metrics.agents_deployed += execution.agents_used.len() as u64;
    project.workflow_history.push(execution);
    project.updated_at = Utc::now();
    store.update(project).await
}

pub async fn project_stats(store: &dyn ProjectStore) -> KernelResult<ProjectStats> {
    let projects = store.list().await?;
    let mut stats = ProjectStats {
        total_projects: projects.len(),
        status_distribution: BTreeMap::new(),
        type_distribution: BTreeMap::new(),
        team_distribution: BTreeMap::new(),
        total_workflows_executed: 0,
    };

    for project in &projects {
        *stats.status_distribution.entry(project.status.clone()).or_insert(0) += 1;
        *stats.type_distribution.entry(project.project_type.clone()).or_insert(0) += 1;
        *stats.team_distribution.entry(project.agent_team.clone()).or_insert(0) += 1;
        stats.total_workflows_executed += project.metrics.workflows_executed;
    }
    Ok(stats)
}

// === IN-MEMORY ===

#[derive(Default)]
pub struct InMemoryProjectStore {
    projects: DashMap<String, ProjectRecord>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn create(&self, record: ProjectRecord) -> KernelResult<ProjectRecord> {
        use dashmap::mapref::entry::Entry;
        match self.projects.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(KernelError::Conflict(format!(
                "project already exists: {}",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn get(&self, project_id: &str) -> KernelResult<Option<ProjectRecord>> {
        Ok(self.projects.get(project_id).map(|p| p.clone()))
    }

    async fn update(&self, record: ProjectRecord) -> KernelResult<()> {
        match self.projects.get_mut(&record.id) {
            Some(mut existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(KernelError::NotFound(format!("project not found: {}", record.id))),
        }
    }

    async fn delete(&self, project_id: &str) -> KernelResult<bool> {
        Ok(self.projects.remove(project_id).is_some())
    }

    async fn list(&self) -> KernelResult<Vec<ProjectRecord>> {
        let mut projects: Vec<ProjectRecord> =
            self.projects.iter().map(|p| p.value().clone()).collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }
}

// === REDIS ===

pub struct RedisProjectStore {
    client: redis::Client,
}

impl RedisProjectStore {
    pub fn open(url: &str) -> KernelResult<Self> {
        let client = redis::Client::open(url)?;
        tracing::info!("Redis project store initialized: {}", url);
        Ok(Self { client })
    }

    fn project_key(project_id: &str) -> String {
        format!("project:{}", project_id)
    }

    async fn connection(&self) -> KernelResult<redis::aio::Connection> {
        Ok(self.client.get_async_connection().await?)
    }
}

#[async_trait]
impl ProjectStore for RedisProjectStore {
    async fn create(&self, record: ProjectRecord) -> KernelResult<ProjectRecord> {
        let json = serde_json::to_string(&record)?;
        let mut con = self.connection().await?;

        let created: bool = con.set_nx(Self::project_key(&record.id), json).await?;
        if !created {
            return Err(KernelError::Conflict(format!("project already exists: {}", record.id)));
        }
        con.sadd::<_, _, ()>(PROJECT_INDEX_KEY, &record.id).await?;
        Ok(record)
    }

    async fn get(&self, project_id: &str) -> KernelResult<Option<ProjectRecord>> {
        let mut con = self.connection().await?;
        let data: Option<String> = con.get(Self::project_key(project_id)).await?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, record: ProjectRecord) -> KernelResult<()> {
        let json = serde_json::to_string(&record)?;
        let mut con = self.connection().await?;

        let replaced: bool = redis::cmd("SET")
            .arg(Self::project_key(&record.id))
            .arg(json)
            .arg("XX")
            .query_async::<_, Option<String>>(&mut con)
            .await?
            .is_some();
        if !replaced {
            return Err(KernelError::NotFound(format!("project not found: {}", record.id)));
        }
        Ok(())
    }

    async fn delete(&self, project_id: &str) -> KernelResult<bool> {
        let mut con = self.connection().await?;
        let removed: usize = con.del(Self::project_key(project_id)).await?;
        con.srem::<_, _, ()>(PROJECT_INDEX_KEY, project_id).await?;
        Ok(removed > 0)
    }

    async fn list(&self) -> KernelResult<Vec<ProjectRecord>> {
        let mut con = self.connection().await?;
        let ids: Vec<String> = con.smembers(PROJECT_INDEX_KEY).await?;

        let mut projects = Vec::with_capacity(ids.len());
        for project_id in ids {
            let data: Option<String> = con.get(Self::project_key(&project_id)).await?;
            match data.map(|json| serde_json::from_str::<ProjectRecord>(&json)) {
                Some(Ok(project)) => projects.push(project),
                Some(Err(e)) => tracing::error!("Skipping unreadable project {}: {}", project_id, e),
                None => tracing::warn!("Project index lists missing record {}", project_id),
            }
        }
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ProjectConfig {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    #[test]
    fn test_config_accepts_camel_case_aliases() {
        let aliased: ProjectConfig = serde_json::from_str(
            r#"{"name":"Atlas","type":"brownfield-ui","techStack":{"frontend":"svelte"},"agentTeam":"team-frontend"}"#,
        )
        .unwrap();
        assert_eq!(aliased.project_type, "brownfield-ui");
        assert_eq!(aliased.tech_stack["frontend"], "svelte");
        assert_eq!(aliased.agent_team, "team-frontend");

        let defaults = config("Defaults");
        assert_eq!(defaults.project_type, "greenfield-fullstack");
        assert_eq!(defaults.agent_team, "team-fullstack");
    }

    #[test]
    fn test_short_ids_are_eight_chars() {
        let id = ProjectRecord::short_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, ProjectRecord::short_id());
        assert_eq!(ProjectRecord::new("abc", config(" ")).name, "Project-abc");
    }

    #[tokio::test]
    async fn test_in_memory_crud() {
        let store = InMemoryProjectStore::new();
        let record = ProjectRecord::new("p1", config("Atlas"));
        store.create(record.clone()).await.unwrap();

        assert_eq!(
            store.create(record.clone()).await.unwrap_err().kind(),
            "conflict"
        );
        assert!(store.exists("p1").await.unwrap());

        let mut updated = record.clone();
        updated.status = "running".into();
        store.update(updated).await.unwrap();
        assert_eq!(store.get("p1").await.unwrap().unwrap().status, "running");

        let ghost = ProjectRecord::new("ghost", config("Ghost"));
        assert_eq!(store.update(ghost).await.unwrap_err().kind(), "not_found");

        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.delete("p1").await.unwrap());
        assert!(!store.delete("p1").await.unwrap());
        assert!(store.get("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_workflow_execution_updates_metrics() {
        let store = InMemoryProjectStore::new();
        store.create(ProjectRecord::new("p1", config("Atlas"))).await.unwrap();

        let execution = WorkflowExecution {
            run_id: Uuid::new_v4(),
            status: RunStatus::Completed,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            agents_used: vec!["pm".into(), "dev".into()],
            steps_completed: 2,
            outputs: vec!["requirements.md".into()],
        };
        record_workflow_execution(&store, "p1", execution).await.unwrap();

        let project = store.get("p1").await.unwrap().unwrap();
        assert_eq!(project.status, "completed");
        assert_eq!(project.metrics.workflows_executed, 1);
        assert_eq!(project.metrics.agents_deployed, 2);
        assert_eq!(project.workflow_history.len(), 1);

        let stats = project_stats(&store).await.unwrap();
        assert_eq!(stats.total_projects, 1);
        assert_eq!(stats.status_distribution["completed"], 1);
        assert_eq!(stats.total_workflows_executed, 1);
    }

    #[test]
    fn test_redis_keys() {
        assert_eq!(RedisProjectStore::project_key("p1"), "project:p1");
        assert!(RedisProjectStore::open("not a url").is_err());
    }
}
