// [[MISSION]]/apps/kernel-server/src/executor.rs
// Purpose: Step execution and run summary collaborators. The runner only sees
//          the traits; backends are canned data or a remote agent service.
// Architecture: Integration Layer
// Dependencies: async-trait, reqwest

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::models::{
    ProjectSummary, Step, StepOutcome, StepResult, SummaryMetrics, WorkflowRun,
};

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, project_id: &str, step: &Step) -> KernelResult<StepResult>;
}

#[async_trait]
pub trait ProjectSummarizer: Send + Sync {
    /// Called once, when a run reaches `completed`.
    async fn summarize(&self, run: &WorkflowRun) -> KernelResult<ProjectSummary>;
}

/// Picks the backend named by the configuration: remote when an agent
/// endpoint is set, canned otherwise.
pub fn backend_from_config(
    config: &KernelConfig,
) -> KernelResult<(Arc<dyn StepExecutor>, Arc<dyn ProjectSummarizer>)> {
    match &config.agent_endpoint {
        Some(endpoint) => {
            let backend = Arc::new(RemoteBackend::new(endpoint)?);
            tracing::info!("Using remote step executor at {}", backend.endpoint());
            let executor: Arc<dyn StepExecutor> = backend.clone();
            let summarizer: Arc<dyn ProjectSummarizer> = backend;
            Ok((executor, summarizer))
        }
        None => {
            tracing::info!("Using canned step executor");
            let backend = Arc::new(CannedBackend);
            let executor: Arc<dyn StepExecutor> = backend.clone();
            let summarizer: Arc<dyn ProjectSummarizer> = backend;
            Ok((executor, summarizer))
        }
    }
}

fn summary_from_run(run: &WorkflowRun, artifacts: Vec<String>) -> ProjectSummary {
    let finished = run.end_time.unwrap_or_else(Utc::now);
    ProjectSummary {
        project_id: run.project_id.clone(),
        status: "completed".to_string(),
        completion_time: finished,
        artifacts_generated: artifacts,
        metrics: SummaryMetrics {
            total_steps: run.steps.len(),
            successful_steps: run.steps_completed(),
            agents_deployed: run.agents_used().len(),
            execution_time_ms: (finished - run.start_time).num_milliseconds().max(0),
        },
    }
}

// === CANNED ===

/// Synthetic results built from the step definition itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct CannedBackend;

#[async_trait]
impl StepExecutor for CannedBackend {
    async fn execute(&self, _project_id: &str, step: &Step) -> KernelResult<StepResult> {
        Ok(StepResult {
            step_id: step.id.clone(),
            status: StepOutcome::Completed,
            duration: Some(
                step.estimated_duration
                    .clone()
                    .unwrap_or_else(|| "1-2 minutes".to_string()),
            ),
            outputs: step.outputs.clone(),
            agents_used: step.agents.clone(),
            logs: vec![
                format!("Step {} initiated", step.id),
                format!("Agents deployed: {}", step.agents.join(", ")),
                format!("Processing {}", step.description),
                format!("Step {} completed successfully", step.id),
            ],
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl ProjectSummarizer for CannedBackend {
    async fn summarize(&self, run: &WorkflowRun) -> KernelResult<ProjectSummary> {
        Ok(summary_from_run(run, run.outputs()))
    }
}

// === REMOTE ===

#[derive(Serialize)]
struct ExecutePayload<'a> {
    project_id: &'a str,
    step: &'a Step,
}

/// Agent service speaking JSON over HTTP: `POST /execute` answers with a
/// `StepResult`, `POST /summarize` with a `ProjectSummary`.
pub struct RemoteBackend {
    endpoint: String,
    http_client: reqwest::Client,
}

impl RemoteBackend {
    pub fn new(endpoint: &str) -> KernelResult<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| KernelError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> KernelResult<R>
    where
        B: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoint, path);
        tracing::debug!("Sending agent request to: {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl StepExecutor for RemoteBackend {
    async fn execute(&self, project_id: &str, step: &Step) -> KernelResult<StepResult> {
        self.post("execute", &ExecutePayload { project_id, step }).await
    }
}

#[async_trait]
impl ProjectSummarizer for RemoteBackend {
    async fn summarize(&self, run: &WorkflowRun) -> KernelResult<ProjectSummary> {
        self.post("summarize", run).await
    }
}
