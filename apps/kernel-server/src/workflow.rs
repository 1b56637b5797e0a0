// [[MISSION]]/apps/kernel-server/src/workflow.rs
// Purpose: Per-project workflow state machine and its background execution loop.
// Architecture: Core Orchestration Layer
// Dependencies: tokio, tokio-util, DashMap
//
// Every status check that gates an emission happens under the run's map entry,
// and emission itself never awaits. Once `workflow_stopped` or
// `workflow_paused` has gone out, no step event of that run can follow it
// until the run is resumed.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::events::KernelEvent;
use crate::executor::{ProjectSummarizer, StepExecutor};
use crate::hub::NotificationHub;
use crate::models::*;
use crate::pool::AgentPool;
use crate::store::{record_workflow_execution, ProjectStore, WorkflowExecution};
use crate::ticker::{TickPolicy, Wake};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub ticker: TickPolicy,
    pub step_timeout: Duration,
    pub stop_grace: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            ticker: TickPolicy::from_config(config),
            step_timeout: config.step_timeout(),
            stop_grace: config.stop_grace(),
        }
    }
}

struct ActiveRun {
    run: WorkflowRun,
    /// Mirrors `run.status` so the loop can sleep until it changes.
    control: watch::Sender<RunStatus>,
}

impl ActiveRun {
    fn transition(&mut self, next: RunStatus) -> bool {
        if !self.run.status.can_transition_to(next) {
            return false;
        }
        self.run.status = next;
        if next.is_terminal() {
            self.run.end_time = Some(Utc::now());
        }
        self.control.send_replace(next);
        true
    }

    fn execution(&self) -> WorkflowExecution {
        WorkflowExecution {
            run_id: self.run.run_id,
            status: self.run.status,
            started_at: self.run.start_time,
            completed_at: self.run.end_time,
            agents_used: self.run.agents_used(),
            steps_completed: self.run.steps_completed(),
            outputs: self.run.outputs(),
        }
    }
}

pub struct WorkflowRunner {
    runs: DashMap<String, ActiveRun>,
    pool: Arc<AgentPool>,
    hub: Arc<NotificationHub>,
    executor: Arc<dyn StepExecutor>,
    summarizer: Arc<dyn ProjectSummarizer>,
    store: Arc<dyn ProjectStore>,
    settings: RunnerSettings,
    shutdown: CancellationToken,
    workflows_started: AtomicU64,
}

fn no_workflow(project_id: &str) -> KernelError {
    KernelError::NotFound(format!("no workflow for project: {}", project_id))
}

impl WorkflowRunner {
    pub fn new(
        pool: Arc<AgentPool>,
        hub: Arc<NotificationHub>,
        executor: Arc<dyn StepExecutor>,
        summarizer: Arc<dyn ProjectSummarizer>,
        store: Arc<dyn ProjectStore>,
        settings: RunnerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runs: DashMap::new(),
            pool,
            hub,
            executor,
            summarizer,
            store,
            settings,
            shutdown,
            workflows_started: AtomicU64::new(0),
        }
    }

    /// Creates the run and spawns its loop. Without a template the default
    /// five-step methodology is used.
    pub async fn start(
        self: &Arc<Self>,
        project_id: &str,
        template: Option<WorkflowTemplate>,
    ) -> KernelResult<WorkflowRun> {
        let mut template = template.unwrap_or_default();
        self.validate(project_id, &template)?;

        if !self.store.exists(project_id).await? {
            return Err(KernelError::NotFound(format!("project not found: {}", project_id)));
        }

        for step in &mut template.steps {
            step.status = StepStatus::Pending;
            step.result = None;
        }
        let run = WorkflowRun::new(project_id, template);
        let (control, status_rx) = watch::channel(RunStatus::Running);
        let active = ActiveRun {
            run: run.clone(),
            control,
        };

        // Check-and-insert in one entry lock: two concurrent starts cannot both win.
        match self.runs.entry(project_id.to_string()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().run.status.is_terminal() {
                    return Err(KernelError::Conflict(format!(
                        "workflow already running for project: {}",
                        project_id
                    )));
                }
                existing.insert(active);
            }
            Entry::Vacant(slot) => {
                slot.insert(active);
            }
        }
        self.workflows_started.fetch_add(1, Ordering::Relaxed);

        let runner = Arc::clone(self);
        let project = project_id.to_string();
        let run_id = run.run_id;
        tokio::spawn(async move {
            runner.run_loop(project, run_id, status_rx).await;
        });

        tracing::info!(
            "Workflow {} started for project {} ({} steps)",
            run.run_id,
            project_id,
            run.steps.len()
        );
        Ok(run)
    }

    fn validate(&self, project_id: &str, template: &WorkflowTemplate) -> KernelResult<()> {
        if project_id.trim().is_empty() {
            return Err(KernelError::Validation("project id must not be empty".into()));
        }
        if template.steps.is_empty() {
            return Err(KernelError::Validation("workflow needs at least one step".into()));
        }

        let mut seen = HashSet::new();
        for step in &template.steps {
            if step.id.trim().is_empty() {
                return Err(KernelError::Validation("step id must not be empty".into()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(KernelError::Validation(format!("duplicate step id: {}", step.id)));
            }
            if let Some(unknown) = step.agents.iter().find(|a| self.pool.definition(a).is_none()) {
                return Err(KernelError::Validation(format!(
                    "unknown agent {} in step {}",
                    unknown, step.id
                )));
            }
        }
        Ok(())
    }

    /// Running -> paused. Anything else is left alone.
    pub fn pause(&self, project_id: &str) -> KernelResult<WorkflowRun> {
        let mut active = self.runs.get_mut(project_id).ok_or_else(|| no_workflow(project_id))?;

        if active.run.status == RunStatus::Running && active.transition(RunStatus::Paused) {
            self.hub.broadcast(KernelEvent::WorkflowPaused {
                project_id: project_id.to_string(),
            });
            tracing::info!("Workflow paused for project {}", project_id);
        }
        Ok(active.run.clone())
    }

    pub fn resume(&self, project_id: &str) -> KernelResult<WorkflowRun> {
        let mut active = self.runs.get_mut(project_id).ok_or_else(|| no_workflow(project_id))?;

        match active.run.status {
            RunStatus::Paused => {
                active.transition(RunStatus::Running);
                self.hub.broadcast(KernelEvent::WorkflowResumed {
                    project_id: project_id.to_string(),
                });
                tracing::info!("Workflow resumed for project {}", project_id);
            }
            RunStatus::Running => {}
            status => {
                return Err(KernelError::Conflict(format!("workflow already {}", status)));
            }
        }
        Ok(active.run.clone())
    }

    /// Stops a live run. The entry stays visible for the grace delay, then is
    /// dropped unless a newer run has taken its place.
    pub async fn stop(self: &Arc<Self>, project_id: &str) -> KernelResult<WorkflowRun> {
        let (snapshot, execution) = {
            let mut active =
                self.runs.get_mut(project_id).ok_or_else(|| no_workflow(project_id))?;
            if !active.transition(RunStatus::Stopped) {
                return Err(KernelError::Conflict(format!(
                    "workflow already {}",
                    active.run.status
                )));
            }
            self.hub.broadcast(KernelEvent::WorkflowStopped {
                project_id: project_id.to_string(),
            });
            (active.run.clone(), active.execution())
        };
        tracing::info!("Workflow {} stopped for project {}", snapshot.run_id, project_id);

        self.record(project_id, execution).await;
        self.schedule_removal(project_id, snapshot.run_id);
        Ok(snapshot)
    }

    fn schedule_removal(self: &Arc<Self>, project_id: &str, run_id: Uuid) {
        let runner = Arc::clone(self);
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(runner.settings.stop_grace).await;
            let removed = runner.runs.remove_if(&project_id, |_, active| {
                active.run.run_id == run_id && active.run.status == RunStatus::Stopped
            });
            if removed.is_some() {
                tracing::debug!("Removed stopped workflow {} for project {}", run_id, project_id);
            }
        });
    }

    /// Stops every live run, returning how many were stopped.
    pub async fn stop_all(self: &Arc<Self>) -> usize {
        let live: Vec<String> = self
            .runs
            .iter()
            .filter(|active| !active.run.status.is_terminal())
            .map(|active| active.key().clone())
            .collect();

        let mut stopped = 0;
        for project_id in live {
            if self.stop(&project_id).await.is_ok() {
                stopped += 1;
            }
        }
        stopped
    }

    /// Drops a finished run of a project. Live runs are kept.
    pub fn forget(&self, project_id: &str) -> bool {
        self.runs
            .remove_if(project_id, |_, active| active.run.status.is_terminal())
            .is_some()
    }

    pub fn status_of(&self, project_id: &str) -> KernelResult<WorkflowRun> {
        self.runs
            .get(project_id)
            .map(|active| active.run.clone())
            .ok_or_else(|| no_workflow(project_id))
    }

    /// Runs that are running or paused.
    pub fn active_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|active| !active.run.status.is_terminal())
            .count()
    }

    pub fn workflows_started(&self) -> u64 {
        self.workflows_started.load(Ordering::Relaxed)
    }

    // === EXECUTION LOOP ===

    async fn run_loop(
        self: Arc<Self>,
        project_id: String,
        run_id: Uuid,
        mut status: watch::Receiver<RunStatus>,
    ) {
        if let Err(e) = self.drive(&project_id, run_id, &mut status).await {
            tracing::error!("Workflow {} for project {} failed: {}", run_id, project_id, e);
            self.fail(&project_id, run_id, &e).await;
        }
        tracing::debug!("Workflow loop {} for project {} exited", run_id, project_id);
    }

    async fn drive(
        &self,
        project_id: &str,
        run_id: Uuid,
        status: &mut watch::Receiver<RunStatus>,
    ) -> KernelResult<()> {
        let step_count = match self.runs.get(project_id) {
            Some(active) if active.run.run_id == run_id => active.run.steps.len(),
            _ => return Ok(()),
        };

        for index in 0..step_count {
            let started = self
                .while_running(project_id, run_id, status, |active| {
                    active.run.current_step = index;
                    let step = &mut active.run.steps[index];
                    step.status = StepStatus::Running;
                    let step = step.clone();
                    self.hub.broadcast_to_project(
                        project_id,
                        KernelEvent::StepStarted {
                            project_id: project_id.to_string(),
                            step_index: index,
                            step: step.clone(),
                        },
                    );
                    step
                })
                .await;
            let step = match started {
                Some(step) => step,
                None => return Ok(()),
            };
            tracing::info!("Project {} step {} ({}) started", project_id, index, step.id);

            let result = self.execute_step(project_id, &step).await?;

            for progress in self.settings.ticker.ladder() {
                let log = format!("{}: {}% complete", step.name, progress);
                let emitted = self
                    .while_running(project_id, run_id, status, |_| {
                        let agents = self.pool.advance_step(project_id, &step.agents, progress, &log);
                        self.hub.broadcast_to_project(
                            project_id,
                            KernelEvent::StepProgress {
                                project_id: project_id.to_string(),
                                step_index: index,
                                progress,
                                agents,
                            },
                        );
                    })
                    .await;
                if emitted.is_none() {
                    return Ok(());
                }
                if self.settings.ticker.pace(status, &self.shutdown).await == Wake::Cancelled {
                    return Ok(());
                }
            }

            let completed = self
                .while_running(project_id, run_id, status, |active| {
                    let slot = &mut active.run.steps[index];
                    slot.status = StepStatus::Completed;
                    slot.result = Some(result.clone());
                    self.hub.broadcast_to_project(
                        project_id,
                        KernelEvent::StepCompleted {
                            project_id: project_id.to_string(),
                            step_index: index,
                            result: result.clone(),
                        },
                    );
                })
                .await;
            if completed.is_none() {
                return Ok(());
            }

            if index + 1 < step_count
                && self.settings.ticker.settle(status, &self.shutdown).await == Wake::Cancelled
            {
                return Ok(());
            }
        }

        self.complete(project_id, run_id, status).await
    }

    async fn execute_step(&self, project_id: &str, step: &Step) -> KernelResult<StepResult> {
        let timeout = self.settings.step_timeout;
        let result = tokio::time::timeout(timeout, self.executor.execute(project_id, step))
            .await
            .map_err(|_| {
                KernelError::Timeout(format!(
                    "step {} timed out after {}ms",
                    step.id,
                    timeout.as_millis()
                ))
            })??;

        match result.status {
            StepOutcome::Completed => Ok(result),
            StepOutcome::Failed => {
                let reason = result.logs.last().cloned().unwrap_or_default();
                Err(KernelError::Internal(format!("step {} failed: {}", step.id, reason)))
            }
        }
    }

    async fn complete(
        &self,
        project_id: &str,
        run_id: Uuid,
        status: &mut watch::Receiver<RunStatus>,
    ) -> KernelResult<()> {
        let mut snapshot = match self
            .while_running(project_id, run_id, status, |active| active.run.clone())
            .await
        {
            Some(run) => run,
            None => return Ok(()),
        };
        snapshot.end_time = Some(Utc::now());

        let summary = tokio::time::timeout(
            self.settings.step_timeout,
            self.summarizer.summarize(&snapshot),
        )
        .await
        .map_err(|_| KernelError::Timeout("project summary timed out".into()))??;

        let execution = self
            .while_running(project_id, run_id, status, |active| {
                active.transition(RunStatus::Completed);
                self.hub.broadcast(KernelEvent::WorkflowCompleted {
                    project_id: project_id.to_string(),
                    final_result: summary.clone(),
                });
                active.execution()
            })
            .await;

        if let Some(execution) = execution {
            tracing::info!("Workflow {} completed for project {}", run_id, project_id);
            self.record(project_id, execution).await;
        }
        Ok(())
    }

    async fn fail(&self, project_id: &str, run_id: Uuid, error: &KernelError) {
        let execution = self.runs.get_mut(project_id).and_then(|mut active| {
            if active.run.run_id != run_id || !active.transition(RunStatus::Error) {
                return None;
            }
            let index = active.run.current_step;
            if let Some(step) = active.run.steps.get_mut(index) {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Error;
                }
            }
            active.run.error = Some(error.to_string());
            self.hub.broadcast(KernelEvent::WorkflowError {
                project_id: project_id.to_string(),
                error: error.to_string(),
            });
            Some(active.execution())
        });

        if let Some(execution) = execution {
            self.record(project_id, execution).await;
        }
    }

    async fn record(&self, project_id: &str, execution: WorkflowExecution) {
        if let Err(e) = record_workflow_execution(self.store.as_ref(), project_id, execution).await {
            tracing::warn!("Could not record workflow history for {}: {}", project_id, e);
        }
    }

    /// Applies `f` to the run while it is running, holding its entry for the
    /// duration. `None` means the run is gone, replaced or not running.
    fn with_running<T, F>(&self, project_id: &str, run_id: Uuid, f: F) -> Option<T>
    where
        F: FnOnce(&mut ActiveRun) -> T,
    {
        let mut active = self.runs.get_mut(project_id)?;
        if active.run.run_id != run_id || active.run.status != RunStatus::Running {
            return None;
        }
        Some(f(active.value_mut()))
    }

    /// Like `with_running`, but sits out a pause instead of giving up.
    async fn while_running<T, F>(
        &self,
        project_id: &str,
        run_id: Uuid,
        status: &mut watch::Receiver<RunStatus>,
        mut f: F,
    ) -> Option<T>
    where
        F: FnMut(&mut ActiveRun) -> T,
    {
        loop {
            if let Some(value) = self.with_running(project_id, run_id, &mut f) {
                return Some(value);
            }
            if !self.await_running(status).await {
                return None;
            }
        }
    }

    /// Waits out a pause. False once the run is terminal, replaced or the
    /// kernel is shutting down.
    async fn await_running(&self, status: &mut watch::Receiver<RunStatus>) -> bool {
        loop {
            let current = *status.borrow_and_update();
            match current {
                RunStatus::Running => return true,
                RunStatus::Paused => {}
                _ => return false,
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                changed = status.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CannedBackend;
    use crate::hub::ObserverHandle;
    use crate::store::{InMemoryProjectStore, ProjectConfig, ProjectRecord};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Notify};

    struct Harness {
        runner: Arc<WorkflowRunner>,
        pool: Arc<AgentPool>,
        store: Arc<InMemoryProjectStore>,
        events: mpsc::Receiver<String>,
    }

    fn settings(tick_ms: u64) -> RunnerSettings {
        RunnerSettings {
            ticker: TickPolicy::new(Duration::from_millis(tick_ms), Duration::from_millis(tick_ms)),
            step_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(50),
        }
    }

    async fn harness(executor: Arc<dyn StepExecutor>, settings: RunnerSettings) -> Harness {
        let pool = Arc::new(AgentPool::with_default_roster());
        let hub = Arc::new(NotificationHub::new());
        let store = Arc::new(InMemoryProjectStore::new());
        let config: ProjectConfig =
            serde_json::from_value(serde_json::json!({ "name": "Atlas" })).unwrap();
        store.create(ProjectRecord::new("p1", config)).await.unwrap();

        let (handle, mut events) = ObserverHandle::channel();
        let observer = hub.subscribe(handle);
        hub.subscribe_to_project(observer, "p1").unwrap();
        // connection_established + subscription_confirmed
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        let runner = Arc::new(WorkflowRunner::new(
            pool.clone(),
            hub,
            executor,
            Arc::new(CannedBackend),
            store.clone(),
            settings,
            CancellationToken::new(),
        ));
        Harness {
            runner,
            pool,
            store,
            events,
        }
    }

    fn two_steps() -> WorkflowTemplate {
        WorkflowTemplate {
            steps: vec![
                Step::new("plan", "PLAN", "scope", &["pm"]).with_outputs(&["brief.md"]),
                Step::new("build", "BUILD", "code", &["dev"]).with_outputs(&["src"]),
            ],
            agents: Vec::new(),
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<String>) -> Value {
        let raw = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("hub closed");
        serde_json::from_str(&raw).unwrap()
    }

    async fn collect_until(events: &mut mpsc::Receiver<String>, kind: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(events).await;
            let done = event["type"] == kind;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn drain(events: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut seen = Vec::new();
        while let Ok(raw) = events.try_recv() {
            seen.push(serde_json::from_str(&raw).unwrap());
        }
        seen
    }

    fn types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect()
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    struct GatedExecutor {
        gate: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StepExecutor for GatedExecutor {
        async fn execute(&self, project_id: &str, step: &Step) -> KernelResult<StepResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            CannedBackend.execute(project_id, step).await
        }
    }

    struct FailingExecutor(KernelResult<StepOutcome>);

    #[async_trait]
    impl StepExecutor for FailingExecutor {
        async fn execute(&self, project_id: &str, step: &Step) -> KernelResult<StepResult> {
            let outcome = self.0.clone()?;
            let mut result = CannedBackend.execute(project_id, step).await?;
            result.status = outcome;
            result.logs.push("disk full".into());
            Ok(result)
        }
    }

    #[tokio::test]
    async fn test_run_emits_steps_in_order_then_completes() {
        let mut h = harness(Arc::new(CannedBackend), settings(0)).await;
        h.runner.start("p1", Some(two_steps())).await.unwrap();

        let events = collect_until(&mut h.events, "workflow_completed").await;
        let mut expected = Vec::new();
        for _ in 0..2 {
            expected.push("step_started".to_string());
            expected.extend(std::iter::repeat("step_progress".to_string()).take(11));
            expected.push("step_completed".to_string());
        }
        expected.push("workflow_completed".to_string());
        assert_eq!(types(&events), expected);

        let progress: Vec<u64> = events[1..12]
            .iter()
            .map(|e| e["progress"].as_u64().unwrap())
            .collect();
        assert_eq!(progress, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(events[13]["step_index"], 1);

        let summary = &events.last().unwrap()["final_result"];
        assert_eq!(summary["metrics"]["successful_steps"], 2);
        assert_eq!(summary["artifacts_generated"], serde_json::json!(["brief.md", "src"]));

        let run = h.runner.status_of("p1").unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_step, 1);
        assert!(run.end_time.is_some());
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(run.steps[0].result.as_ref().unwrap().logs.len(), 4);
        assert_eq!(h.runner.active_count(), 0);

        let store = h.store.clone();
        eventually(move || {
            futures::executor::block_on(store.get("p1"))
                .unwrap()
                .map_or(false, |p| p.workflow_history.len() == 1)
        })
        .await;
        let project = h.store.get("p1").await.unwrap().unwrap();
        assert_eq!(project.status, "completed");
        assert_eq!(project.workflow_history[0].steps_completed, 2);
    }

    #[tokio::test]
    async fn test_deployed_agents_move_with_their_step() {
        let mut h = harness(Arc::new(CannedBackend), settings(0)).await;
        let key = h.pool.deploy("d1", "pm", "p1", "plan").unwrap().key();

        h.runner.start("p1", Some(two_steps())).await.unwrap();
        let events = collect_until(&mut h.events, "workflow_completed").await;

        let first = &events[1]["agents"];
        assert_eq!(first[0]["agent_id"], "pm");
        assert_eq!(first[0]["status"], "active");
        let last = &events[11]["agents"];
        assert_eq!(last[0]["progress"], 100);
        assert_eq!(last[0]["status"], "completed");

        assert_eq!(h.pool.deployment(&key).unwrap().status, DeploymentStatus::Completed);
        assert_eq!(h.pool.status_of("pm").unwrap().status, AgentStatus::Available);
        assert!(events[14]["agents"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_conflicts_while_live() {
        let executor = Arc::new(GatedExecutor {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let mut h = harness(executor.clone(), settings(0)).await;

        h.runner.start("p1", Some(two_steps())).await.unwrap();
        let err = h.runner.start("p1", None).await.unwrap_err();
        assert_eq!(
            err,
            KernelError::Conflict("workflow already running for project: p1".into())
        );
        assert_eq!(h.runner.workflows_started(), 1);

        executor.gate.notify_one();
        eventually(|| executor.calls.load(Ordering::SeqCst) == 2).await;
        executor.gate.notify_one();
        collect_until(&mut h.events, "workflow_completed").await;

        // A finished run is replaced by the next start.
        h.runner.start("p1", Some(two_steps())).await.unwrap();
        assert_eq!(h.runner.status_of("p1").unwrap().status, RunStatus::Running);
        assert_eq!(h.runner.workflows_started(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_one() {
        let executor = Arc::new(GatedExecutor {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let h = harness(executor, settings(0)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let runner = h.runner.clone();
            handles.push(tokio::spawn(async move {
                runner.start("p1", Some(two_steps())).await.is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(h.runner.active_count(), 1);
    }

    #[tokio::test]
    async fn test_pause_holds_progress_until_resume() {
        let mut h = harness(Arc::new(CannedBackend), settings(20)).await;
        h.runner
            .start("p1", Some(WorkflowTemplate {
                steps: vec![Step::new("plan", "PLAN", "scope", &["pm"])],
                agents: Vec::new(),
            }))
            .await
            .unwrap();

        let mut seen = collect_until(&mut h.events, "step_progress").await;
        let run = h.runner.pause("p1").unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        seen.extend(collect_until(&mut h.events, "workflow_paused").await);

        // Pausing twice is a no-op without a second event.
        h.runner.pause("p1").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(drain(&mut h.events).is_empty());

        h.runner.resume("p1").unwrap();
        seen.extend(collect_until(&mut h.events, "workflow_completed").await);

        let kinds = types(&seen);
        let paused_at = kinds.iter().position(|k| k == "workflow_paused").unwrap();
        assert_eq!(kinds[paused_at + 1], "workflow_resumed");
        let progress: Vec<u64> = seen
            .iter()
            .filter(|e| e["type"] == "step_progress")
            .map(|e| e["progress"].as_u64().unwrap())
            .collect();
        assert_eq!(progress, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[tokio::test]
    async fn test_stop_mid_step_silences_the_run() {
        let mut h = harness(Arc::new(CannedBackend), settings(20)).await;
        h.runner.start("p1", Some(two_steps())).await.unwrap();

        collect_until(&mut h.events, "step_progress").await;
        let run = h.runner.stop("p1").await.unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert!(run.end_time.is_some());

        let err = h.runner.stop("p1").await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(h.runner.resume("p1").unwrap_err().kind(), "conflict");

        tokio::time::sleep(Duration::from_millis(150)).await;
        let after = types(&collect_until(&mut h.events, "workflow_stopped").await);
        let trailing = types(&drain(&mut h.events));
        assert_eq!(after.last().unwrap(), "workflow_stopped");
        assert!(trailing.is_empty(), "events after stop: {:?}", trailing);

        let step = &run.steps[0];
        assert_eq!(step.status, StepStatus::Running);
        assert!(step.result.is_none());

        let runner = h.runner.clone();
        eventually(move || runner.status_of("p1").is_err()).await;
        assert_eq!(h.runner.stop("p1").await.unwrap_err().kind(), "not_found");

        let project = h.store.get("p1").await.unwrap().unwrap();
        assert_eq!(project.status, "stopped");
        assert_eq!(project.workflow_history.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let mut h = harness(Arc::new(CannedBackend), settings(20)).await;
        h.runner.start("p1", Some(two_steps())).await.unwrap();
        collect_until(&mut h.events, "step_started").await;

        h.runner.pause("p1").unwrap();
        h.runner.stop("p1").await.unwrap();
        let kinds = types(&collect_until(&mut h.events, "workflow_stopped").await);
        assert!(kinds.contains(&"workflow_paused".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_executor_error_fails_run() {
        let executor = Arc::new(FailingExecutor(Err(KernelError::Internal("boom".into()))));
        let mut h = harness(executor, settings(0)).await;
        h.runner.start("p1", Some(two_steps())).await.unwrap();

        let events = collect_until(&mut h.events, "workflow_error").await;
        assert_eq!(types(&events), vec!["step_started", "workflow_error"]);
        assert_eq!(events[1]["error"], "boom");

        let run = h.runner.status_of("p1").unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert_eq!(run.steps[0].status, StepStatus::Error);
        assert_eq!(run.steps[1].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_step_outcome_fails_run() {
        let executor = Arc::new(FailingExecutor(Ok(StepOutcome::Failed)));
        let mut h = harness(executor, settings(0)).await;
        h.runner.start("p1", Some(two_steps())).await.unwrap();

        let events = collect_until(&mut h.events, "workflow_error").await;
        assert_eq!(events.last().unwrap()["error"], "step plan failed: disk full");
    }

    #[tokio::test]
    async fn test_slow_executor_times_out() {
        let executor = Arc::new(GatedExecutor {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let mut s = settings(0);
        s.step_timeout = Duration::from_millis(50);
        let mut h = harness(executor, s).await;
        h.runner.start("p1", Some(two_steps())).await.unwrap();

        let events = collect_until(&mut h.events, "workflow_error").await;
        assert_eq!(events.last().unwrap()["error"], "step plan timed out after 50ms");
        assert_eq!(h.runner.status_of("p1").unwrap().status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_start_validation() {
        let h = harness(Arc::new(CannedBackend), settings(0)).await;
        let empty = WorkflowTemplate {
            steps: Vec::new(),
            agents: Vec::new(),
        };
        assert_eq!(h.runner.start("p1", Some(empty)).await.unwrap_err().kind(), "validation");

        let mut duplicate = two_steps();
        duplicate.steps[1].id = "plan".into();
        assert_eq!(
            h.runner.start("p1", Some(duplicate)).await.unwrap_err(),
            KernelError::Validation("duplicate step id: plan".into())
        );

        let mut unknown = two_steps();
        unknown.steps[0].agents.push("ghost".into());
        assert_eq!(
            h.runner.start("p1", Some(unknown)).await.unwrap_err(),
            KernelError::Validation("unknown agent ghost in step plan".into())
        );

        assert_eq!(h.runner.start("nope", None).await.unwrap_err().kind(), "not_found");
        assert_eq!(h.runner.active_count(), 0);
    }

    #[tokio::test]
    async fn test_controls_on_unknown_project() {
        let h = harness(Arc::new(CannedBackend), settings(0)).await;
        assert_eq!(h.runner.pause("p1").unwrap_err().kind(), "not_found");
        assert_eq!(h.runner.resume("p1").unwrap_err().kind(), "not_found");
        assert_eq!(h.runner.status_of("p1").unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_default_template_and_stop_all() {
        let executor = Arc::new(GatedExecutor {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let h = harness(executor, settings(0)).await;

        let run = h.runner.start("p1", None).await.unwrap();
        assert_eq!(run.steps.len(), 5);
        assert_eq!(run.agents.len(), 4);
        assert_eq!(run.current_step, 0);

        assert_eq!(h.runner.stop_all().await, 1);
        assert_eq!(h.runner.active_count(), 0);
        assert_eq!(h.runner.stop_all().await, 0);
    }
}
