// [[MISSION]]/apps/kernel-server/src/server/handlers.rs
// Purpose: HTTP handlers and the observer WebSocket.
// Architecture: API Layer
// Dependencies: Axum, Runtime

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Json,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::events::{ClientMessage, KernelEvent};
use crate::hub::{ObserverHandle, ObserverId};
use crate::models::*;
use crate::runtime::{DeployRequest, KernelRuntime};
use crate::store::ProjectConfig;

type ApiResult = KernelResult<Json<Value>>;

#[derive(Deserialize)]
pub struct ProgressRequest {
    deployment_id: String,
    agent_id: String,
    progress: i64,
    #[serde(default)]
    logs: Vec<String>,
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Mission kernel is running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn system_status(State(runtime): State<Arc<KernelRuntime>>) -> Json<Value> {
    Json(json!({
        "success": true,
        "system": runtime.system_status(),
        "connections": runtime.hub.connection_stats(),
    }))
}

// === AGENTS ===

pub async fn list_agents(State(runtime): State<Arc<KernelRuntime>>) -> Json<Value> {
    let agents = runtime.pool.all_statuses();
    Json(json!({
        "success": true,
        "total": agents.len(),
        "agents": agents,
    }))
}

pub async fn get_agent(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(agent_id): Path<String>,
) -> ApiResult {
    let agent = runtime.agent(&agent_id)?;
    Ok(Json(json!({ "success": true, "agent": agent })))
}

pub async fn deploy_agents(
    State(runtime): State<Arc<KernelRuntime>>,
    Json(request): Json<DeployRequest>,
) -> KernelResult<Json<BatchResult>> {
    tracing::info!(
        "Deploy request for project {}: {:?}",
        request.project_id,
        request.agent_ids
    );
    runtime.deploy_agents(request).map(Json)
}

pub async fn update_progress(
    State(runtime): State<Arc<KernelRuntime>>,
    Json(request): Json<ProgressRequest>,
) -> ApiResult {
    let key = DeploymentKey::new(&request.deployment_id, &request.agent_id);
    let deployment = runtime.update_progress(&key, request.progress, request.logs)?;
    Ok(Json(json!({ "success": true, "deployment": deployment })))
}

pub async fn recall_agents(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(project_id): Path<String>,
) -> Json<Value> {
    let recalled = runtime.recall_agents(&project_id);
    Json(json!({
        "success": true,
        "project_id": project_id,
        "recalled": recalled,
    }))
}

pub async fn orchestrator_stats(
    State(runtime): State<Arc<KernelRuntime>>,
) -> Json<OrchestratorStats> {
    Json(runtime.orchestrator_stats())
}

pub async fn deployment_history(State(runtime): State<Arc<KernelRuntime>>) -> Json<Value> {
    let history = runtime.ledger.history();
    Json(json!({
        "success": true,
        "total": history.len(),
        "deployments": history,
    }))
}

// === PROJECTS ===

pub async fn list_projects(State(runtime): State<Arc<KernelRuntime>>) -> ApiResult {
    let projects = runtime.list_projects().await?;
    Ok(Json(json!({
        "success": true,
        "total": projects.len(),
        "projects": projects,
    })))
}

pub async fn create_project(
    State(runtime): State<Arc<KernelRuntime>>,
    Json(config): Json<ProjectConfig>,
) -> ApiResult {
    let project = runtime.create_project(config).await?;
    Ok(Json(json!({
        "success": true,
        "project_id": project.id,
        "project": project,
    })))
}

pub async fn project_stats(State(runtime): State<Arc<KernelRuntime>>) -> ApiResult {
    let stats = runtime.project_stats().await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

pub async fn get_project(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(project_id): Path<String>,
) -> ApiResult {
    let project = runtime.project(&project_id).await?;
    Ok(Json(json!({ "success": true, "project": project })))
}

pub async fn delete_project(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(project_id): Path<String>,
) -> ApiResult {
    runtime.delete_project(&project_id).await?;
    Ok(Json(json!({ "success": true, "project_id": project_id })))
}

// === WORKFLOWS ===

/// An empty body starts the default template.
pub async fn start_workflow(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(project_id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let template = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let template: WorkflowTemplate = serde_json::from_slice(&body)
            .map_err(|e| KernelError::Validation(format!("invalid workflow template: {}", e)))?;
        Some(template)
    };

    let run = runtime.runner.start(&project_id, template).await?;
    Ok(Json(json!({
        "success": true,
        "project_id": project_id,
        "run_id": run.run_id,
        "status": run.status,
        "steps": run.steps.len(),
    })))
}

fn control_response(run: WorkflowRun) -> Json<Value> {
    Json(json!({
        "success": true,
        "project_id": run.project_id,
        "status": run.status,
    }))
}

pub async fn pause_workflow(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(project_id): Path<String>,
) -> ApiResult {
    runtime.runner.pause(&project_id).map(control_response)
}

pub async fn resume_workflow(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(project_id): Path<String>,
) -> ApiResult {
    runtime.runner.resume(&project_id).map(control_response)
}

pub async fn stop_workflow(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(project_id): Path<String>,
) -> ApiResult {
    runtime.runner.stop(&project_id).await.map(control_response)
}

pub async fn workflow_status(
    State(runtime): State<Arc<KernelRuntime>>,
    Path(project_id): Path<String>,
) -> ApiResult {
    let run = runtime.runner.status_of(&project_id)?;
    let working = run
        .steps
        .get(run.current_step)
        .map(|step| runtime.pool.step_agents(&project_id, &step.agents))
        .unwrap_or_default();
    Ok(Json(json!({
        "success": true,
        "workflow": run,
        "working_agents": working,
    })))
}

// === OBSERVERS ===

pub async fn ws_observer(
    State(runtime): State<Arc<KernelRuntime>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer(socket, runtime))
}

async fn handle_observer(socket: WebSocket, runtime: Arc<KernelRuntime>) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = ObserverHandle::channel();
    let id = runtime.hub.subscribe(handle);

    // The queue closes when the hub forgets this observer.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sender.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        // Dropped by the hub after a failed delivery or at shutdown.
        if !runtime.hub.is_connected(id) {
            break;
        }
        match frame {
            Ok(Message::Text(text)) => handle_client_message(&runtime, id, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Observer {} socket error: {}", id, e);
                break;
            }
        }
    }

    runtime.hub.unsubscribe(id);
    let _ = writer.await;
}

fn handle_client_message(runtime: &KernelRuntime, id: ObserverId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Ignoring malformed message from observer {}: {}", id, e);
            return;
        }
    };

    let outcome = match message {
        ClientMessage::Ping => {
            runtime.hub.send_to(id, KernelEvent::Pong);
            Ok(())
        }
        ClientMessage::Subscribe { project_id } => {
            runtime.hub.subscribe_to_project(id, &project_id)
        }
        ClientMessage::Unsubscribe { project_id } => {
            runtime.hub.unsubscribe_from_project(id, &project_id)
        }
    };

    if let Err(e) = outcome {
        tracing::warn!("Observer {} request rejected: {}", id, e);
    }
}
