// [[MISSION]]/apps/kernel-server/src/server/mod.rs
// Purpose: Router assembly.
// Architecture: API Layer
// Dependencies: Axum, tower-http

pub mod handlers;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::runtime::KernelRuntime;

pub fn router(runtime: Arc<KernelRuntime>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/system/status", get(handlers::system_status))
        .route("/api/agents", get(handlers::list_agents))
        .route("/api/agents/deploy", post(handlers::deploy_agents))
        .route("/api/agents/progress", post(handlers::update_progress))
        .route("/api/agents/recall/:project_id", post(handlers::recall_agents))
        .route("/api/agents/:agent_id", get(handlers::get_agent))
        .route("/api/orchestrator/stats", get(handlers::orchestrator_stats))
        .route("/api/orchestrator/history", get(handlers::deployment_history))
        .route("/api/projects", get(handlers::list_projects))
        .route("/api/projects/create", post(handlers::create_project))
        .route("/api/projects/stats", get(handlers::project_stats))
        .route(
            "/api/projects/:project_id",
            get(handlers::get_project).delete(handlers::delete_project),
        )
        .route("/api/workflows/:project_id/start", post(handlers::start_workflow))
        .route("/api/workflows/:project_id/pause", post(handlers::pause_workflow))
        .route("/api/workflows/:project_id/resume", post(handlers::resume_workflow))
        .route("/api/workflows/:project_id/stop", post(handlers::stop_workflow))
        .route("/api/workflows/:project_id/status", get(handlers::workflow_status))
        .route("/ws", get(handlers::ws_observer))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(runtime)
}
