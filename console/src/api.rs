//! Management HTTP Surface
//!
//! REST endpoints for project CRUD, retroactive exclusion purge and browser
//! control, plus the `/ws` operator channel.

use crate::error::ConsoleError;
use crate::project::Project;
use crate::{router, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use intercept_core::ExclusionRule;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/:name",
            get(load_project).put(save_project).delete(delete_project),
        )
        .route("/api/projects/:name/purge", post(purge_project))
        .route("/start", post(start_browser))
        .route("/stop", post(stop_browser))
        .route("/ws", get(router::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn list_projects(State(state): State<AppState>) -> Result<Response, ConsoleError> {
    let summaries = state.store.list().await?;
    Ok(Json(summaries).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Response, ConsoleError> {
    let project = state.store.create(&req.name).await?;
    sync_rules(&state, &project);
    *state.project.write().await = project.clone();
    Ok(Json(json!({ "success": true, "project": project })).into_response())
}

async fn load_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ConsoleError> {
    match state.store.load(&name).await? {
        Some(project) => {
            info!("Loaded project '{}' ({} requests)", name, project.requests.len());
            sync_rules(&state, &project);
            *state.project.write().await = project.clone();
            Ok(Json(project).into_response())
        }
        None => Ok(not_found()),
    }
}

async fn save_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut project): Json<Project>,
) -> Result<Response, ConsoleError> {
    project.name = name;
    if project.created.is_empty() {
        project.created = match state.store.load(&project.name).await? {
            Some(existing) => existing.created,
            None => chrono::Utc::now().to_rfc3339(),
        };
    }
    sync_rules(&state, &project);
    state.store.save(&mut project).await?;
    *state.project.write().await = project;
    Ok(Json(json!({ "success": true })).into_response())
}

async fn delete_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ConsoleError> {
    let existed = state.store.delete(&name).await?;
    Ok(Json(json!({ "success": existed })).into_response())
}

/// Retroactive purge: remove already-captured exchanges matching the given
/// exclusion rules from the named project's history.
async fn purge_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(rules): Json<Vec<ExclusionRule>>,
) -> Result<Response, ConsoleError> {
    {
        let mut current = state.project.write().await;
        if current.name == name {
            let removed = current.purge_excluded(&rules);
            state.store.save(&mut current).await?;
            info!("Purged {} exchanges from live project '{}'", removed, name);
            return Ok(Json(json!({ "success": true, "removed": removed })).into_response());
        }
    }
    match state.store.load(&name).await? {
        Some(mut project) => {
            let removed = project.purge_excluded(&rules);
            state.store.save(&mut project).await?;
            info!("Purged {} exchanges from project '{}'", removed, name);
            Ok(Json(json!({ "success": true, "removed": removed })).into_response())
        }
        None => Ok(not_found()),
    }
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    url: String,
}

async fn start_browser(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Response {
    let driver = state.driver.clone();
    let url = req.url.clone();
    tokio::spawn(async move {
        if let Err(e) = driver.start(&url).await {
            warn!("Browser start failed: {}", e);
        }
    });
    Json(json!({ "status": "starting", "url": req.url })).into_response()
}

async fn stop_browser(State(state): State<AppState>) -> Result<Response, ConsoleError> {
    state.driver.stop().await?;
    Ok(Json(json!({ "status": "stopped" })).into_response())
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Project not found" })),
    )
        .into_response()
}

fn sync_rules(state: &AppState, project: &Project) {
    state
        .coordinator
        .set_rules(project.match_replace_rules.clone());
    state
        .coordinator
        .set_exclusions(project.exclusion_rules.clone());
}
