// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

use nils_core::{Engine, PromptInput};
use nils_event::{Event, PermissionResponse};
use nils_session::{NamedError, ProjectIcon, ShareInfo};

use crate::error::ApiError;

type AppState = Arc<Engine>;

/// Build the full route table of §6.1.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/path", get(get_path))
        .route("/project", get(list_projects))
        .route("/project/current", get(current_project))
        .route("/project/:id/update", post(update_project))
        .route("/session", get(list_sessions).post(create_session))
        .route("/session/:id", get(get_session).delete(delete_session))
        .route("/session/:id/share", post(share_session))
        .route("/session/:id/unshare", post(unshare_session))
        .route("/session/:id/abort", post(abort_session))
        .route("/session/:id/prompt", post(prompt_session))
        .route("/session/:id/message", get(list_messages))
        .route("/session/:id/message/:mid/part", get(list_parts))
        .route("/session/:id/permission/:pid", post(reply_permission))
        .route("/event", get(event_stream))
        .route("/file", get(read_file))
        .route("/find/files", get(find_files))
        .route("/instance/dispose", post(dispose))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ── Paths & projects ─────────────────────────────────────────────────────────

async fn get_path(State(engine): State<AppState>) -> Json<Value> {
    let worktree = engine.project().worktree.clone();
    let data = engine.store().data_dir().to_path_buf();
    let config = dirs::config_dir()
        .map(|d| d.join("nils"))
        .unwrap_or_else(|| PathBuf::from(".nils"));
    Json(json!({
        "cwd": std::env::current_dir().unwrap_or_else(|_| worktree.clone()),
        "directory": &worktree,
        "worktree": &worktree,
        "state": data.join("state"),
        "config": config,
        "data": &data,
        "root": &worktree,
    }))
}

async fn list_projects(State(engine): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let projects = engine.store().list_projects().map_err(unknown)?;
    Ok(Json(projects))
}

async fn current_project(State(engine): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let project = engine
        .store()
        .get_project(&engine.project().id)
        .map_err(unknown)?;
    Ok(Json(project))
}

#[derive(Deserialize)]
struct ProjectUpdate {
    name: Option<String>,
    icon: Option<ProjectIcon>,
}

async fn update_project(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ProjectUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let mut project = engine
        .store()
        .get_project(&id)
        .map_err(|_| ApiError::not_found("project", &id))?;
    if let Some(name) = update.name {
        project.name = name;
    }
    if let Some(icon) = update.icon {
        project.icon = Some(icon);
    }
    project.touch();
    engine.store().upsert_project(&project).map_err(unknown)?;
    engine.bus().publish(Event::ProjectUpdated {
        project: project.clone(),
    });
    Ok(Json(project))
}

// ── Sessions ─────────────────────────────────────────────────────────────────

async fn list_sessions(State(engine): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sessions = engine
        .store()
        .list_sessions(&engine.project().id)
        .map_err(unknown)?;
    Ok(Json(sessions))
}

#[derive(Deserialize, Default)]
struct CreateSession {
    title: Option<String>,
    #[serde(rename = "parentID")]
    parent_id: Option<String>,
}

async fn create_session(
    State(engine): State<AppState>,
    body: Option<Json<CreateSession>>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.unwrap_or_default();
    let session = engine.create_session(body.title, body.parent_id)?;
    Ok(Json(session))
}

async fn get_session(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = engine
        .store()
        .get_session(&id)
        .map_err(|_| ApiError::not_found("session", &id))?;
    Ok(Json(session))
}

async fn delete_session(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine.delete_session(&id)?;
    Ok(Json(json!({ "deleted": true })))
}

async fn share_session(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut session = engine
        .store()
        .get_session(&id)
        .map_err(|_| ApiError::not_found("session", &id))?;
    if session.share.is_none() {
        let share_id = nils_id::ascending(nils_id::Kind::Task);
        let share = ShareInfo {
            secret: nils_id::ascending(nils_id::Kind::Usage),
            url: format!("nils://share/{share_id}"),
            id: share_id,
        };
        engine.store().set_share(&id, &share).map_err(unknown)?;
        session.share = Some(share);
        session.touch();
        engine.store().upsert_session(&session).map_err(unknown)?;
        engine.bus().publish(Event::SessionUpdated {
            session: session.clone(),
        });
    }
    Ok(Json(session))
}

async fn unshare_session(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut session = engine
        .store()
        .get_session(&id)
        .map_err(|_| ApiError::not_found("session", &id))?;
    engine.store().delete_share(&id).map_err(unknown)?;
    session.share = None;
    session.touch();
    engine.store().upsert_session(&session).map_err(unknown)?;
    engine.bus().publish(Event::SessionUpdated {
        session: session.clone(),
    });
    Ok(Json(session))
}

async fn abort_session(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Aborting an idle session is a no-op, not an error.
    let aborted = engine.abort_session(&id);
    Ok(Json(json!({ "aborted": aborted })))
}

async fn prompt_session(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<PromptInput>,
) -> Result<impl IntoResponse, ApiError> {
    let message = engine.prompt(&id, input).await?;
    Ok(Json(message))
}

async fn list_messages(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Distinguish an unknown session from an empty one.
    engine
        .store()
        .get_session(&id)
        .map_err(|_| ApiError::not_found("session", &id))?;
    let messages = engine.store().list_messages(&id).map_err(unknown)?;
    Ok(Json(messages))
}

async fn list_parts(
    State(engine): State<AppState>,
    Path((_id, mid)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    engine
        .store()
        .get_message(&mid)
        .map_err(|_| ApiError::not_found("message", &mid))?;
    let parts = engine.store().list_parts(&mid).map_err(unknown)?;
    Ok(Json(parts))
}

// ── Permissions ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PermissionReplyBody {
    response: PermissionResponse,
}

async fn reply_permission(
    State(engine): State<AppState>,
    Path((_id, pid)): Path<(String, String)>,
    Json(body): Json<PermissionReplyBody>,
) -> Result<impl IntoResponse, ApiError> {
    if engine.gate().reply(&pid, body.response) {
        Ok(Json(json!({ "replied": true })))
    } else {
        Err(ApiError::not_found("permission", &pid))
    }
}

// ── Events (SSE) ─────────────────────────────────────────────────────────────

async fn event_stream(
    State(engine): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut events = engine.bus().subscribe_all();
    let stream = async_stream::stream! {
        yield sse_json(&Event::ServerConnected {});
        while let Some(event) = events.next().await {
            yield sse_json(&event);
        }
    };
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn sse_json(event: &Event) -> Result<SseEvent, Infallible> {
    Ok(SseEvent::default()
        .json_data(event)
        .unwrap_or_else(|e| {
            warn!("unserializable event: {e}");
            SseEvent::default().data("{}")
        }))
}

// ── Files ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

async fn read_file(
    State(engine): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let path = PathBuf::from(&query.path);
    let path = if path.is_absolute() {
        path
    } else {
        engine.project().worktree.join(path)
    };
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ApiError::not_found("file", &query.path))?;
    Ok(Json(json!({ "path": query.path, "content": content })))
}

#[derive(Deserialize)]
struct FindQuery {
    query: String,
}

const FIND_LIMIT: usize = 100;

async fn find_files(
    State(engine): State<AppState>,
    Query(find): Query<FindQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let root = engine.project().worktree.clone();
    let needle = find.query.to_lowercase();
    let matches = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            if rel.to_lowercase().contains(&needle) {
                out.push(rel);
                if out.len() >= FIND_LIMIT {
                    break;
                }
            }
        }
        out.sort();
        out
    })
    .await
    .map_err(|e| NamedError::new(nils_session::ErrorKind::Unknown, e.to_string()))?;
    Ok(Json(matches))
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

async fn dispose(State(engine): State<AppState>) -> impl IntoResponse {
    engine.dispose();
    Json(json!({ "disposed": true }))
}

fn unknown(e: nils_store::StoreError) -> ApiError {
    ApiError(NamedError::new(
        nils_session::ErrorKind::Unknown,
        e.to_string(),
    ))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
