/**
 * API REST NIMBUS - Surface exposée aux appelants
 *
 * RÔLE :
 * Déclenchement des pipelines (install/delete), lecture des journaux
 * d'opérations en polling et lecture de l'état live des VMs.
 *
 * FONCTIONNEMENT :
 * - POST /vms/{id}/install et /vms/{id}/delete retournent immédiatement un
 *   id d'opération, le pipeline continue détaché
 * - GET /operations/{id} relit le journal jusqu'à l'état terminal
 * - GET /vms/{id}/state lit le miroir cache (absence = 404)
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes les routes sauf /health
 * - Accès refusé si la clé n'est pas configurée côté serveur
 */

use crate::bridge;
use crate::install::{InstallOptions, Pipeline};
use crate::livelog::OperationLog;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use nimbus_shared::cache::StateCache;
use nimbus_shared::models::{OsType, VMState};
use nimbus_shared::store::VmStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub cache: Arc<dyn StateCache>,
    pub store: Arc<dyn VmStore>,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("NIMBUS_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        eprintln!("SECURITY: NIMBUS_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/templates", get(list_templates))
        .route("/vms/{id}/state", get(get_vm_state))
        .route("/vms/{id}/install", post(start_install))
        .route("/vms/{id}/delete", post(start_delete))
        .route("/operations/{id}", get(get_operation))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

#[derive(serde::Serialize)]
struct TemplateView {
    id: String,
    name: String,
    os_type: OsType,
}

#[derive(serde::Serialize)]
struct OperationStarted {
    operation_id: String,
}

// GET /templates (liste)
async fn list_templates(
    State(app): State<AppState>,
) -> Result<Json<Vec<TemplateView>>, StatusCode> {
    let templates = app
        .store
        .templates()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(
        templates
            .into_iter()
            .map(|t| TemplateView { id: t.id, name: t.name, os_type: t.os_type })
            .collect(),
    ))
}

// GET /vms/{id}/state (miroir cache, lecture simple sans retry)
async fn get_vm_state(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VMState>, StatusCode> {
    let state = bridge::get_vm_state(app.cache.as_ref(), &id, 0, std::time::Duration::ZERO)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    match state {
        Some(state) => Ok(Json(state)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// POST /vms/{id}/install (retourne l'id d'opération immédiatement)
async fn start_install(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(opts): Json<InstallOptions>,
) -> Result<Json<OperationStarted>, StatusCode> {
    let known = app
        .store
        .vm(&id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if known.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let operation_id = app.pipeline.start_install(&id, opts);
    Ok(Json(OperationStarted { operation_id }))
}

// POST /vms/{id}/delete
async fn start_delete(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OperationStarted>, StatusCode> {
    let known = app
        .store
        .vm(&id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if known.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let operation_id = app.pipeline.start_delete(&id);
    Ok(Json(OperationStarted { operation_id }))
}

// GET /operations/{id} (journal de progression)
async fn get_operation(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OperationLog>, StatusCode> {
    match app.pipeline.logs.get(&id) {
        Some(log) => Ok(Json(log)),
        None => Err(StatusCode::NOT_FOUND),
    }
}
