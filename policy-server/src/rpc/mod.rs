use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use policy_core::error::DiscoveryError;
use policy_core::ports::policy_store::{AnyPolicy, PolicyFilter};
use policy_core::ports::PolicyStore;
use policy_core::scheduler::{Scheduler, WorkerState};
use policy_model::PolicyKind;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::info;

use crate::errors::ApiError;
use crate::store::SqlStore;

/// Shared handles reachable from every RPC handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqlStore>,
    pub scheduler: Arc<Scheduler>,
    pub logfile: Arc<RwLock<Option<String>>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/workers/:kind/start", post(start_worker))
        .route("/workers/:kind/stop", post(stop_worker))
        .route("/workers/:kind/status", get(worker_status))
        .route("/policies/:kind", get(convert_policies))
        .route("/observe", get(observe_summary))
        .route("/admin/dbclear", post(admin_dbclear))
        .route("/admin/set-logfile", post(admin_set_logfile))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn start_worker(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!(kind, "start worker requested");
    state.scheduler.start(&kind).await?;
    Ok(Json(json!({ "status": "ok", "worker": kind, "state": "running" })))
}

async fn stop_worker(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!(kind, "stop worker requested");
    state.scheduler.stop(&kind).await?;
    Ok(Json(json!({ "status": "ok", "worker": kind, "state": "stopping" })))
}

async fn worker_status(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let worker_state = state.scheduler.status(&kind).await?;
    let label = match worker_state {
        WorkerState::Idle => "idle",
        WorkerState::Running => "running",
        WorkerState::Stopping => "stopping",
    };
    Ok(Json(json!({ "status": "ok", "worker": kind, "state": label })))
}

#[derive(Debug, Deserialize)]
struct ConvertQuery {
    cluster: Option<String>,
    namespace: Option<String>,
    #[serde(default)]
    labels: String,
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter(|kv| !kv.is_empty())
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// `Convert(kind, cluster, ns, labels, from_source)`: returns the current
/// `latest` policies of `kind` matching the identity filter, rendered as
/// Policy-YAML documents.
async fn convert_policies(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<ConvertQuery>,
) -> Result<Json<Value>, ApiError> {
    let policy_kind = match kind.as_str() {
        "network" => PolicyKind::Network,
        "system" => PolicyKind::System,
        "admission" => PolicyKind::Admission,
        other => {
            return Err(DiscoveryError::ConfigError(format!("unknown policy kind: {other}")).into())
        }
    };

    let filter = PolicyFilter {
        cluster: query.cluster,
        namespace: query.namespace,
        labels: parse_labels(&query.labels),
    };

    let policies = state.store.query(policy_kind, filter).await?;
    let documents: Vec<String> = policies
        .iter()
        .filter_map(|p| crate::yaml::to_policy_yaml(p).ok())
        .collect();

    Ok(Json(json!({ "status": "ok", "count": documents.len(), "documents": documents })))
}

#[derive(Debug, Deserialize)]
struct ObserveQuery {
    cluster: Option<String>,
    namespace: Option<String>,
    #[serde(default)]
    labels: String,
}

/// `Observe(cluster, ns, pod, container, labels, type)`: returns the
/// aggregated process/file/network summary currently on record, i.e. the
/// latest `DiscoveredSystemPolicy` matching the identity filter.
async fn observe_summary(
    State(state): State<AppState>,
    Query(query): Query<ObserveQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = PolicyFilter {
        cluster: query.cluster,
        namespace: query.namespace,
        labels: parse_labels(&query.labels),
    };
    let policies = state.store.query(PolicyKind::System, filter).await?;

    let summaries: Vec<Value> = policies
        .into_iter()
        .filter_map(|p| match p {
            AnyPolicy::System(p) => Some(json!({
                "namespace": p.identity.namespace,
                "selector": p.selector,
                "process": p.process,
                "file": p.file,
                "network": p.network,
                "severity": p.severity,
            })),
            _ => None,
        })
        .collect();

    Ok(Json(json!({ "status": "ok", "summaries": summaries })))
}

async fn admin_dbclear(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    info!("admin dbclear requested");
    state
        .store
        .dbclear()
        .await
        .map_err(|e| DiscoveryError::TransientIO(e.to_string()))?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct SetLogfileRequest {
    path: String,
}

/// `Admin(set_logfile)`: records the operator-requested log file target.
/// The running `tracing` subscriber is installed once at startup (per the
/// ambient logging design) and is not hot-swapped; this records the
/// requested path for the next restart rather than reopening file handles
/// live.
async fn admin_set_logfile(
    State(state): State<AppState>,
    Json(request): Json<SetLogfileRequest>,
) -> Result<Json<Value>, ApiError> {
    info!(path = %request.path, "admin set-logfile requested");
    *state.logfile.write().await = Some(request.path.clone());
    Ok(Json(json!({ "status": "ok", "logfile": request.path })))
}
