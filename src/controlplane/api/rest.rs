//! REST API Handlers
//!
//! Block storage endpoints over the lifecycle manager: volumes and their
//! actions, snapshots, backups, manage-existing, volume types, QoS specs and
//! user messages. Failures answer with the error class name and the text of
//! the user message the operation recorded, never the internal error text.

use crate::controlplane::manager::{
    AttachRequest, CreateVolumeRequest, LifecycleManager, ManageExistingRequest,
};
use crate::domain::context::OperationContext;
use crate::domain::model::{AttachMode, AttachTarget};
use crate::domain::ports::{ConnectorProperties, ExistingRef, ManageableQuery};
use crate::error::{Error, ErrorKind, Result};
use crate::manageable::{parse_sort_dirs, parse_sort_keys};
use crate::message::MessageFilter;
use crate::volume_types::QosConsumer;
use axum::{
    extract::{DefaultBodyLimit, Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Header carrying the caller's project
pub const PROJECT_ID_HEADER: &str = "x-project-id";
/// Header carrying a caller supplied request id
pub const REQUEST_ID_HEADER: &str = "x-openstack-request-id";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Snapshot create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub volume_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub force: bool,
}

/// Backup create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBackupRequest {
    pub volume_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub force: bool,
}

/// Restore request; a new volume is created when `volume_id` is absent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub volume_id: Option<String>,
}

/// Volume type create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeTypeRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

/// QoS specs create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQosRequest {
    pub name: String,
    #[serde(default)]
    pub consumer: QosConsumer,
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
}

/// Query of the QoS association endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct QosAssociationQuery {
    pub vol_type_id: String,
}

/// Query of the list-manageable endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManageableListQuery {
    pub host: String,
    /// `source-name` of the last entry of the previous page
    pub marker: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// Comma separated
    pub sort_keys: Option<String>,
    /// Comma separated
    pub sort_dirs: Option<String>,
}

impl ManageableListQuery {
    fn into_query(self) -> Result<(String, ManageableQuery)> {
        let split = |raw: Option<String>| -> Vec<String> {
            raw.map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
        };
        let query = ManageableQuery {
            marker: self.marker.map(ExistingRef::source_name),
            limit: self.limit,
            offset: self.offset,
            sort_keys: parse_sort_keys(&split(self.sort_keys))?,
            sort_dirs: parse_sort_dirs(&split(self.sort_dirs))?,
        };
        Ok((self.host, query))
    }
}

/// Body of `POST /v3/volumes/:id/action`, one action per request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VolumeAction {
    #[serde(rename = "os-extend")]
    Extend { new_size: u64 },
    #[serde(rename = "os-attach")]
    Attach {
        instance_uuid: Option<String>,
        host_name: Option<String>,
        mountpoint: Option<String>,
        mode: Option<AttachMode>,
    },
    #[serde(rename = "os-detach")]
    Detach { attachment_id: String },
    #[serde(rename = "os-initialize_connection")]
    InitializeConnection {
        connector: ConnectorProperties,
        mode: Option<AttachMode>,
    },
    #[serde(rename = "os-terminate_connection")]
    TerminateConnection { connector: Option<ConnectorProperties> },
    #[serde(rename = "os-unmanage")]
    Unmanage {},
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    /// Id of the user message recorded for this failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    manager: Arc<LifecycleManager>,
    max_body_size: usize,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self {
            manager,
            max_body_size: 10 * 1024 * 1024,
        }
    }

    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            manager: self.manager,
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Volume endpoints
            .route("/v3/volumes", post(create_volume).get(list_volumes))
            .route("/v3/volumes/:id", get(get_volume).delete(delete_volume))
            .route("/v3/volumes/:id/action", post(volume_action))
            .route("/v3/volumes/:id/attachments", get(list_attachments))
            // Snapshot endpoints
            .route("/v3/snapshots", post(create_snapshot).get(list_snapshots))
            .route("/v3/snapshots/:id", get(get_snapshot).delete(delete_snapshot))
            // Backup endpoints
            .route("/v3/backups", post(create_backup).get(list_backups))
            .route("/v3/backups/:id", get(get_backup).delete(delete_backup))
            .route("/v3/backups/:id/restore", post(restore_backup))
            // Manage existing
            .route(
                "/v3/manageable_volumes",
                post(manage_volume).get(list_manageable_volumes),
            )
            .route("/v3/manageable_snapshots", get(list_manageable_snapshots))
            // Volume types and QoS
            .route("/v3/types", post(create_volume_type).get(list_volume_types))
            .route("/v3/types/:id", get(get_volume_type).delete(delete_volume_type))
            .route("/v3/types/:id/extra_specs", post(set_extra_specs))
            .route("/v3/types/:id/extra_specs/:key", delete(unset_extra_spec))
            .route("/v3/qos-specs", post(create_qos).get(list_qos))
            .route("/v3/qos-specs/:id", get(get_qos))
            .route("/v3/qos-specs/:id/associate", get(associate_qos))
            .route("/v3/qos-specs/:id/disassociate", get(disassociate_qos))
            // Messages
            .route("/v3/messages", get(list_messages))
            .route("/v3/messages/:id", get(get_message).delete(delete_message))
            // Scheduler
            .route("/v3/scheduler-stats/get_pools", get(get_pools))
            // Health endpoint
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    manager: Arc<LifecycleManager>,
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    let mut ctx = context_from(&headers);
    info!("Creating volume: {} ({} GB)", request.name, request.size);
    let result = state.manager.create_volume(&mut ctx, request).await;
    reply(StatusCode::ACCEPTED, result.map(|v| json!({ "volume": v })), &ctx)
}

async fn list_volumes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = context_from(&headers);
    let volumes = state.manager.list_volumes(ctx.project_id.as_deref());
    (StatusCode::OK, Json(json!({ "volumes": volumes }))).into_response()
}

async fn get_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.get_volume(&id);
    reply(StatusCode::OK, result.map(|v| json!({ "volume": v })), &ctx)
}

async fn delete_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut ctx = context_from(&headers);
    info!("Deleting volume: {}", id);
    let result = state.manager.delete_volume(&mut ctx, &id).await;
    accepted(result, &ctx)
}

async fn volume_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(action): Json<VolumeAction>,
) -> Response {
    let mut ctx = context_from(&headers);
    let manager = &state.manager;
    debug!("Volume {} action {:?}", id, action);

    match action {
        VolumeAction::Extend { new_size } => {
            let result = manager.extend_volume(&mut ctx, &id, new_size).await;
            accepted(result.map(|_| ()), &ctx)
        }
        VolumeAction::Attach {
            instance_uuid,
            host_name,
            mountpoint,
            mode,
        } => {
            let target = match (instance_uuid, host_name) {
                (Some(uuid), None) => AttachTarget::Instance(uuid),
                (None, Some(host)) => AttachTarget::Host(host),
                _ => {
                    let e = Error::InvalidInput {
                        reason: "exactly one of instance_uuid and host_name is required"
                            .to_string(),
                    };
                    return error_response(&e, &ctx);
                }
            };
            let request = AttachRequest {
                target,
                mountpoint,
                mode: mode.unwrap_or(AttachMode::Rw),
                connector: None,
            };
            let result = manager.attach_volume(&mut ctx, &id, request).await;
            reply(StatusCode::OK, result.map(|a| json!({ "attachment": a })), &ctx)
        }
        VolumeAction::Detach { attachment_id } => {
            let result = manager.detach_volume(&mut ctx, &id, &attachment_id).await;
            accepted(result, &ctx)
        }
        VolumeAction::InitializeConnection { connector, mode } => {
            let result = manager
                .initialize_connection(&mut ctx, &id, &connector, mode.unwrap_or(AttachMode::Rw))
                .await;
            reply(
                StatusCode::OK,
                result.map(|info| json!({ "connection_info": info })),
                &ctx,
            )
        }
        VolumeAction::TerminateConnection { connector } => {
            let result = manager
                .terminate_connection(&mut ctx, &id, connector.as_ref())
                .await;
            accepted(result, &ctx)
        }
        VolumeAction::Unmanage {} => {
            let result = manager.unmanage_volume(&mut ctx, &id).await;
            accepted(result, &ctx)
        }
    }
}

async fn list_attachments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state
        .manager
        .get_volume(&id)
        .map(|_| json!({ "attachments": state.manager.list_attachments(&id) }));
    reply(StatusCode::OK, result, &ctx)
}

// =============================================================================
// Snapshot Handlers
// =============================================================================

async fn create_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSnapshotRequest>,
) -> Response {
    let mut ctx = context_from(&headers);
    let result = state
        .manager
        .create_snapshot(&mut ctx, &request.volume_id, &request.name, request.force)
        .await;
    reply(StatusCode::ACCEPTED, result.map(|s| json!({ "snapshot": s })), &ctx)
}

#[derive(Debug, Default, Deserialize)]
struct VolumeIdQuery {
    volume_id: Option<String>,
}

async fn list_snapshots(
    State(state): State<AppState>,
    Query(query): Query<VolumeIdQuery>,
) -> Response {
    let snapshots = state.manager.list_snapshots(query.volume_id.as_deref());
    (StatusCode::OK, Json(json!({ "snapshots": snapshots }))).into_response()
}

async fn get_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.get_snapshot(&id);
    reply(StatusCode::OK, result.map(|s| json!({ "snapshot": s })), &ctx)
}

async fn delete_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut ctx = context_from(&headers);
    let result = state.manager.delete_snapshot(&mut ctx, &id).await;
    accepted(result, &ctx)
}

// =============================================================================
// Backup Handlers
// =============================================================================

async fn create_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateBackupRequest>,
) -> Response {
    let mut ctx = context_from(&headers);
    let result = state
        .manager
        .request_backup(&mut ctx, &request.volume_id, &request.name, request.force)
        .await;
    reply(StatusCode::ACCEPTED, result.map(|b| json!({ "backup": b })), &ctx)
}

async fn list_backups(
    State(state): State<AppState>,
    Query(query): Query<VolumeIdQuery>,
) -> Response {
    let backups = state.manager.list_backups(query.volume_id.as_deref());
    (StatusCode::OK, Json(json!({ "backups": backups }))).into_response()
}

async fn get_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.get_backup(&id);
    reply(StatusCode::OK, result.map(|b| json!({ "backup": b })), &ctx)
}

async fn delete_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut ctx = context_from(&headers);
    let result = state.manager.request_backup_delete(&mut ctx, &id).await;
    accepted(result, &ctx)
}

async fn restore_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> Response {
    let mut ctx = context_from(&headers);
    let result = state
        .manager
        .request_restore(&mut ctx, &id, request.volume_id.as_deref())
        .await;
    let body = result.map(|v| {
        json!({ "restore": { "backup_id": id, "volume_id": v.id, "volume_name": v.name } })
    });
    reply(StatusCode::ACCEPTED, body, &ctx)
}

// =============================================================================
// Manage Existing Handlers
// =============================================================================

async fn manage_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ManageExistingRequest>,
) -> Response {
    let mut ctx = context_from(&headers);
    info!("Managing {} on {}", request.reference, request.host);
    let result = state.manager.manage_existing(&mut ctx, request).await;
    reply(StatusCode::ACCEPTED, result.map(|v| json!({ "volume": v })), &ctx)
}

async fn list_manageable_volumes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ManageableListQuery>,
) -> Response {
    let ctx = context_from(&headers);
    let (host, query) = match query.into_query() {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e, &ctx),
    };
    let result = state.manager.get_manageable_volumes(&host, &query).await;
    reply(
        StatusCode::OK,
        result.map(|entries| json!({ "manageable-volumes": entries })),
        &ctx,
    )
}

async fn list_manageable_snapshots(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ManageableListQuery>,
) -> Response {
    let ctx = context_from(&headers);
    let (host, query) = match query.into_query() {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e, &ctx),
    };
    let result = state.manager.get_manageable_snapshots(&host, &query).await;
    reply(
        StatusCode::OK,
        result.map(|entries| json!({ "manageable-snapshots": entries })),
        &ctx,
    )
}

// =============================================================================
// Volume Type and QoS Handlers
// =============================================================================

async fn create_volume_type(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateVolumeTypeRequest>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.volume_types().create(
        &request.name,
        request.extra_specs,
        request.description,
    );
    reply(StatusCode::OK, result.map(|t| json!({ "volume_type": t })), &ctx)
}

async fn list_volume_types(State(state): State<AppState>) -> Response {
    let types = state.manager.volume_types().list();
    (StatusCode::OK, Json(json!({ "volume_types": types }))).into_response()
}

async fn get_volume_type(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.volume_types().find(&id);
    reply(StatusCode::OK, result.map(|t| json!({ "volume_type": t })), &ctx)
}

async fn delete_volume_type(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    accepted(state.manager.delete_volume_type(&id), &ctx)
}

#[derive(Debug, Deserialize)]
struct ExtraSpecsBody {
    extra_specs: BTreeMap<String, String>,
}

async fn set_extra_specs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ExtraSpecsBody>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.volume_types().set_extra_specs(&id, body.extra_specs);
    reply(
        StatusCode::OK,
        result.map(|t| json!({ "extra_specs": t.extra_specs })),
        &ctx,
    )
}

async fn unset_extra_spec(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.volume_types().unset_extra_spec(&id, &key);
    accepted(result.map(|_| ()), &ctx)
}

async fn create_qos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateQosRequest>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state
        .manager
        .volume_types()
        .create_qos(&request.name, request.consumer, request.specs);
    reply(StatusCode::OK, result.map(|q| json!({ "qos_specs": q })), &ctx)
}

async fn list_qos(State(state): State<AppState>) -> Response {
    let specs = state.manager.volume_types().list_qos();
    (StatusCode::OK, Json(json!({ "qos_specs": specs }))).into_response()
}

async fn get_qos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.volume_types().get_qos(&id);
    reply(StatusCode::OK, result.map(|q| json!({ "qos_specs": q })), &ctx)
}

async fn associate_qos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<QosAssociationQuery>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.volume_types().associate_qos(&query.vol_type_id, &id);
    accepted(result, &ctx)
}

async fn disassociate_qos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<QosAssociationQuery>,
) -> Response {
    let ctx = context_from(&headers);
    let types = state.manager.volume_types();
    let result = types.qos_for_type(&query.vol_type_id).and_then(|current| {
        match current {
            Some(qos) if qos.id == id => types.disassociate_qos(&query.vol_type_id),
            _ => Err(Error::InvalidInput {
                reason: format!(
                    "volume type {} is not associated with QoS specs {}",
                    query.vol_type_id, id
                ),
            }),
        }
    });
    accepted(result, &ctx)
}

// =============================================================================
// Message Handlers
// =============================================================================

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut filter): Query<MessageFilter>,
) -> Response {
    let ctx = context_from(&headers);
    if filter.project_id.is_none() {
        filter.project_id = ctx.project_id.clone();
    }
    let messages: Vec<_> = state
        .manager
        .messages()
        .list(&filter)
        .into_iter()
        .map(|m| {
            let user_message = m.user_message();
            json!({ "message": m, "user_message": user_message })
        })
        .collect();
    (StatusCode::OK, Json(json!({ "messages": messages }))).into_response()
}

async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    let result = state.manager.messages().get(&id).map(|m| {
        let user_message = m.user_message();
        json!({ "message": m, "user_message": user_message })
    });
    reply(StatusCode::OK, result, &ctx)
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let ctx = context_from(&headers);
    accepted(state.manager.messages().delete(&id), &ctx)
}

// =============================================================================
// Scheduler and Health Handlers
// =============================================================================

async fn get_pools(State(state): State<AppState>) -> Response {
    let pools = state.manager.scheduler().state().pools();
    (StatusCode::OK, Json(json!({ "pools": pools }))).into_response()
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let backends = state.manager.backends().await;
    if backends.iter().any(|b| b.driver.is_initialized()) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no initialized backend")
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Build the request context from the identity headers
fn context_from(headers: &HeaderMap) -> OperationContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    };
    let mut ctx = match header(PROJECT_ID_HEADER) {
        Some(project) => OperationContext::for_project(project),
        None => OperationContext::new(),
    };
    if let Some(request_id) = header(REQUEST_ID_HEADER) {
        ctx.request_id = request_id;
    }
    ctx
}

/// HTTP status of an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidState | ErrorKind::InvalidReference | ErrorKind::ConfigurationError => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BackendUnavailable | ErrorKind::SchedulingFailed => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::Busy => StatusCode::CONFLICT,
        ErrorKind::DriverOperationFailed | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Text returned for errors whose own text stays internal
fn kind_description(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::BackendUnavailable => "The storage backend is not available.",
        ErrorKind::DriverOperationFailed => "The storage backend failed the operation.",
        ErrorKind::SchedulingFailed => "No valid backend was found.",
        _ => "An unknown error occurred.",
    }
}

fn is_user_facing(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::InvalidState
            | ErrorKind::NotFound
            | ErrorKind::QuotaExceeded
            | ErrorKind::InvalidReference
            | ErrorKind::ConfigurationError
            | ErrorKind::Busy
    )
}

/// Error body for `err`; the recorded message text wins over the error text
fn error_response(err: &Error, ctx: &OperationContext) -> Response {
    let kind = err.kind();
    let recorded = ctx.last_message();
    warn!(
        "Request {} failed with {} ({}): {}",
        ctx.request_id,
        err.name(),
        kind,
        err
    );

    let message = match recorded {
        Some(m) => m.detail.text().to_string(),
        None if is_user_facing(kind) => err.to_string(),
        None => kind_description(kind).to_string(),
    };
    let body = ApiErrorResponse {
        error: err.name().to_string(),
        message,
        message_id: recorded.map(|m| m.id.clone()),
    };
    (status_for(kind), Json(body)).into_response()
}

fn reply<T: Serialize>(status: StatusCode, result: Result<T>, ctx: &OperationContext) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(&e, ctx),
    }
}

fn accepted(result: Result<()>, ctx: &OperationContext) -> Response {
    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(&e, ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::Failure;
    use crate::controlplane::manager::testing::{fixture, Fixture};
    use crate::message::Detail;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(f: &Fixture, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let app = RestRouter::new(f.manager.clone()).build();
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header(PROJECT_ID_HEADER, "project-a");
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_volume_create_get_delete() {
        let f = fixture().await;
        let (status, body) = call(
            &f,
            "POST",
            "/v3/volumes",
            Some(json!({ "name": "v1", "size": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["volume"]["status"], "available");
        assert_eq!(body["volume"]["project_id"], "project-a");
        let id = body["volume"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(&f, "GET", &format!("/v3/volumes/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["volume"]["size"], 2);

        let (status, _) = call(&f, "DELETE", &format!("/v3/volumes/{}", id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = call(&f, "GET", &format!("/v3/volumes/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "VolumeNotFound");
    }

    #[tokio::test]
    async fn test_driver_failure_returns_message_text() {
        let f = fixture().await;
        f.driver.instrumentation().fail_on("create_volume", Failure::Error);

        let (status, body) = call(
            &f,
            "POST",
            "/v3/volumes",
            Some(json!({ "name": "v1", "size": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "BackendOperationFailed");
        assert_eq!(body["message"], Detail::DriverFailedCreate.text());

        let message_id = body["message_id"].as_str().unwrap().to_string();
        let (status, body) = call(&f, "GET", &format!("/v3/messages/{}", message_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["user_message"],
            "create volume from backend storage:Driver failed to create the volume."
        );
    }

    #[tokio::test]
    async fn test_attach_and_detach_actions() {
        let f = fixture().await;
        let (_, body) = call(
            &f,
            "POST",
            "/v3/volumes",
            Some(json!({ "name": "v1", "size": 1 })),
        )
        .await;
        let id = body["volume"]["id"].as_str().unwrap().to_string();
        let uri = format!("/v3/volumes/{}/action", id);

        let (status, body) = call(
            &f,
            "POST",
            &uri,
            Some(json!({ "os-attach": { "instance_uuid": "vm-1", "mode": "rw" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let attachment_id = body["attachment"]["id"].as_str().unwrap().to_string();
        assert_eq!(f.manager.get_volume(&id).unwrap().status.to_string(), "in-use");

        let (status, body) = call(
            &f,
            "POST",
            &uri,
            Some(json!({ "os-attach": { "instance_uuid": "vm-2", "host_name": "h" } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidInput");

        let (status, _) = call(
            &f,
            "POST",
            &uri,
            Some(json!({ "os-detach": { "attachment_id": attachment_id } })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(f.manager.get_volume(&id).unwrap().status.to_string(), "available");
    }

    #[tokio::test]
    async fn test_invalid_state_uses_error_text() {
        let f = fixture().await;
        let (status, body) = call(
            &f,
            "POST",
            "/v3/volumes/missing/action",
            Some(json!({ "os-extend": { "new_size": 5 } })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "VolumeNotFound");
        assert!(body.get("message_id").is_none());
    }

    #[tokio::test]
    async fn test_backup_and_restore_endpoints() {
        let f = fixture().await;
        let (_, body) = call(
            &f,
            "POST",
            "/v3/volumes",
            Some(json!({ "name": "v1", "size": 1 })),
        )
        .await;
        let volume_id = body["volume"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &f,
            "POST",
            "/v3/backups",
            Some(json!({ "volume_id": volume_id, "name": "b1" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["backup"]["status"], "available");
        let backup_id = body["backup"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &f,
            "POST",
            &format!("/v3/backups/{}/restore", backup_id),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["restore"]["backup_id"], backup_id.as_str());
        assert_ne!(body["restore"]["volume_id"], volume_id.as_str());

        let (status, _) = call(&f, "DELETE", &format!("/v3/backups/{}", backup_id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_volume_types_and_qos() {
        let f = fixture().await;
        let (status, body) = call(
            &f,
            "POST",
            "/v3/types",
            Some(json!({ "name": "gold", "extra_specs": { "multiattach": "<is> True" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let type_id = body["volume_type"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &f,
            "POST",
            "/v3/qos-specs",
            Some(json!({ "name": "fast", "consumer": "front-end", "specs": { "total_iops_sec": "500" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let qos_id = body["qos_specs"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &f,
            "GET",
            &format!("/v3/qos-specs/{}/associate?vol_type_id={}", qos_id, type_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(f
            .manager
            .volume_types()
            .qos_for_type(&type_id)
            .unwrap()
            .is_some());

        let (status, _) = call(
            &f,
            "DELETE",
            &format!("/v3/types/{}/extra_specs/missing", type_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_manageable_query_parsing() {
        let query = ManageableListQuery {
            host: "node1@mem".to_string(),
            marker: Some("vol-a".to_string()),
            limit: Some(2),
            offset: 0,
            sort_keys: Some("size, reference".to_string()),
            sort_dirs: Some("desc".to_string()),
        };
        let (host, parsed) = query.into_query().unwrap();
        assert_eq!(host, "node1@mem");
        assert_eq!(parsed.sort_keys.len(), 2);
        assert_eq!(parsed.marker, Some(ExistingRef::source_name("vol-a")));

        let bad = ManageableListQuery {
            host: "node1@mem".to_string(),
            sort_keys: Some("colour".to_string()),
            ..Default::default()
        };
        assert!(bad.into_query().is_err());
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let f = fixture().await;
        let (status, _) = call(&f, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&f, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Busy), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::QuotaExceeded), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            status_for(ErrorKind::BackendUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
