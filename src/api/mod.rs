use crate::error::WorldError;
use crate::pb::{
    EntityFilter, PushRequest, PushResponse, RunTaskResponse, StreamBehavior,
};
use crate::policy::Peer;
use crate::world::WorldCore;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

#[cfg(test)]
mod tests;

/// Shared state for the JSON bridge.
#[derive(Clone)]
pub struct ApiState {
    pub core: Arc<WorldCore>,
}

/// Path-addressed JSON bridge over the same operations as the gRPC surface,
/// plus the health endpoint. Callers on this transport are always remote —
/// including localhost — so every request carries its socket address into
/// the policy gate.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/world/push", post(push))
        .route("/api/world/entities", get(list_entities))
        .route("/api/world/entities/:id", get(get_entity))
        .route("/api/world/entities/:id/expire", post(expire_entity))
        .route("/api/world/entities/:id/task", post(run_task))
        .route("/api/world/node", get(local_node))
        .route("/api/world/watch", get(watch))
        .route("/api/world/timeline", get(timeline))
        .route("/api/world/timeline/move", post(move_timeline))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

/// Filter fields accepted as query parameters; `with`/`without` are
/// comma-separated component ordinals.
#[derive(Debug, Default, Deserialize)]
pub struct FilterParams {
    id: Option<String>,
    id_regex: Option<String>,
    label_regex: Option<String>,
    with: Option<String>,
    without: Option<String>,
    config_key: Option<String>,
    parent: Option<String>,
}

impl FilterParams {
    fn into_filter(self) -> Result<Option<EntityFilter>, WorldError> {
        let parse_ordinals = |list: Option<String>| -> Result<Vec<u32>, WorldError> {
            list.map(|csv| {
                csv.split(',')
                    .filter(|part| !part.is_empty())
                    .map(|part| {
                        part.trim().parse::<u32>().map_err(|_| {
                            WorldError::Validation(format!("bad component ordinal '{part}'"))
                        })
                    })
                    .collect()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
        };

        let filter = EntityFilter {
            id_equal: self.id,
            id_regex: self.id_regex,
            label_regex: self.label_regex,
            with_components: parse_ordinals(self.with)?,
            without_components: parse_ordinals(self.without)?,
            config_key: self.config_key,
            parent_id: self.parent,
        };
        Ok(Some(filter))
    }
}

// Filter fields are repeated here instead of `#[serde(flatten)]`: the query
// deserializer routes flattened fields through string content and rejects
// the numeric ones.
#[derive(Debug, Default, Deserialize)]
pub struct WatchParams {
    id: Option<String>,
    id_regex: Option<String>,
    label_regex: Option<String>,
    with: Option<String>,
    without: Option<String>,
    config_key: Option<String>,
    parent: Option<String>,
    max_rate_hz: Option<f64>,
    min_priority: Option<u32>,
    keepalive_ms: Option<u64>,
}

impl WatchParams {
    fn filter_params(self) -> (FilterParams, StreamBehavior) {
        let behavior = StreamBehavior {
            max_rate_hz: self.max_rate_hz,
            min_priority: self.min_priority,
            keepalive_interval_ms: self.keepalive_ms,
        };
        let filter = FilterParams {
            id: self.id,
            id_regex: self.id_regex,
            label_regex: self.label_regex,
            with: self.with,
            without: self.without,
            config_key: self.config_key,
            parent: self.parent,
        };
        (filter, behavior)
    }
}

/// POST /api/world/push
async fn push(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<PushRequest>,
) -> Json<PushResponse> {
    Json(state.core.push(Peer::Remote(addr.ip()), request.entities))
}

/// GET /api/world/entities
async fn list_entities(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<FilterParams>,
) -> Result<Response, ApiError> {
    let filter = params.into_filter()?;
    let entities = state.core.list(Peer::Remote(addr.ip()), filter)?;
    Ok(Json(entities).into_response())
}

/// GET /api/world/entities/:id
async fn get_entity(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let entity = state.core.get(Peer::Remote(addr.ip()), &id)?;
    Ok(Json(entity).into_response())
}

/// POST /api/world/entities/:id/expire
async fn expire_entity(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.core.expire(Peer::Remote(addr.ip()), &id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/world/entities/:id/task
async fn run_task(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Result<Json<RunTaskResponse>, ApiError> {
    let status = state.core.run_task(Peer::Remote(addr.ip()), &id).await?;
    Ok(Json(RunTaskResponse { status }))
}

/// GET /api/world/node
async fn local_node(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    let node = state.core.local_node(Peer::Remote(addr.ip()))?;
    Ok(Json(node).into_response())
}

/// GET /api/world/watch — newline-delimited JSON change events, replay then
/// live, until the client disconnects.
async fn watch(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WatchParams>,
) -> Result<Response, ApiError> {
    let (filter_params, behavior) = params.filter_params();
    let filter = filter_params.into_filter()?;
    let events = state
        .core
        .watch(Peer::Remote(addr.ip()), filter, Some(behavior))?;
    Ok(ndjson_response(events))
}

#[derive(Debug, Default, Deserialize)]
pub struct TimelineParams {
    seek: Option<i64>,
}

/// GET /api/world/timeline
async fn timeline(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<TimelineParams>,
) -> Result<Response, ApiError> {
    let events = state.core.timeline(Peer::Remote(addr.ip()), params.seek)?;
    Ok(ndjson_response(events))
}

#[derive(Debug, Deserialize)]
pub struct MoveTimelineBody {
    freeze: bool,
    #[serde(default)]
    at: Option<i64>,
}

/// POST /api/world/timeline/move
async fn move_timeline(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<MoveTimelineBody>,
) -> Result<StatusCode, ApiError> {
    state
        .core
        .move_timeline(Peer::Remote(addr.ip()), body.freeze, body.at)?;
    Ok(StatusCode::NO_CONTENT)
}

fn ndjson_response<T: serde::Serialize + Send + 'static>(
    events: tokio::sync::mpsc::Receiver<Result<T, WorldError>>,
) -> Response {
    let stream = ReceiverStream::new(events).map(|item| match item {
        Ok(event) => serde_json::to_vec(&event)
            .map(|mut line| {
                line.push(b'\n');
                line
            })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(err) => Err(std::io::Error::other(err.to_string())),
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .expect("static response builder")
}

/// JSON-bridge error mapping, mirroring the gRPC status mapping.
#[derive(Debug)]
pub struct ApiError(WorldError);

impl From<WorldError> for ApiError {
    fn from(err: WorldError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WorldError::Validation(_) => StatusCode::BAD_REQUEST,
            WorldError::PolicyDenied { .. } => StatusCode::FORBIDDEN,
            WorldError::NotFound(_) => StatusCode::NOT_FOUND,
            WorldError::Exhausted => StatusCode::TOO_MANY_REQUESTS,
            WorldError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
