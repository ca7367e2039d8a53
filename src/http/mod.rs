use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Query, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    control::{ControlApi, ControlError, ReadConsistency, WriteAck},
    raft::types::TypeConfig,
    routing::Route,
};

#[derive(Clone)]
pub struct AppState {
    pub control: ControlApi,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }
}

impl From<ControlError> for ApiError {
    fn from(value: ControlError) -> Self {
        let message = value.to_string();
        match value {
            ControlError::Validation(_) => ApiError::invalid_request(message),
            ControlError::NotLeader {
                leader_id,
                leader_api_base_url,
            } => ApiError::new("not_leader", StatusCode::SERVICE_UNAVAILABLE, message)
                .with_detail("leader_id", json!(leader_id))
                .with_detail("leader_api_base_url", json!(leader_api_base_url)),
            ControlError::Timeout { after } => {
                ApiError::new("commit_timeout", StatusCode::INTERNAL_SERVER_ERROR, message)
                    .with_detail("timeout_ms", json!(after.as_millis() as u64))
            }
            ControlError::Rejected { code, .. } => {
                ApiError::new("command_rejected", StatusCode::INTERNAL_SERVER_ERROR, message)
                    .with_detail("reason", json!(code))
            }
            ControlError::Failed { .. } => {
                ApiError::new("submission_failed", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ControlError::Halted { .. } => {
                ApiError::new("node_halted", StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Debug, Deserialize)]
struct AddRouteRequest {
    destination: String,
    next_hop: String,
    metric: i64,
}

#[derive(Debug, Deserialize)]
struct DestinationQuery {
    destination: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRoutesQuery {
    consistency: Option<String>,
}

#[derive(Serialize)]
struct WriteResponse {
    status: &'static str,
    destination: String,
    index: u64,
    term: u64,
}

impl WriteResponse {
    fn new(status: &'static str, ack: WriteAck) -> Self {
        Self {
            status,
            destination: ack.destination,
            index: ack.index,
            term: ack.term,
        }
    }
}

/// Control API routes, plus the peer RPC routes when this node runs a real raft.
pub fn build_router(
    control: ControlApi,
    raft_rpc: Option<openraft::Raft<TypeConfig>>,
) -> Router {
    let app_state = AppState { control };

    let mut app = Router::new()
        .route(
            "/routes",
            get(list_routes).post(add_route).delete(delete_route),
        )
        .route("/health", get(health))
        .route("/cluster/status", get(cluster_status))
        .fallback(fallback_not_found);

    if let Some(raft) = raft_rpc {
        app = app.merge(crate::raft::http_rpc::build_raft_rpc_router(raft));
    }

    app.layer(Extension(app_state))
}

async fn list_routes(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListRoutesQuery>,
) -> Result<Json<Value>, ApiError> {
    let consistency = match query.consistency.as_deref() {
        None | Some("local") => ReadConsistency::Local,
        Some("linearizable") => ReadConsistency::Linearizable,
        Some(other) => {
            return Err(ApiError::invalid_request(format!(
                "unknown consistency {other:?}; expected local or linearizable"
            )));
        }
    };
    let routes = state.control.list_routes(consistency).await?;
    Ok(Json(json!({ "routes": routes })))
}

async fn add_route(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<AddRouteRequest>,
) -> Result<(StatusCode, Json<WriteResponse>), ApiError> {
    let route = Route::new(req.destination, req.next_hop, req.metric);
    let ack = state.control.add_route(route).await?;
    Ok((StatusCode::CREATED, Json(WriteResponse::new("route added", ack))))
}

async fn delete_route(
    Extension(state): Extension<AppState>,
    Query(query): Query<DestinationQuery>,
) -> Result<Json<WriteResponse>, ApiError> {
    let Some(destination) = query.destination.filter(|d| !d.trim().is_empty()) else {
        return Err(ApiError::invalid_request("missing destination query parameter"));
    };
    let ack = state.control.delete_route(&destination).await?;
    if !ack.found() {
        return Err(
            ApiError::not_found(format!("route not found: {destination}"))
                .with_detail("index", json!(ack.index)),
        );
    }
    Ok(Json(WriteResponse::new("route deleted", ack)))
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!(state.control.health()))
}

async fn cluster_status(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(Value::Object(state.control.cluster_status().await))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
