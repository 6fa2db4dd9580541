//! HTTP API.
//!
//! Key routes and `/raft/add` sit behind [`forward::forward_to_leader`], so a
//! follower hands them to the leader transparently. `/` and `/raft/status`
//! are always answered locally.

pub mod forward;

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::cluster::{Cluster, JoinRequest};
use crate::error::Error;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            client: reqwest::Client::new(),
        }
    }
}

pub fn router(cluster: Arc<Cluster>) -> Router {
    let state = AppState::new(cluster);

    let forwarded = Router::new()
        .route("/key/:key", get(get_key).post(set_key).delete(delete_key))
        .route("/raft/add", post(add_member))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            forward::forward_to_leader,
        ));

    Router::new()
        .route("/", get(hello))
        .route("/raft/status", get(status))
        .merge(forwarded)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serializes `body` as JSON with an explicit UTF-8 content type.
pub fn json_response(status: StatusCode, body: impl Serialize) -> Response {
    match serde_json::to_vec(&body) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], bytes).into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn success() -> Response {
    json_response(StatusCode::OK, json!({"status": "success"}))
}

/// Errors returned by handlers, rendered as `{"error": msg}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Cluster(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Cluster(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Cluster(Error::NotLeader | Error::LockContention(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Cluster(Error::CommitTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Cluster(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Cluster(err) => err.to_string(),
        };
        if status.is_server_error() {
            error!(%status, error = %message, "request failed");
        }
        json_response(status, json!({ "error": message }))
    }
}

async fn hello() -> Response {
    json_response(StatusCode::OK, json!({"hello": "world"}))
}

async fn status(State(state): State<AppState>) -> Response {
    json_response(StatusCode::OK, state.cluster.status())
}

/// Returns the raw value; absent keys return an empty body.
async fn get_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<String, ApiError> {
    Ok(state.cluster.get(&key)?)
}

async fn set_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let value = String::from_utf8(body.to_vec())
        .map_err(|_| ApiError::BadRequest("value must be valid UTF-8".to_string()))?;
    state.cluster.set(&key, &value).await?;
    Ok(success())
}

async fn delete_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    state.cluster.delete(&key).await?;
    Ok(success())
}

async fn add_member(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    debug!(body = %String::from_utf8_lossy(&body), "got join request");
    let request: JoinRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("could not parse json: {err}")))?;
    let id: u64 = request
        .id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid node id {:?}", request.id)))?;
    state.cluster.add_voter(id, &request.address).await?;
    Ok(success())
}
