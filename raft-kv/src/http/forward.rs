//! Leader forwarding.
//!
//! On a follower, requests are replayed against the leader's HTTP API and
//! the leader's response is relayed verbatim. The leader's HTTP address is
//! derived from its transport address (see [`Config::http_address_for`]).
//! With no known leader the request is handled locally, which for writes
//! means a `NotLeader` error.
//!
//! [`Config::http_address_for`]: crate::config::Config::http_address_for

use anyhow::{Context, Result};
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, error, warn};

use super::{ApiError, AppState, json_response};

/// Largest request body the forwarder will buffer.
const MAX_FORWARD_BODY: usize = 16 * 1024 * 1024;

/// Headers that describe a single connection and must not be relayed.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub async fn forward_to_leader(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let cluster = &state.cluster;
    if cluster.is_leader() {
        return next.run(req).await;
    }

    let Some(leader) = cluster.leader_address() else {
        error!("leader address is empty");
        return next.run(req).await;
    };
    let base = match cluster.http_address_for(&leader) {
        Ok(base) => base,
        Err(err) => return ApiError::from(err).into_response(),
    };

    debug!(method = %req.method(), uri = %req.uri(), leader = %base, "forwarding to leader");
    match proxy(&state.client, &base, req).await {
        Ok(response) => response,
        Err(err) => {
            warn!(leader = %base, error = %format!("{err:#}"), "leader unreachable");
            json_response(
                StatusCode::BAD_GATEWAY,
                json!({ "error": format!("leader {base} unreachable: {err:#}") }),
            )
        }
    }
}

async fn proxy(client: &reqwest::Client, base: &str, req: Request) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{base}{path}");

    let body = to_bytes(body, MAX_FORWARD_BODY)
        .await
        .context("read request body")?;
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let upstream = client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .with_context(|| format!("send to {url}"))?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    let bytes = upstream.bytes().await.context("read leader response")?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Removes connection-level headers, plus any the `Connection` header names.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    // The body is re-buffered on each side; let the server compute the length.
    headers.remove(header::CONTENT_LENGTH);
}
