use crate::node::CacheNode;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dcache_raft::{RaftError, RaftMetrics};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// HTTP routes, served at the root and under `/v1`
pub fn create_api(node: Arc<CacheNode>) -> Router {
    let routes = Router::new()
        .route("/value", get(get_value).post(put_value))
        .route("/join", get(join))
        .route("/leave", get(leave))
        .route("/status", get(status))
        .route("/metrics", get(metrics));

    Router::new()
        .merge(routes.clone())
        .nest("/v1", routes)
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

#[derive(Debug, Deserialize)]
struct ValueQuery {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct MemberQuery {
    #[serde(default, rename = "peerAddress")]
    peer_address: String,
    #[serde(default)]
    node: String,
}

async fn get_value(State(node): State<Arc<CacheNode>>, Query(query): Query<ValueQuery>) -> String {
    node.get(&query.key)
}

async fn put_value(
    State(node): State<Arc<CacheNode>>,
    Query(query): Query<ValueQuery>,
) -> Result<&'static str, ApiError> {
    node.put(&query.key, &query.value).await?;
    Ok("ok")
}

async fn join(
    State(node): State<Arc<CacheNode>>,
    Query(query): Query<MemberQuery>,
) -> Result<&'static str, ApiError> {
    if query.peer_address.is_empty() {
        return Err(ApiError::BadRequest("invaild peerAdress"));
    }
    if query.node.is_empty() {
        return Err(ApiError::BadRequest("invaild node"));
    }
    node.add_voter(&query.node, &query.peer_address).await?;
    Ok("ok")
}

async fn leave(
    State(node): State<Arc<CacheNode>>,
    Query(query): Query<MemberQuery>,
) -> Result<&'static str, ApiError> {
    if query.node.is_empty() {
        return Err(ApiError::BadRequest("invaild node"));
    }
    node.remove_server(&query.node).await?;
    Ok("ok")
}

async fn status(State(node): State<Arc<CacheNode>>) -> Json<RaftMetrics> {
    Json(node.status().await)
}

async fn metrics(State(node): State<Arc<CacheNode>>) -> Result<Response, ApiError> {
    node.status().await;
    let body = node
        .metrics()
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

/// API errors, rendered as plain text
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error(transparent)]
    Raft(#[from] RaftError),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.to_string()),
            ApiError::Raft(e) => {
                let status = match &e {
                    RaftError::NotLeader { .. } | RaftError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                    RaftError::MembershipChangePending => StatusCode::CONFLICT,
                    RaftError::UnknownServer { .. } => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, message).into_response()
    }
}
