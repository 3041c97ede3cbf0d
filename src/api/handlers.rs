use super::protocol::*;
use crate::cache::service::CacheStats;
use crate::directory::registry::Heartbeat;
use crate::directory::remote::{MetaCas, MetaGet, MetaList};
use crate::directory::store::{CasOutcome, MetadataStore, Versioned};
use crate::directory::types::{IndexRecord, Topology};
use crate::error::ClusterError;
use crate::index::types::LocalSearchResult;
use crate::node::SearchNode;
use crate::replication::types::{ReplicaAck, ReplicationEntry, SyncRequest, SyncResponse, WriteResult};
use crate::router::types::{DeleteRequest, FetchRequest, FetchedDocument, MergedResult, QueryRequest, WriteRequest};
use crate::transport::protocol::{ShardFetch, ShardSearch, ShardWrite};

use axum::response::{IntoResponse, Response};
use axum::{Extension, Json, http::StatusCode};
use serde_json::Value;
use std::sync::Arc;

/// A `ClusterError` on the wire: status from its kind, body the error itself
/// so a calling node can rebuild it.
#[derive(Debug)]
pub struct ApiError(pub ClusterError);

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ClusterError::Transient(_) | ClusterError::ShardUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ClusterError::StaleAssignment { .. } | ClusterError::LockLost(_) => StatusCode::CONFLICT,
            ClusterError::QuorumNotReached { .. } => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::IndexNotFound(_) | ClusterError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ClusterError::FatalConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ClusterError::ReplicationLag { .. } | ClusterError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        (status, Json(self.0)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// --- Client requests ---

pub async fn handle_write_document(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<WriteResult> {
    Ok(Json(node.writes().write_document(req).await?))
}

pub async fn handle_delete_document(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<WriteResult> {
    Ok(Json(node.writes().delete_document(req).await?))
}

pub async fn handle_fetch_document(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<FetchRequest>,
) -> ApiResult<FetchedDocument> {
    Ok(Json(node.queries().fetch(req).await?))
}

pub async fn handle_query(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<MergedResult> {
    let result = node.queries().query(req).await?;
    Ok(Json(result.as_ref().clone()))
}

pub async fn handle_create_index(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<CreateIndexRequest>,
) -> ApiResult<IndexRecord> {
    Ok(Json(node.create_index(req.into_record()).await?))
}

pub async fn handle_delete_index(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<DeleteIndexRequest>,
) -> ApiResult<Empty> {
    node.directory().delete_index(&req.name).await?;
    tracing::info!("Index '{}' deleted", req.name);
    Ok(Json(Empty::default()))
}

pub async fn handle_heartbeat(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(heartbeat): Json<Heartbeat>,
) -> ApiResult<HeartbeatResponse> {
    let state_changed = node.registry().record_heartbeat(heartbeat).await?;
    Ok(Json(HeartbeatResponse { state_changed }))
}

pub async fn handle_cluster(Extension(node): Extension<Arc<SearchNode>>) -> ApiResult<Topology> {
    Ok(Json(node.directory().get_topology().await?))
}

pub async fn handle_cache_stats(Extension(node): Extension<Arc<SearchNode>>) -> Json<CacheStats> {
    Json(node.cache().stats())
}

// --- Node-to-node RPCs ---

pub async fn handle_internal_write(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<ShardWrite>,
) -> ApiResult<WriteResult> {
    Ok(Json(node.manager().write(&req.shard, req.op).await?))
}

pub async fn handle_internal_replicate(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(entry): Json<ReplicationEntry>,
) -> ApiResult<ReplicaAck> {
    tracing::trace!(shard = %entry.shard, token = %entry.token, "Replicated entry received");
    Ok(Json(node.manager().apply_replicated(entry).await?))
}

pub async fn handle_internal_ack(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(ack): Json<ReplicaAck>,
) -> ApiResult<Empty> {
    node.manager().acknowledge(ack).await?;
    Ok(Json(Empty::default()))
}

pub async fn handle_internal_search(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<ShardSearch>,
) -> ApiResult<LocalSearchResult> {
    Ok(Json(node.manager().search_local(&req.shard, &req.query)?))
}

pub async fn handle_internal_fetch(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<ShardFetch>,
) -> ApiResult<Option<Value>> {
    Ok(Json(node.manager().fetch_local(&req.shard, &req.doc_id)?))
}

pub async fn handle_internal_sync(
    Extension(node): Extension<Arc<SearchNode>>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<SyncResponse> {
    Ok(Json(node.manager().shard_sync(&req)?))
}

// --- Hosted metadata store ---

pub async fn handle_meta_get(
    Extension(store): Extension<Arc<dyn MetadataStore>>,
    Json(req): Json<MetaGet>,
) -> ApiResult<Option<Versioned>> {
    Ok(Json(store.get(&req.key).await?))
}

pub async fn handle_meta_list(
    Extension(store): Extension<Arc<dyn MetadataStore>>,
    Json(req): Json<MetaList>,
) -> ApiResult<Vec<(String, Versioned)>> {
    Ok(Json(store.list(&req.prefix).await?))
}

pub async fn handle_meta_cas(
    Extension(store): Extension<Arc<dyn MetadataStore>>,
    Json(req): Json<MetaCas>,
) -> ApiResult<CasOutcome> {
    Ok(Json(store.compare_and_swap(&req.key, req.expected, req.value).await?))
}
