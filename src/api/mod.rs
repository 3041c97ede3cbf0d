//! HTTP Surface
//!
//! One axum router per node carrying both the client API and the internal
//! node-to-node RPCs. Failures answer with a status derived from the error
//! kind and the serialized `ClusterError` as the body.
//!
//! ## Submodules
//! - **`handlers`**: Request handlers and the `ApiError` response mapping.
//! - **`protocol`**: Client endpoints and DTOs.

pub mod handlers;
pub mod protocol;


use crate::directory::remote::{ENDPOINT_META_CAS, ENDPOINT_META_GET, ENDPOINT_META_LIST};
use crate::directory::store::MetadataStore;
use crate::node::SearchNode;
use crate::transport::protocol::*;

use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use handlers::*;
use protocol::*;
use std::sync::Arc;

/// Builds the node's router. `hosted_store` is set on the node that serves
/// the metadata store to the rest of the cluster.
pub fn router(node: Arc<SearchNode>, hosted_store: Option<Arc<dyn MetadataStore>>) -> Router {
    let mut app = Router::new()
        .route(ENDPOINT_DOCUMENTS, post(handle_write_document))
        .route(ENDPOINT_DOCUMENTS_DELETE, post(handle_delete_document))
        .route(ENDPOINT_DOCUMENTS_FETCH, post(handle_fetch_document))
        .route(ENDPOINT_QUERY, post(handle_query))
        .route(ENDPOINT_INDEXES, post(handle_create_index))
        .route(ENDPOINT_INDEXES_DELETE, post(handle_delete_index))
        .route(ENDPOINT_HEARTBEAT, post(handle_heartbeat))
        .route(ENDPOINT_CLUSTER, get(handle_cluster))
        .route(ENDPOINT_CACHE_STATS, get(handle_cache_stats))
        .route(ENDPOINT_WRITE, post(handle_internal_write))
        .route(ENDPOINT_REPLICATE, post(handle_internal_replicate))
        .route(ENDPOINT_ACK, post(handle_internal_ack))
        .route(ENDPOINT_SEARCH, post(handle_internal_search))
        .route(ENDPOINT_SYNC, post(handle_internal_sync))
        .route(ENDPOINT_FETCH, post(handle_internal_fetch));

    if let Some(store) = hosted_store {
        app = app
            .route(ENDPOINT_META_GET, post(handle_meta_get))
            .route(ENDPOINT_META_LIST, post(handle_meta_list))
            .route(ENDPOINT_META_CAS, post(handle_meta_cas))
            .layer(Extension(store));
    }

    app.layer(Extension(node))
}
