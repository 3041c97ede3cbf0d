//! Write & Query Routing
//!
//! Turns client requests into shard-level RPCs.
//!
//! ## Responsibilities
//! - **Placement**: `stableHash(routingKey or documentId) mod shardCount` picks a document's shard.
//! - **Writes**: forwarded to the shard's primary as seen in a TTL-cached assignment view.
//! - **Queries**: one healthy copy per shard, queried in parallel under a shared deadline.
//! - **Merge**: shard-local top-K lists and facet partials combined into one page.
//!
//! ## Submodules
//! - **`hashing`**: The stable hash.
//! - **`merge`**: K-way hit merge and facet merge.
//! - **`query`**: `QueryRouter`, fan-out and failure policy.
//! - **`types`**: Client-facing request and result types.
//! - **`view`**: `AssignmentView`, the routers' cached read of the directory.
//! - **`write`**: `WriteRouter`.

pub mod hashing;
pub mod merge;
pub mod query;
pub mod types;
pub mod view;
pub mod write;
