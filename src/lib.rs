//! Sharded Search Cluster Library
//!
//! Distribution layer of a full-text search cluster: index shards are placed
//! on nodes, replicated under a write quorum, failed over on node loss, and
//! queried in parallel with the shard answers merged into one ranked page.
//! The binary (`main.rs`) wires these modules into one node.
//!
//! ## Architecture Modules
//! - **`directory`**: Authoritative cluster state (nodes, indexes, shard assignments, locks)
//!   kept in a compare-and-swap metadata store, plus heartbeat-driven node liveness.
//! - **`planner`**: The single active shard planner. Places replicas on the least-loaded
//!   nodes and promotes a replica when a primary is lost.
//! - **`index`**: The shard-local index seam and its in-memory implementation.
//! - **`replication`**: Per-shard commit tokens, operation shipping, quorum waits,
//!   out-of-order buffering and resync.
//! - **`router`**: Routing of writes to primaries and of queries to healthy copies, and the
//!   k-way merge of shard results.
//! - **`cache`**: Generation-keyed query result cache with request coalescing.
//! - **`transport`**: The node-to-node RPC seam (HTTP and in-process).
//! - **`api`**: The axum HTTP surface.
//! - **`node`**: One cluster member and its background loops.

pub mod api;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod index;
pub mod node;
pub mod planner;
pub mod replication;
pub mod retry;
pub mod router;
pub mod transport;
