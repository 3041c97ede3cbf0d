//! Cluster Directory & Node Registry
//!
//! The authoritative record of node liveness, index settings, shard-to-replica
//! assignments and named locks, kept in an external metadata store.
//!
//! ## Core Mechanisms
//! - **Optimistic CAS**: every mutation is read-modify-compare-and-swap; conflicts back off and retry.
//! - **Locks**: a `LockRecord` with owner and expiry, taken and renewed by CAS. A failed renewal
//!   invalidates the holder's `LockHandle` at once.
//! - **Heartbeats**: `NodeRegistry` refreshes node records and demotes silent nodes
//!   `Alive -> Suspect -> Dead`.
//! - **Notifications**: store mutations are pushed to `DirectorySubscription`s.
//! - **Remote access**: nodes that do not host the store use `HttpMetadataStore`, which
//!   polls for changes.

pub mod registry;
pub mod remote;
pub mod service;
pub mod store;
pub mod types;
