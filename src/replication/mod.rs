//! Replication Manager
//!
//! Per-shard write ordering and propagation.
//!
//! ## Core Mechanisms
//! - **Primary**: applies each write locally, assigns the shard's next `CommitToken`, ships the
//!   operation to every replica and reports durability once the write quorum has acknowledged.
//! - **Replica**: applies operations strictly in token order. Out-of-order arrivals wait in a
//!   `PendingLog` keyed by token; an overflowing buffer triggers a snapshot resync.
//! - **Catch-up**: the primary retains recent operations for replay. Replicas that are too far
//!   behind, or whose history may diverge from a newly promoted primary, receive a full snapshot.
//! - **Promotion**: a replica promoted by the planner continues the token sequence from its own
//!   applied token; tokens are never reused.

pub mod log;
pub mod manager;
pub mod primary;
pub mod replica;
pub mod types;

#[cfg(test)]
mod tests;
