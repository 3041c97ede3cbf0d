//! Shard Assignment Planner
//!
//! Decides which nodes host which copy of every shard. Runs on exactly one
//! node at a time: whoever holds the directory's planner lock.
//!
//! ## Core Mechanisms
//! - **Leadership**: the `planner` lock is acquired and renewed by CAS; a failed renewal
//!   ends planning on this node before the next mutation.
//! - **Placement**: `plan_shard` keeps surviving copies, promotes the most advanced replica
//!   when the primary is gone, and fills empty slots on the least-loaded alive nodes.
//! - **Load**: `NodeLoads` weighs each hosted shard by its index weight and the node's capacity.
//! - **Publication**: each shard's replica set is written as one record with a bumped epoch.

pub mod load;
pub mod plan;
pub mod planner;
