//! Query/Result Cache
//!
//! Merged results keyed by index, index generation and the normalized query.
//! A write bumps the generation, so older entries are simply never looked up
//! again and age out of the LRU. Concurrent misses on one key share a single
//! computation.

pub mod service;
