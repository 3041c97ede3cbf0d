//! Local Index Adapter
//!
//! Each hosted shard owns one local index behind the [`engine::LocalIndex`]
//! seam: buffered `write`, `commit`, ranked `search` with facets, and whole
//! index `snapshot`/`restore` for replica resync.
//!
//! ## Submodules
//! - **`engine`**: The seam traits and `MemoryIndex`, an in-memory inverted index.
//! - **`tokenizer`**: Term extraction for documents and queries.
//! - **`types`**: Write operations, query/sort/page/facet specs and shard-local results.

pub mod engine;
pub mod tokenizer;
pub mod types;
