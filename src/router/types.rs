use crate::index::tokenizer::tokenize_query;
use crate::index::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub index: String,
    pub doc_id: String,
    /// Hashed instead of `doc_id` when present, to co-locate related documents.
    #[serde(default)]
    pub routing_key: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub index: String,
    pub doc_id: String,
    #[serde(default)]
    pub routing_key: Option<String>,
}

/// Point read of one document, routed like a write to the shard that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub index: String,
    pub doc_id: String,
    /// Must match the routing key the document was written with.
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub read_preference: ReadPreference,
}

impl FetchRequest {
    pub fn new(index: &str, doc_id: &str) -> Self {
        Self {
            index: index.to_string(),
            doc_id: doc_id.to_string(),
            routing_key: None,
            read_preference: ReadPreference::Any,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchedDocument {
    pub doc_id: String,
    pub shard: u32,
    /// `None` when the owning shard holds no such document.
    pub document: Option<Value>,
}

/// Which healthy copies of a shard a query prefers. When the preferred set is
/// empty any live healthy copy is used.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    #[default]
    Any,
    PrimaryOnly,
    ReplicaOnly,
    PrimaryPreferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub index: String,
    #[serde(default)]
    pub query: QuerySpec,
    #[serde(default)]
    pub sort: SortSpec,
    #[serde(default)]
    pub page: Page,
    #[serde(default)]
    pub facets: Vec<FacetRequest>,
    /// Skip unavailable shards instead of failing; the result is flagged partial.
    #[serde(default)]
    pub partial_allowed: bool,
    #[serde(default)]
    pub read_preference: ReadPreference,
    #[serde(default)]
    pub include_documents: bool,
}

impl QueryRequest {
    pub fn new(index: &str, query: QuerySpec) -> Self {
        Self {
            index: index.to_string(),
            query,
            sort: SortSpec::default(),
            page: Page::default(),
            facets: Vec::new(),
            partial_allowed: false,
            read_preference: ReadPreference::Any,
            include_documents: false,
        }
    }

    pub fn terms(index: &str, text: &str) -> Self {
        Self::new(
            index,
            QuerySpec::Terms {
                text: text.to_string(),
                field: None,
            },
        )
    }

    pub fn shard_query(&self) -> ShardQuery {
        ShardQuery {
            query: self.query.clone(),
            sort: self.sort.clone(),
            window: self.page.window(),
            facets: self.facets.clone(),
            include_documents: self.include_documents,
        }
    }

    /// The parts of the request that determine its result, in canonical
    /// form. Term order, case and duplicates do not matter; an empty sort is
    /// the explicit score sort.
    pub fn normalized(&self) -> NormalizedQuery {
        let query = match &self.query {
            QuerySpec::MatchAll => QuerySpec::MatchAll,
            QuerySpec::Terms { text, field } => QuerySpec::Terms {
                text: tokenize_query(text).join(" "),
                field: field.clone(),
            },
        };
        NormalizedQuery {
            query,
            sort: SortSpec(self.sort.fields()),
            page: self.page,
            facets: self.facets.clone(),
            include_documents: self.include_documents,
            partial_allowed: self.partial_allowed,
            read_preference: self.read_preference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NormalizedQuery {
    pub query: QuerySpec,
    pub sort: SortSpec,
    pub page: Page,
    pub facets: Vec<FacetRequest>,
    pub include_documents: bool,
    /// Kept so a strict request never shares a partial in-flight result.
    pub partial_allowed: bool,
    /// Copies differ in what they have applied, so the copy set is part of
    /// the answer.
    pub read_preference: ReadPreference,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedHit {
    pub doc_id: String,
    pub shard: u32,
    /// Position in the shard's own ranking, from 0.
    pub local_rank: usize,
    pub score: f64,
    pub sort_values: Vec<SortValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergedBucket {
    pub value: String,
    pub count: u64,
    /// Upper bound on counts missed in shards that did not report this bucket.
    pub max_error: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergedFacet {
    pub field: String,
    pub buckets: Vec<MergedBucket>,
    /// A bucket no shard reported could still belong in `buckets`.
    pub possible_missing: bool,
    /// Highest count such an unreported bucket could have.
    pub max_value_possible_missing: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MergedResult {
    pub hits: Vec<MergedHit>,
    /// Sum of shard totals; a lower bound when `partial`.
    pub total: u64,
    pub facets: Vec<MergedFacet>,
    pub partial: bool,
    pub missing_shards: Vec<u32>,
    /// Some shard answered from a copy that had not applied every write of
    /// the generation it was asked under. Handed out but never cached.
    #[serde(skip)]
    pub behind: bool,
}
