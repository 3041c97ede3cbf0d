use crate::directory::types::CommitToken;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One mutation against a shard's local index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Index { doc_id: String, payload: Value },
    Delete { doc_id: String },
}

impl WriteOp {
    pub fn doc_id(&self) -> &str {
        match self {
            WriteOp::Index { doc_id, .. } | WriteOp::Delete { doc_id } => doc_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuerySpec {
    #[default]
    MatchAll,
    /// Documents containing any of the terms of `text`, scored by the number
    /// of distinct terms matched. `field` restricts matching to one field.
    Terms {
        text: String,
        #[serde(default)]
        field: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Score,
    Field(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SortField {
    pub key: SortKey,
    pub order: SortOrder,
}

/// Ordered sort criteria. Empty means score descending.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SortSpec(pub Vec<SortField>);

impl SortSpec {
    pub fn by_score() -> Self {
        SortSpec(vec![SortField {
            key: SortKey::Score,
            order: SortOrder::Desc,
        }])
    }

    pub fn by_field(field: &str, order: SortOrder) -> Self {
        SortSpec(vec![SortField {
            key: SortKey::Field(field.to_string()),
            order,
        }])
    }

    /// The effective criteria: empty specs sort by score.
    pub fn fields(&self) -> Vec<SortField> {
        if self.0.is_empty() {
            Self::by_score().0
        } else {
            self.0.clone()
        }
    }

    /// Comparator shared by local ranking and the cross-shard merge.
    /// `a` and `b` are sort values aligned with [`SortSpec::fields`].
    pub fn compare(&self, a: &[SortValue], b: &[SortValue]) -> Ordering {
        for (i, field) in self.fields().iter().enumerate() {
            let left = a.get(i).unwrap_or(&SortValue::Missing);
            let right = b.get(i).unwrap_or(&SortValue::Missing);
            let ord = match (left, right) {
                // Missing values go last whichever the direction
                (SortValue::Missing, SortValue::Missing) => Ordering::Equal,
                (SortValue::Missing, _) => Ordering::Greater,
                (_, SortValue::Missing) => Ordering::Less,
                _ => match field.order {
                    SortOrder::Asc => left.cmp(right),
                    SortOrder::Desc => right.cmp(left),
                },
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// A value a hit is sorted on. Numbers order before text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortValue {
    Number(f64),
    Text(String),
    Missing,
}

impl SortValue {
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) => n.as_f64().map(SortValue::Number).unwrap_or(SortValue::Missing),
            Some(Value::String(s)) => SortValue::Text(s.clone()),
            Some(Value::Bool(b)) => SortValue::Number(if *b { 1.0 } else { 0.0 }),
            _ => SortValue::Missing,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortValue::Number(_) => 0,
            SortValue::Text(_) => 1,
            SortValue::Missing => 2,
        }
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Number(a), SortValue::Number(b)) => a.total_cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Hits each shard must return: `offset + limit`.
    pub fn window(&self) -> usize {
        self.offset.saturating_add(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FacetRequest {
    pub field: String,
    pub size: usize,
    /// Buckets each shard reports. Defaults to `size`; larger values tighten
    /// the merged error bound.
    #[serde(default)]
    pub shard_size: Option<usize>,
}

impl FacetRequest {
    pub fn new(field: &str, size: usize) -> Self {
        Self {
            field: field.to_string(),
            size,
            shard_size: None,
        }
    }

    pub fn effective_shard_size(&self) -> usize {
        self.shard_size.unwrap_or(self.size).max(self.size)
    }
}

/// What a single shard is asked to evaluate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardQuery {
    pub query: QuerySpec,
    pub sort: SortSpec,
    /// Local top-K to return.
    pub window: usize,
    #[serde(default)]
    pub facets: Vec<FacetRequest>,
    #[serde(default)]
    pub include_documents: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalHit {
    pub doc_id: String,
    pub score: f64,
    pub sort_values: Vec<SortValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FacetBucket {
    pub value: String,
    pub count: u64,
}

/// One shard's facet counts, truncated to the shard size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalFacet {
    pub field: String,
    pub buckets: Vec<FacetBucket>,
    /// True when buckets beyond the shard size were dropped.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalSearchResult {
    /// Sorted by the query's sort spec; at most `window` entries.
    pub hits: Vec<LocalHit>,
    /// Every matching document on the shard, not just the window.
    pub total: u64,
    pub facets: Vec<LocalFacet>,
    /// Last commit the answering copy had applied.
    #[serde(default)]
    pub applied: CommitToken,
}

/// Full contents of a local index, used for replica resync.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndexSnapshot {
    pub documents: BTreeMap<String, Value>,
}
