use super::tokenizer::{tokenize_query, tokenize_text};
use super::types::*;
use crate::directory::types::ShardId;
use crate::error::{ClusterError, Result};

use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Write/commit/search primitives of one shard's embedded index.
///
/// Writes are buffered until `commit`; searches only see committed data.
pub trait LocalIndex: Send + Sync {
    fn write(&self, op: &WriteOp) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn search(&self, query: &ShardQuery) -> Result<LocalSearchResult>;
    fn snapshot(&self) -> Result<IndexSnapshot>;
    /// Replaces the whole index with `snapshot`, dropping uncommitted writes.
    fn restore(&self, snapshot: IndexSnapshot) -> Result<()>;
    fn doc_count(&self) -> usize;
    /// Committed payload of one document.
    fn get(&self, doc_id: &str) -> Result<Option<Value>>;
}

/// Opens a fresh local index for a shard newly hosted on this node.
pub trait IndexFactory: Send + Sync {
    fn open(&self, shard: &ShardId) -> Result<Arc<dyn LocalIndex>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryIndexFactory;

impl IndexFactory for MemoryIndexFactory {
    fn open(&self, _shard: &ShardId) -> Result<Arc<dyn LocalIndex>> {
        Ok(Arc::new(MemoryIndex::new()))
    }
}

#[derive(Default)]
struct Committed {
    documents: BTreeMap<String, Value>,
    /// field -> term -> doc ids
    postings: HashMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl Committed {
    fn insert(&mut self, doc_id: &str, payload: Value) {
        self.remove(doc_id);
        for (field, text) in text_fields(&payload) {
            let terms = self.postings.entry(field).or_default();
            for token in tokenize_text(&text) {
                terms.entry(token).or_default().insert(doc_id.to_string());
            }
        }
        self.documents.insert(doc_id.to_string(), payload);
    }

    fn remove(&mut self, doc_id: &str) {
        let Some(old) = self.documents.remove(doc_id) else {
            return;
        };
        for (field, text) in text_fields(&old) {
            if let Some(terms) = self.postings.get_mut(&field) {
                for token in tokenize_text(&text) {
                    if let Some(docs) = terms.get_mut(&token) {
                        docs.remove(doc_id);
                        if docs.is_empty() {
                            terms.remove(&token);
                        }
                    }
                }
            }
        }
    }

    /// Matching doc ids with their score.
    fn matches(&self, query: &QuerySpec) -> BTreeMap<&str, f64> {
        match query {
            QuerySpec::MatchAll => self.documents.keys().map(|id| (id.as_str(), 1.0)).collect(),
            QuerySpec::Terms { text, field } => {
                let mut scores: BTreeMap<&str, f64> = BTreeMap::new();
                for token in tokenize_query(text) {
                    // A document scores once per term, whichever fields hold it
                    let mut seen: BTreeSet<&str> = BTreeSet::new();
                    for (name, terms) in &self.postings {
                        if field.as_ref().is_some_and(|f| f != name) {
                            continue;
                        }
                        if let Some(docs) = terms.get(&token) {
                            seen.extend(docs.iter().map(String::as_str));
                        }
                    }
                    for doc_id in seen {
                        *scores.entry(doc_id).or_insert(0.0) += 1.0;
                    }
                }
                scores
            }
        }
    }
}

/// In-memory inverted index. One per hosted shard.
#[derive(Default)]
pub struct MemoryIndex {
    committed: RwLock<Committed>,
    pending: RwLock<Vec<WriteOp>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalIndex for MemoryIndex {
    fn write(&self, op: &WriteOp) -> Result<()> {
        if op.doc_id().is_empty() {
            return Err(ClusterError::InvalidRequest("empty document id".to_string()));
        }
        self.pending.write().push(op.clone());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let ops = std::mem::take(&mut *self.pending.write());
        let mut committed = self.committed.write();
        for op in ops {
            match op {
                WriteOp::Index { doc_id, payload } => committed.insert(&doc_id, payload),
                WriteOp::Delete { doc_id } => committed.remove(&doc_id),
            }
        }
        Ok(())
    }

    fn search(&self, query: &ShardQuery) -> Result<LocalSearchResult> {
        let committed = self.committed.read();
        let matches = committed.matches(&query.query);
        let sort = &query.sort;
        let fields = sort.fields();

        let mut hits: Vec<LocalHit> = matches
            .iter()
            .filter_map(|(doc_id, score)| {
                let document = committed.documents.get(*doc_id)?;
                let sort_values = fields
                    .iter()
                    .map(|f| match &f.key {
                        SortKey::Score => SortValue::Number(*score),
                        SortKey::Field(name) => SortValue::from_json(document.get(name)),
                    })
                    .collect();
                Some(LocalHit {
                    doc_id: doc_id.to_string(),
                    score: *score,
                    sort_values,
                    document: query.include_documents.then(|| document.clone()),
                })
            })
            .collect();

        hits.sort_by(|a, b| match sort.compare(&a.sort_values, &b.sort_values) {
            Ordering::Equal => a.doc_id.cmp(&b.doc_id),
            other => other,
        });
        let total = hits.len() as u64;
        hits.truncate(query.window);

        let facets = query
            .facets
            .iter()
            .map(|request| facet_counts(request, &committed.documents, matches.keys().copied()))
            .collect();

        Ok(LocalSearchResult {
            hits,
            total,
            facets,
            ..Default::default()
        })
    }

    fn snapshot(&self) -> Result<IndexSnapshot> {
        Ok(IndexSnapshot {
            documents: self.committed.read().documents.clone(),
        })
    }

    fn restore(&self, snapshot: IndexSnapshot) -> Result<()> {
        let mut fresh = Committed::default();
        for (doc_id, payload) in snapshot.documents {
            fresh.insert(&doc_id, payload);
        }
        self.pending.write().clear();
        *self.committed.write() = fresh;
        Ok(())
    }

    fn doc_count(&self) -> usize {
        self.committed.read().documents.len()
    }

    fn get(&self, doc_id: &str) -> Result<Option<Value>> {
        Ok(self.committed.read().documents.get(doc_id).cloned())
    }
}

fn facet_counts<'a>(
    request: &FacetRequest,
    documents: &BTreeMap<String, Value>,
    matching: impl Iterator<Item = &'a str>,
) -> LocalFacet {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for doc_id in matching {
        let Some(value) = documents.get(doc_id).and_then(|d| d.get(&request.field)) else {
            continue;
        };
        for key in facet_keys(value) {
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    let mut buckets: Vec<FacetBucket> = counts
        .into_iter()
        .map(|(value, count)| FacetBucket { value, count })
        .collect();
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));

    let shard_size = request.effective_shard_size();
    let truncated = buckets.len() > shard_size;
    buckets.truncate(shard_size);

    LocalFacet {
        field: request.field.clone(),
        buckets,
        truncated,
    }
}

fn facet_keys(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Number(n) => vec![n.to_string()],
        Value::Bool(b) => vec![b.to_string()],
        Value::Array(items) => items.iter().flat_map(facet_keys).collect(),
        _ => Vec::new(),
    }
}

/// Top-level string fields (and string arrays) of a document.
fn text_fields(payload: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = payload else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(name, value)| match value {
            Value::String(s) => Some((name.clone(), s.clone())),
            Value::Array(items) => {
                let joined: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                (!joined.is_empty()).then(|| (name.clone(), joined.join(" ")))
            }
            _ => None,
        })
        .collect()
}
