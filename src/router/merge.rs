//! Merge Engine
//!
//! Combines shard-local results into one page. Hits are k-way merged with the
//! query's comparator; ties fall back to (shard, local rank) so the same
//! inputs always produce the same order.

use super::types::*;
use crate::index::types::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

/// One shard's contribution.
#[derive(Debug, Clone)]
pub struct ShardResponse {
    pub shard: u32,
    pub result: LocalSearchResult,
}

struct Cursor<'a> {
    sort: &'a SortSpec,
    shard: u32,
    rank: usize,
    hit: &'a LocalHit,
}

impl Cursor<'_> {
    /// Total order of the merged output: comparator, then shard, then rank.
    fn order(&self, other: &Self) -> Ordering {
        self.sort
            .compare(&self.hit.sort_values, &other.hit.sort_values)
            .then(self.shard.cmp(&other.shard))
            .then(self.rank.cmp(&other.rank))
    }
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.order(other) == Ordering::Equal
    }
}

impl Eq for Cursor<'_> {}

impl PartialOrd for Cursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor<'_> {
    // BinaryHeap pops the greatest; invert so the first-ranked pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other.order(self)
    }
}

/// Merges shard results into the requested page.
pub fn merge(
    sort: &SortSpec,
    page: Page,
    facets: &[FacetRequest],
    responses: &[ShardResponse],
    missing_shards: Vec<u32>,
) -> MergedResult {
    let window = page.window();
    let mut heap = BinaryHeap::with_capacity(responses.len());
    for response in responses {
        if let Some(hit) = response.result.hits.first() {
            heap.push(Cursor {
                sort,
                shard: response.shard,
                rank: 0,
                hit,
            });
        }
    }

    let by_shard: BTreeMap<u32, &LocalSearchResult> =
        responses.iter().map(|r| (r.shard, &r.result)).collect();

    let mut top = Vec::with_capacity(window.min(1024));
    while top.len() < window {
        let Some(cursor) = heap.pop() else {
            break;
        };
        let next_rank = cursor.rank + 1;
        if let Some(next) = by_shard
            .get(&cursor.shard)
            .and_then(|result| result.hits.get(next_rank))
        {
            heap.push(Cursor {
                sort,
                shard: cursor.shard,
                rank: next_rank,
                hit: next,
            });
        }
        top.push(MergedHit {
            doc_id: cursor.hit.doc_id.clone(),
            shard: cursor.shard,
            local_rank: cursor.rank,
            score: cursor.hit.score,
            sort_values: cursor.hit.sort_values.clone(),
            document: cursor.hit.document.clone(),
        });
    }
    let hits = top.into_iter().skip(page.offset).collect();

    let mut missing_shards = missing_shards;
    missing_shards.sort_unstable();
    missing_shards.dedup();

    MergedResult {
        hits,
        total: responses.iter().map(|r| r.result.total).sum(),
        facets: facets
            .iter()
            .map(|request| merge_facet(request, responses))
            .collect(),
        partial: !missing_shards.is_empty(),
        missing_shards,
        behind: false,
    }
}

/// Sums bucket counts across shards and bounds the error introduced by shards
/// that truncated their lists.
pub fn merge_facet(request: &FacetRequest, responses: &[ShardResponse]) -> MergedFacet {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    let mut reported: Vec<(Vec<&str>, u64)> = Vec::new();

    for response in responses {
        let Some(local) = response
            .result
            .facets
            .iter()
            .find(|f| f.field == request.field)
        else {
            continue;
        };
        for bucket in &local.buckets {
            *counts.entry(bucket.value.as_str()).or_insert(0) += bucket.count;
        }
        // Anything a truncating shard left out counts at most its smallest reported bucket
        let floor = if local.truncated {
            local.buckets.last().map(|b| b.count).unwrap_or(0)
        } else {
            0
        };
        let values = local.buckets.iter().map(|b| b.value.as_str()).collect();
        reported.push((values, floor));
    }

    let mut buckets: Vec<MergedBucket> = counts
        .into_iter()
        .map(|(value, count)| MergedBucket {
            value: value.to_string(),
            count,
            max_error: reported
                .iter()
                .filter(|(values, _)| !values.contains(&value))
                .map(|(_, floor)| *floor)
                .sum(),
        })
        .collect();
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    buckets.truncate(request.size);

    let max_value_possible_missing: u64 = reported.iter().map(|(_, floor)| *floor).sum();
    let possible_missing = max_value_possible_missing > 0
        && (buckets.len() < request.size
            || buckets
                .last()
                .is_some_and(|last| max_value_possible_missing >= last.count));

    MergedFacet {
        field: request.field.clone(),
        buckets,
        possible_missing,
        max_value_possible_missing,
    }
}
