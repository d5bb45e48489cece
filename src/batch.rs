//! Batch planner: bucket a list of queries by best candidate provider,
//! sub-group object-store buckets by file, and issue chunked batch calls
//! against HTTP providers, all bounded by concurrency and preserving
//! input order in the output (spec.md §4.6).
//!
//! The bucket/sub-group/dispatch shape mirrors
//! `tile_downloader::TileDownloader`'s fixed-size `tokio::sync::Semaphore`
//! guarding concurrent fetches, generalized from "download at most N
//! tiles at once" to "resolve at most N points at once" per bucket, plus
//! a batch call per chunk for HTTP-backed buckets. A point whose bucketed
//! attempt doesn't produce a clean hit falls back to the full
//! [`Resolver::resolve`] provider chain — the exception path, not the
//! rule (spec.md §4.6 "partial failures within a bucket degrade to
//! per-point fallback").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::ConcurrencyConfig;
use crate::selector::{BatchBucketKey, Resolver};
use crate::types::{ProviderId, Query, QueryResult};

/// Metadata the object-store bucket needs per point, carried alongside
/// the bucket key so the per-file sub-group doesn't have to re-run the
/// spatial index scan.
#[derive(Debug, Clone)]
struct ObjectStoreAssignment {
    provider: ProviderId,
    file_index: usize,
    dataset_id: String,
    resolution_m: f64,
}

/// Runs a batch of queries through a [`Resolver`], bounded by
/// `batch_worker_pool_size` concurrent in-flight resolutions. A single
/// point's failure never aborts the batch: it degrades to that point's
/// own `QueryResult::no_coverage` so the caller always gets one result
/// per input query, in input order.
pub struct BatchPlanner {
    resolver: Arc<Resolver>,
    concurrency: ConcurrencyConfig,
    batch_timeout: Duration,
}

impl BatchPlanner {
    pub fn new(resolver: Arc<Resolver>, concurrency: ConcurrencyConfig, batch_timeout: Duration) -> Self {
        Self {
            resolver,
            concurrency,
            batch_timeout,
        }
    }

    pub async fn resolve_batch(&self, queries: Vec<Query>) -> Vec<QueryResult> {
        let n = queries.len();
        let mut results: Vec<Option<QueryResult>> = vec![None; n];

        let collect = async {
            // Phase 1: bucket every point by its best candidate provider
            // via a prefix scan of the spatial index (no I/O yet).
            let mut object_store_buckets: HashMap<(ProviderId, usize), Vec<usize>> = HashMap::new();
            let mut object_store_assignments: HashMap<usize, ObjectStoreAssignment> = HashMap::new();
            let mut http_buckets: HashMap<ProviderId, Vec<usize>> = HashMap::new();
            let mut fallback_indices: Vec<usize> = Vec::new();

            for (index, query) in queries.iter().enumerate() {
                match self.resolver.plan(query) {
                    BatchBucketKey::ObjectStore {
                        provider,
                        file_index,
                        dataset_id,
                        resolution_m,
                    } => {
                        object_store_buckets
                            .entry((provider.clone(), file_index))
                            .or_default()
                            .push(index);
                        object_store_assignments.insert(
                            index,
                            ObjectStoreAssignment {
                                provider,
                                file_index,
                                dataset_id,
                                resolution_m,
                            },
                        );
                    }
                    BatchBucketKey::Http { provider } => {
                        http_buckets.entry(provider).or_default().push(index);
                    }
                    BatchBucketKey::Unresolved => fallback_indices.push(index),
                }
            }

            // Phase 2a: object-store buckets, sub-grouped by file so
            // concurrent points against the same raster share its warm
            // header cache (spec.md §4.6 step 2).
            let semaphore = Arc::new(Semaphore::new(self.concurrency.batch_worker_pool_size));
            let mut in_flight = FuturesUnordered::new();
            for (_, indices) in object_store_buckets {
                for index in indices {
                    let assignment = object_store_assignments[&index].clone();
                    let resolver = self.resolver.clone();
                    let semaphore = semaphore.clone();
                    let query = queries[index].clone();
                    in_flight.push(async move {
                        let _permit = semaphore.acquire_owned().await;
                        let hit = resolver
                            .resolve_bucketed_object_store_point(
                                &assignment.provider,
                                assignment.file_index,
                                &assignment.dataset_id,
                                assignment.resolution_m,
                                &query,
                            )
                            .await;
                        (index, hit)
                    });
                }
            }
            while let Some((index, hit)) = in_flight.next().await {
                match hit {
                    Some(result) => results[index] = Some(result),
                    None => fallback_indices.push(index),
                }
            }

            // Phase 2b: HTTP buckets, chunked to bound single-request
            // size (spec.md §4.6 step 2, `http_batch_chunk_size`).
            let chunk_size = self.concurrency.http_batch_chunk_size.max(1);
            let mut http_in_flight = FuturesUnordered::new();
            for (provider, indices) in http_buckets {
                for chunk in indices.chunks(chunk_size) {
                    let provider = provider.clone();
                    let resolver = self.resolver.clone();
                    let points: Vec<(usize, Query)> =
                        chunk.iter().map(|&i| (i, queries[i].clone())).collect();
                    let semaphore = semaphore.clone();
                    http_in_flight.push(async move {
                        let _permit = semaphore.acquire_owned().await;
                        resolver.resolve_bucketed_http_batch(&provider, &points).await
                    });
                }
            }
            while let Some(outcomes) = http_in_flight.next().await {
                for (index, outcome) in outcomes {
                    match outcome {
                        Some(result) => results[index] = Some(result),
                        None => fallback_indices.push(index),
                    }
                }
            }

            // Phase 3 (exception path): anything the bucketed pipeline
            // didn't resolve cleanly falls back to the full provider
            // chain, one point at a time.
            let mut fallback_in_flight = FuturesUnordered::new();
            for index in fallback_indices {
                let resolver = self.resolver.clone();
                let semaphore = semaphore.clone();
                let query = queries[index].clone();
                fallback_in_flight.push(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = resolver.resolve(&query).await;
                    (index, result)
                });
            }
            while let Some((index, result)) = fallback_in_flight.next().await {
                let query_result = result.unwrap_or_else(|_| QueryResult::no_coverage(0));
                results[index] = Some(query_result);
            }
        };

        if timeout(self.batch_timeout, collect).await.is_err() {
            tracing::warn!("batch deadline exceeded before all points resolved");
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| QueryResult::no_coverage(0)))
            .collect()
    }
}
