//! Source selector: the single-point `resolve` entry point that ties the
//! spatial index, scorer, reliability layer, and readers together
//! (spec.md §4.5).
//!
//! The priority-ordered-chain-with-fallback shape is the same one this
//! codebase already uses for geocoding (Nominatim, then Google Maps):
//! try the next source on a transient failure, give up and report
//! no-coverage only once every source has been tried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::api_client::ApiClient;
use crate::cache::BoundedCache;
use crate::config::ResolverConfig;
use crate::error::{IsTransient, ObjectStoreError, ResolverError};
use crate::object_store::ObjectStoreReader;
use crate::reliability::{Admission, ReliabilityLayer};
use crate::scorer;
use crate::spatial_index::SpatialIndex;
use crate::types::{ProviderDescriptor, ProviderId, Query, QueryResult};

/// Why a single provider attempt didn't produce a hit or a clean
/// no-coverage answer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TryFailure {
    /// Failed in a way that should fail over to the next provider, with
    /// a breaker event recorded against this one.
    Transient,
    /// A contract was violated (e.g. the index matched a file the reader
    /// says doesn't actually cover the point). Surfaced to the caller,
    /// never silently retried.
    Logic(String),
}

/// Where the batch planner should send a point without doing any I/O
/// (spec.md §4.6 step 1: "prefix scan of the SpatialIndex").
#[derive(Debug, Clone)]
pub(crate) enum BatchBucketKey {
    ObjectStore {
        provider: ProviderId,
        file_index: usize,
        dataset_id: String,
        resolution_m: f64,
    },
    Http {
        provider: ProviderId,
    },
    /// No configured provider can be pre-assigned for this point (no
    /// index coverage and no HTTP fallback, or an empty provider list);
    /// it still needs to go through the full provider chain.
    Unresolved,
}

/// Everything the selector needs to answer a query, wired together at
/// startup and shared read-only (besides the reliability layer and
/// caches, which are internally synchronized) across every request.
pub struct Resolver {
    index: Arc<SpatialIndex>,
    config: ResolverConfig,
    reliability: Arc<ReliabilityLayer>,
    cache: BoundedCache,
    object_store: Arc<ObjectStoreReader>,
    api_clients: HashMap<ProviderId, Arc<ApiClient>>,
}

impl Resolver {
    pub fn new(
        index: Arc<SpatialIndex>,
        config: ResolverConfig,
        reliability: Arc<ReliabilityLayer>,
        cache: BoundedCache,
        object_store: Arc<ObjectStoreReader>,
        api_clients: HashMap<ProviderId, Arc<ApiClient>>,
    ) -> Self {
        Self {
            index,
            config,
            reliability,
            cache,
            object_store,
            api_clients,
        }
    }

    /// Resolve a single query against the priority-ordered provider
    /// chain, falling back on transient failure (spec.md §4.5, §7).
    pub async fn resolve(&self, query: &Query) -> Result<QueryResult, ResolverError> {
        let start = Instant::now();
        let order = self.provider_order(query);

        for provider in &order {
            if let Some(deadline) = query.deadline
                && Instant::now() >= deadline
            {
                return Err(ResolverError::Timeout);
            }

            let provider_id = provider.name();
            match self.reliability.admit(provider_id).await {
                Admission::BreakerOpen => {
                    debug!(provider = %provider_id, "breaker open, skipping");
                    continue;
                }
                Admission::Allowed => {}
            }

            let Some(semaphore) = self.reliability.semaphore(provider_id) else {
                continue;
            };
            let Ok(_permit) = semaphore.try_acquire() else {
                warn!(provider = %provider_id, "provider concurrency saturated");
                continue;
            };

            let outcome = match provider {
                ProviderDescriptor::ObjectStore { .. } => {
                    self.try_object_store(provider_id, query).await
                }
                ProviderDescriptor::HttpApi { .. } => self.try_api(provider_id, query).await,
            };

            match outcome {
                Ok(Some((elevation_m, dataset_id, resolution_m))) => {
                    self.reliability.record(provider_id, true).await;
                    return Ok(QueryResult {
                        elevation_m: Some(elevation_m),
                        provider_used: provider_id.to_string(),
                        dataset_id,
                        resolution_m,
                        latency_ms: start.elapsed().as_millis() as u32,
                    });
                }
                Ok(None) => {
                    // No coverage from this provider; try the next, no
                    // breaker penalty since this isn't a failure.
                    continue;
                }
                Err(TryFailure::Transient) => {
                    self.reliability.record(provider_id, false).await;
                    continue;
                }
                Err(TryFailure::Logic(msg)) => {
                    return Err(ResolverError::LogicError(msg));
                }
            }
        }

        Ok(QueryResult::no_coverage(start.elapsed().as_millis() as u32))
    }

    /// Remaining time until `query.deadline`, or `default` if the query
    /// carries none. Used to bound a single provider attempt (spec.md
    /// §4.7, §5): a deadline already in the past collapses to zero so the
    /// wrapped call fails immediately instead of blocking at all.
    fn remaining_or_default(&self, query: &Query, default: Duration) -> Duration {
        match query.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => default,
        }
    }

    /// Provider order for this query: an explicit `preferred_provider`
    /// goes first if it names a configured provider, then the rest of
    /// the chain by descending priority.
    fn provider_order(&self, query: &Query) -> Vec<ProviderDescriptor> {
        let mut providers = self.config.providers.clone();
        providers.sort_by(|a, b| b.priority().cmp(&a.priority()));

        if let Some(preferred) = &query.preferred_provider {
            if let Some(pos) = providers.iter().position(|p| p.name().0 == *preferred) {
                let chosen = providers.remove(pos);
                providers.insert(0, chosen);
            }
        }
        providers
    }

    /// Returns `Ok(Some((elevation, dataset_id, resolution)))` on a hit,
    /// `Ok(None)` if the index has no usable coverage for this provider,
    /// `Err(TryFailure)` on failure.
    async fn try_object_store(
        &self,
        provider_id: &ProviderId,
        query: &Query,
    ) -> Result<Option<(f64, Option<String>, Option<f64>)>, TryFailure> {
        if let Some(cached) = self
            .cache
            .get_point(query.lat, query.lon, &provider_id.0)
            .await
        {
            return Ok(cached.map(|elevation| (elevation, None, None)));
        }

        let candidates = self.index.lookup(query.lat, query.lon);
        if candidates.is_empty() {
            self.cache.put_point(query.lat, query.lon, &provider_id.0, None).await;
            return Ok(None);
        }

        let datasets: Vec<_> = candidates.iter().map(|c| c.dataset.clone()).collect();
        let (ranked, _confidence) = scorer::rank(&datasets, &self.config.scoring_weights);

        let top_n = self.config.max_candidate_datasets_before_escalation.max(1);
        for scored in ranked.iter().take(top_n) {
            let Some(candidate) = candidates
                .iter()
                .find(|c| c.dataset.id == scored.dataset.id)
            else {
                continue;
            };

            match self
                .sample_candidate(
                    provider_id,
                    candidate.file_index,
                    &scored.dataset.id.0,
                    scored.dataset.resolution_m,
                    query,
                )
                .await
            {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => continue, // nodata: escalate to the next-best candidate dataset
                Err(failure) => return Err(failure),
            }
        }

        self.cache.put_point(query.lat, query.lon, &provider_id.0, None).await;
        Ok(None)
    }

    /// Sample a single, already-chosen `(provider, file)` pair: cache
    /// lookup, a deadline-bounded reader call, and cache write-back. This
    /// is the unit of work the escalation loop in `try_object_store` and
    /// the batch planner's per-file buckets both drive (spec.md §4.3,
    /// §4.6, §4.7).
    pub(crate) async fn sample_candidate(
        &self,
        provider_id: &ProviderId,
        file_index: usize,
        dataset_id: &str,
        resolution_m: f64,
        query: &Query,
    ) -> Result<Option<(f64, Option<String>, Option<f64>)>, TryFailure> {
        if let Some(cached) = self
            .cache
            .get_point(query.lat, query.lon, &provider_id.0)
            .await
        {
            return Ok(cached.map(|elevation| (elevation, Some(dataset_id.to_string()), Some(resolution_m))));
        }
        let Some(file) = self.index.file(file_index) else {
            return Ok(None);
        };

        let budget = self.remaining_or_default(query, self.config.timeouts.object_store());
        match timeout(budget, self.object_store.sample(file, query.lat, query.lon)).await {
            Ok(Ok(elevation)) => {
                self.cache
                    .put_point(query.lat, query.lon, &provider_id.0, Some(elevation))
                    .await;
                Ok(Some((elevation, Some(dataset_id.to_string()), Some(resolution_m))))
            }
            Ok(Err(ObjectStoreError::NoData)) => {
                self.cache.put_point(query.lat, query.lon, &provider_id.0, None).await;
                Ok(None)
            }
            Ok(Err(ObjectStoreError::OutOfBounds)) => Err(TryFailure::Logic(format!(
                "spatial index matched file {} for ({}, {}) but the reader reports it out of bounds",
                file.storage_key, query.lat, query.lon
            ))),
            Ok(Err(err)) if err.is_transient() => Err(TryFailure::Transient),
            Ok(Err(err)) => Err(TryFailure::Logic(err.to_string())),
            Err(_elapsed) => {
                warn!(provider = %provider_id, "object-store read deadline exceeded");
                Err(TryFailure::Transient)
            }
        }
    }

    async fn try_api(
        &self,
        provider_id: &ProviderId,
        query: &Query,
    ) -> Result<Option<(f64, Option<String>, Option<f64>)>, TryFailure> {
        if let Some(cached) = self
            .cache
            .get_point(query.lat, query.lon, &provider_id.0)
            .await
        {
            return Ok(cached.map(|elevation| (elevation, None, None)));
        }

        let Some(client) = self.api_clients.get(provider_id) else {
            return Ok(None);
        };

        let budget = self.remaining_or_default(query, self.config.timeouts.http_api());
        match timeout(budget, client.point(query.lat, query.lon)).await {
            Ok(Ok(Some(elevation))) => {
                self.cache
                    .put_point(query.lat, query.lon, &provider_id.0, Some(elevation))
                    .await;
                Ok(Some((elevation, None, None)))
            }
            Ok(Ok(None)) => {
                self.cache.put_point(query.lat, query.lon, &provider_id.0, None).await;
                Ok(None)
            }
            Ok(Err(err)) if err.is_transient() => Err(TryFailure::Transient),
            Ok(Err(err)) => Err(TryFailure::Logic(err.to_string())),
            Err(_elapsed) => {
                warn!(provider = %provider_id, "http api call deadline exceeded");
                Err(TryFailure::Transient)
            }
        }
    }

    /// Determine the best candidate for a point without performing any
    /// I/O: a prefix scan of the spatial index plus a scorer ranking,
    /// used by the batch planner to bucket points before dispatching
    /// (spec.md §4.6 step 1).
    pub(crate) fn plan(&self, query: &Query) -> BatchBucketKey {
        let candidates = self.index.lookup(query.lat, query.lon);
        if !candidates.is_empty()
            && let Some(provider) = self.first_object_store_provider()
        {
            let datasets: Vec<_> = candidates.iter().map(|c| c.dataset.clone()).collect();
            let (ranked, _confidence) = scorer::rank(&datasets, &self.config.scoring_weights);
            if let Some(top) = ranked.first()
                && let Some(candidate) = candidates.iter().find(|c| c.dataset.id == top.dataset.id)
            {
                return BatchBucketKey::ObjectStore {
                    provider: provider.clone(),
                    file_index: candidate.file_index,
                    dataset_id: top.dataset.id.0.clone(),
                    resolution_m: top.dataset.resolution_m,
                };
            }
        }

        if let Some(provider) = self.first_http_provider() {
            return BatchBucketKey::Http {
                provider: provider.clone(),
            };
        }

        BatchBucketKey::Unresolved
    }

    fn first_object_store_provider(&self) -> Option<&ProviderId> {
        self.config.providers.iter().find_map(|p| match p {
            ProviderDescriptor::ObjectStore { name, .. } => Some(name),
            ProviderDescriptor::HttpApi { .. } => None,
        })
    }

    fn first_http_provider(&self) -> Option<&ProviderId> {
        self.config.providers.iter().find_map(|p| match p {
            ProviderDescriptor::HttpApi { name, .. } => Some(name),
            ProviderDescriptor::ObjectStore { .. } => None,
        })
    }

    /// Run a single already-bucketed object-store point: admission,
    /// concurrency, the deadline-bounded sample, and breaker bookkeeping.
    /// Returns `None` for anything short of a clean hit, which tells the
    /// batch planner to fall back to the full [`Resolver::resolve`] chain
    /// for this point (spec.md §4.6: fallback is the exception, not the
    /// rule).
    pub(crate) async fn resolve_bucketed_object_store_point(
        &self,
        provider_id: &ProviderId,
        file_index: usize,
        dataset_id: &str,
        resolution_m: f64,
        query: &Query,
    ) -> Option<QueryResult> {
        let start = Instant::now();
        if self.reliability.admit(provider_id).await != Admission::Allowed {
            return None;
        }
        let semaphore = self.reliability.semaphore(provider_id)?;
        let _permit = semaphore.try_acquire().ok()?;

        match self
            .sample_candidate(provider_id, file_index, dataset_id, resolution_m, query)
            .await
        {
            Ok(Some((elevation_m, dataset_id, resolution_m))) => {
                self.reliability.record(provider_id, true).await;
                Some(QueryResult {
                    elevation_m: Some(elevation_m),
                    provider_used: provider_id.to_string(),
                    dataset_id,
                    resolution_m,
                    latency_ms: start.elapsed().as_millis() as u32,
                })
            }
            Ok(None) => None,
            Err(TryFailure::Transient) => {
                self.reliability.record(provider_id, false).await;
                None
            }
            Err(TryFailure::Logic(_)) => None,
        }
    }

    /// Run a chunk of already-bucketed points through a single HTTP
    /// provider batch call (spec.md §4.6 step 2). Returns `Some(result)`
    /// per point on a clean batch response, `None` per point when the
    /// whole call should fall back to per-point resolution instead.
    pub(crate) async fn resolve_bucketed_http_batch(
        &self,
        provider_id: &ProviderId,
        points: &[(usize, Query)],
    ) -> Vec<(usize, Option<QueryResult>)> {
        let fallback = || points.iter().map(|(i, _)| (*i, None)).collect::<Vec<_>>();

        if self.reliability.admit(provider_id).await != Admission::Allowed {
            return fallback();
        }
        let Some(client) = self.api_clients.get(provider_id) else {
            return fallback();
        };
        let Some(semaphore) = self.reliability.semaphore(provider_id) else {
            return fallback();
        };
        let Ok(_permit) = semaphore.try_acquire() else {
            return fallback();
        };

        let Some((_, first_query)) = points.first() else {
            return Vec::new();
        };
        let budget = self.remaining_or_default(first_query, self.config.timeouts.http_api());
        let locations: Vec<(f64, f64)> = points.iter().map(|(_, q)| (q.lat, q.lon)).collect();

        match timeout(budget, client.batch(&locations)).await {
            Ok(Ok(values)) => {
                self.reliability.record(provider_id, true).await;
                let mut out = Vec::with_capacity(points.len());
                for ((index, query), value) in points.iter().zip(values) {
                    self.cache.put_point(query.lat, query.lon, &provider_id.0, value).await;
                    let result = match value {
                        Some(elevation_m) => QueryResult {
                            elevation_m: Some(elevation_m),
                            provider_used: provider_id.to_string(),
                            dataset_id: None,
                            resolution_m: None,
                            latency_ms: 0,
                        },
                        None => QueryResult::no_coverage(0),
                    };
                    out.push((*index, Some(result)));
                }
                out
            }
            Ok(Err(_err)) => {
                self.reliability.record(provider_id, false).await;
                fallback()
            }
            Err(_elapsed) => {
                warn!(provider = %provider_id, "http batch call deadline exceeded");
                self.reliability.record(provider_id, false).await;
                fallback()
            }
        }
    }

}
