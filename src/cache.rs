//! Bounded in-process memoization (spec.md §4.8): decoded raster headers,
//! and recent point samples. Both are pure memoization — never
//! authoritative, never shared across replicas, and never on the path
//! that decides correctness — exactly the role `moka::future::Cache`
//! plays for `ElevationService`'s tile cache and `CoverageCache`'s query
//! cache in this codebase.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::config::CacheConfig;
use crate::object_store::RasterHeader;

/// Key for the point-sample cache: lat/lon rounded to 6 decimals plus the
/// provider that answered, per spec.md §4.8.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointCacheKey {
    lat_micro: i64,
    lon_micro: i64,
    provider: String,
}

impl PointCacheKey {
    pub fn new(lat: f64, lon: f64, provider: &str) -> Self {
        Self {
            lat_micro: (lat * 1_000_000.0).round() as i64,
            lon_micro: (lon * 1_000_000.0).round() as i64,
            provider: provider.to_string(),
        }
    }
}

fn build_cache<K, V>(config: &CacheConfig) -> Cache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(config.max_entries)
        .time_to_live(Duration::from_secs(config.ttl_seconds))
        .build()
}

/// The two bounded caches described in spec.md §4.8, wired together.
#[derive(Clone)]
pub struct BoundedCache {
    headers: Cache<String, Arc<RasterHeader>>,
    points: Cache<PointCacheKey, Option<f64>>,
}

impl BoundedCache {
    pub fn new(headers_config: &CacheConfig, points_config: &CacheConfig) -> Self {
        Self {
            headers: build_cache(headers_config),
            points: build_cache(points_config),
        }
    }

    pub async fn get_header(&self, storage_key: &str) -> Option<Arc<RasterHeader>> {
        let hit = self.headers.get(storage_key).await;
        if hit.is_some() {
            metrics::counter!("elevation_resolver_header_cache_hits_total").increment(1);
        } else {
            metrics::counter!("elevation_resolver_header_cache_misses_total").increment(1);
        }
        hit
    }

    pub async fn put_header(&self, storage_key: String, header: Arc<RasterHeader>) {
        self.headers.insert(storage_key, header).await;
        metrics::gauge!("elevation_resolver_header_cache_entries")
            .set(self.headers.entry_count() as f64);
    }

    pub async fn get_point(&self, lat: f64, lon: f64, provider: &str) -> Option<Option<f64>> {
        let key = PointCacheKey::new(lat, lon, provider);
        let hit = self.points.get(&key).await;
        if hit.is_some() {
            metrics::counter!("elevation_resolver_point_cache_hits_total").increment(1);
        } else {
            metrics::counter!("elevation_resolver_point_cache_misses_total").increment(1);
        }
        hit
    }

    pub async fn put_point(&self, lat: f64, lon: f64, provider: &str, elevation_m: Option<f64>) {
        let key = PointCacheKey::new(lat, lon, provider);
        self.points.insert(key, elevation_m).await;
        metrics::gauge!("elevation_resolver_point_cache_entries")
            .set(self.points.entry_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            max_entries: 10,
            max_bytes: 1024,
            ttl_seconds: 300,
        }
    }

    #[tokio::test]
    async fn point_cache_round_trips() {
        let cache = BoundedCache::new(&config(), &config());
        assert!(cache.get_point(-27.4698, 153.0251, "object_store").await.is_none());
        cache
            .put_point(-27.4698, 153.0251, "object_store", Some(10.87))
            .await;
        let hit = cache.get_point(-27.4698, 153.0251, "object_store").await;
        assert_eq!(hit, Some(Some(10.87)));
    }

    #[test]
    fn point_cache_key_rounds_to_six_decimals() {
        let a = PointCacheKey::new(1.1234561, 2.0, "p");
        let b = PointCacheKey::new(1.1234564, 2.0, "p");
        assert_eq!(a, b);
        let c = PointCacheKey::new(1.1234569, 2.0, "p");
        assert_ne!(a, c);
    }
}
