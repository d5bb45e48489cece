//! End-to-end coverage across the spatial index, scorer, object-store
//! reader, reliability layer, and selector, wired the way a real process
//! would wire them (spec.md §8 scenarios), against an in-memory object
//! store fake instead of real S3.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use elevation_resolver::api_client::{ApiClient, ApiTransport};
use elevation_resolver::cache::BoundedCache;
use elevation_resolver::config::{BreakerConfig, CacheConfig, ResolverConfig, RetryConfig};
use elevation_resolver::error::{ApiClientError, ObjectStoreError};
use elevation_resolver::object_store::{ObjectStoreReader, RangeReader, RasterHeader, SampleFormat};
use elevation_resolver::reliability::ReliabilityLayer;
use elevation_resolver::selector::Resolver;
use elevation_resolver::spatial_index::{GridArtifact, IndexArtifact, SpatialIndex};
use elevation_resolver::types::{
    AffineTransform, BBox, Dataset, DatasetId, ObjectStoreAccess, PriorityClass,
    ProviderDescriptor, ProviderId, Query,
};

struct InMemoryRangeReader {
    objects: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl RangeReader for InMemoryRangeReader {
    async fn get_range(
        &self,
        _bucket: &str,
        key: &str,
        start: u64,
        len: u64,
    ) -> Result<Vec<u8>, ObjectStoreError> {
        let data = self.objects.get(key).ok_or(ObjectStoreError::NotFound)?;
        let start = start as usize;
        let end = (start + len as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

fn flat_float_tile(width: u32, height: u32, value: f32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..(width * height) {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Wires a complete resolver: one object-store provider, a single
/// Brisbane-sized dataset/file, and a fake range reader serving a flat
/// 10.0m elevation tile.
async fn brisbane_resolver() -> (Resolver, BBox) {
    let dataset_id = "brisbane_2019_1m";
    let bbox = BBox {
        min_lat: -27.5,
        min_lon: 153.0,
        max_lat: -27.4,
        max_lon: 153.1,
    };
    let file = elevation_resolver::types::RasterFile {
        storage_key: "brisbane.tif".into(),
        bucket: "dem-tiles".into(),
        native_crs: "EPSG:4326".into(),
        transform: AffineTransform {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 0.0,
            e: 1.0,
            f: 0.0,
        },
        pixel_bounds_wgs84: bbox,
        width: 4,
        height: 4,
        nodata_sentinel: Some(-9999.0),
        owning_dataset_id: DatasetId(dataset_id.into()),
    };
    let dataset = Dataset {
        id: DatasetId(dataset_id.into()),
        name: dataset_id.into(),
        provider: "elvis".into(),
        native_crs: "EPSG:4326".into(),
        resolution_m: 1.0,
        acquisition_year: 2019,
        coverage_bbox: bbox,
        confidence: 0.9,
        priority_class: PriorityClass::High,
        file_list: vec![0],
    };

    let mut datasets = HashMap::new();
    datasets.insert(dataset_id.to_string(), dataset);
    let mut cells = HashMap::new();
    cells.insert("-55:306".to_string(), vec![dataset_id.to_string()]);
    let artifact = IndexArtifact {
        schema_version: 2,
        grid: GridArtifact {
            cell_deg: 0.5,
            cells,
        },
        datasets,
        files: vec![file],
        tiled_overlays: HashMap::new(),
    };
    let index = Arc::new(SpatialIndex::load(artifact).unwrap());

    let provider = ProviderDescriptor::ObjectStore {
        name: ProviderId("object_store".into()),
        bucket: "dem-tiles".into(),
        region: "us-west-2".into(),
        access: ObjectStoreAccess::Public,
        priority: PriorityClass::High,
    };
    let config = ResolverConfig::new(PathBuf::from("index.json"), vec![provider]);

    let cache_config = CacheConfig {
        max_entries: 100,
        max_bytes: 1024 * 1024,
        ttl_seconds: 300,
    };
    let cache = BoundedCache::new(&cache_config, &cache_config);
    cache
        .put_header(
            "brisbane.tif".to_string(),
            Arc::new(RasterHeader {
                width: 4,
                height: 4,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
                rows_per_strip: 4,
                strip_offsets: vec![0],
                strip_byte_counts: vec![4 * 4 * 4],
            }),
        )
        .await;

    let mut objects = HashMap::new();
    objects.insert("brisbane.tif".to_string(), flat_float_tile(4, 4, 10.87));
    let range_reader = Arc::new(InMemoryRangeReader { objects });
    let object_store = Arc::new(ObjectStoreReader::new(range_reader, cache.clone()));

    let reliability = Arc::new(ReliabilityLayer::new(
        BreakerConfig::default(),
        config
            .providers
            .iter()
            .map(|p| (p.name().clone(), None, 64)),
    ));

    (
        Resolver::new(index, config, reliability, cache, object_store, HashMap::new()),
        bbox,
    )
}

#[tokio::test]
async fn metro_point_resolves_to_the_covering_dataset() {
    let (resolver, bbox) = brisbane_resolver().await;
    let lat = (bbox.min_lat + bbox.max_lat) / 2.0;
    let lon = (bbox.min_lon + bbox.max_lon) / 2.0;

    let result = resolver.resolve(&Query::new(lat, lon)).await.unwrap();

    assert_eq!(result.provider_used, "object_store");
    assert_eq!(result.dataset_id.as_deref(), Some("brisbane_2019_1m"));
    let elevation = result.elevation_m.expect("expected an elevation sample");
    assert!((elevation - 10.87).abs() < 1e-3);
}

#[tokio::test]
async fn ocean_point_outside_any_dataset_reports_no_coverage() {
    let (resolver, _bbox) = brisbane_resolver().await;
    let result = resolver.resolve(&Query::new(0.0, -150.0)).await.unwrap();

    assert!(result.elevation_m.is_none());
    assert_eq!(result.provider_used, "none");
}

#[tokio::test]
async fn repeated_queries_are_served_from_the_point_cache() {
    let (resolver, bbox) = brisbane_resolver().await;
    let lat = (bbox.min_lat + bbox.max_lat) / 2.0;
    let lon = (bbox.min_lon + bbox.max_lon) / 2.0;
    let query = Query::new(lat, lon);

    let first = resolver.resolve(&query).await.unwrap();
    let second = resolver.resolve(&query).await.unwrap();

    assert_eq!(first.elevation_m, second.elevation_m);
}

/// Scripted [`ApiTransport`] that always answers with a fixed elevation,
/// counting how many times it was actually invoked.
struct FixedElevationTransport {
    elevation: f64,
    calls: AtomicUsize,
}

#[async_trait]
impl ApiTransport for FixedElevationTransport {
    async fn send(
        &self,
        _endpoint: &str,
        _auth_token: Option<&str>,
        points: &[(f64, f64)],
    ) -> Result<Vec<Option<f64>>, ApiClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Some(self.elevation); points.len()])
    }
}

/// Wires a resolver backed only by an HTTP elevation API — no
/// object-store provider is configured at all, so every query must be
/// answered by the external API or reported as no-coverage (spec.md §8
/// "global fallback").
async fn global_fallback_resolver(elevation: f64) -> (Resolver, Arc<FixedElevationTransport>) {
    let provider = ProviderDescriptor::HttpApi {
        name: ProviderId("open_elevation".into()),
        endpoint: "https://api.open-elevation.example/lookup".into(),
        auth_token: None,
        rate_limit_rps: 20.0,
        daily_quota: None,
        priority: PriorityClass::Medium,
    };
    let config = ResolverConfig::new(PathBuf::from("index.json"), vec![provider]);

    // A catalog with one dataset whose bbox never matches a test query,
    // so `SpatialIndex::load` accepts a non-empty catalog while every
    // lookup reports no object-store coverage.
    let placeholder_id = "placeholder";
    let dataset = Dataset {
        id: DatasetId(placeholder_id.into()),
        name: placeholder_id.into(),
        provider: "elvis".into(),
        native_crs: "EPSG:4326".into(),
        resolution_m: 1.0,
        acquisition_year: 2020,
        coverage_bbox: BBox {
            min_lat: 89.0,
            min_lon: 179.0,
            max_lat: 89.5,
            max_lon: 179.5,
        },
        confidence: 0.9,
        priority_class: PriorityClass::High,
        file_list: vec![],
    };
    let mut datasets = HashMap::new();
    datasets.insert(placeholder_id.to_string(), dataset);
    let artifact = IndexArtifact {
        schema_version: 2,
        grid: GridArtifact {
            cell_deg: 0.5,
            cells: HashMap::new(),
        },
        datasets,
        files: vec![],
        tiled_overlays: HashMap::new(),
    };
    let index = Arc::new(SpatialIndex::load(artifact).unwrap());

    let cache_config = CacheConfig {
        max_entries: 100,
        max_bytes: 1024 * 1024,
        ttl_seconds: 300,
    };
    let cache = BoundedCache::new(&cache_config, &cache_config);
    let object_store = Arc::new(ObjectStoreReader::new(
        Arc::new(NeverCalledRangeReader),
        cache.clone(),
    ));

    let reliability = Arc::new(ReliabilityLayer::new(
        BreakerConfig::default(),
        config.providers.iter().map(|p| (p.name().clone(), None, 64)),
    ));

    let transport = Arc::new(FixedElevationTransport {
        elevation,
        calls: AtomicUsize::new(0),
    });
    let client = Arc::new(ApiClient::with_transport(
        "https://api.open-elevation.example/lookup".into(),
        None,
        20.0,
        RetryConfig::default(),
        transport.clone(),
    ));
    let mut api_clients = HashMap::new();
    api_clients.insert(ProviderId("open_elevation".into()), client);

    (
        Resolver::new(index, config, reliability, cache, object_store, api_clients),
        transport,
    )
}

struct NeverCalledRangeReader;

#[async_trait]
impl RangeReader for NeverCalledRangeReader {
    async fn get_range(
        &self,
        _bucket: &str,
        _key: &str,
        _start: u64,
        _len: u64,
    ) -> Result<Vec<u8>, ObjectStoreError> {
        panic!("no object-store provider is configured; the reader must never be called");
    }
}

#[tokio::test]
async fn http_only_provider_answers_when_no_object_store_covers_the_point() {
    let (resolver, transport) = global_fallback_resolver(512.3).await;

    let result = resolver.resolve(&Query::new(48.8566, 2.3522)).await.unwrap();

    assert_eq!(result.provider_used, "open_elevation");
    assert_eq!(result.elevation_m, Some(512.3));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

/// A [`RangeReader`] that always fails with a transient network error,
/// counting how many times it was actually invoked.
struct AlwaysFailingRangeReader {
    calls: AtomicUsize,
}

#[async_trait]
impl RangeReader for AlwaysFailingRangeReader {
    async fn get_range(
        &self,
        _bucket: &str,
        _key: &str,
        _start: u64,
        _len: u64,
    ) -> Result<Vec<u8>, ObjectStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ObjectStoreError::NetworkError("connection refused".into()))
    }
}

/// Wires a two-provider chain: a failing object-store provider ahead of
/// a healthy HTTP fallback, with a breaker tuned to trip quickly.
async fn breaker_trip_resolver() -> (Resolver, Arc<AlwaysFailingRangeReader>, Arc<FixedElevationTransport>) {
    let dataset_id = "brisbane_2019_1m";
    let bbox = BBox {
        min_lat: -27.5,
        min_lon: 153.0,
        max_lat: -27.4,
        max_lon: 153.1,
    };
    let file = elevation_resolver::types::RasterFile {
        storage_key: "brisbane.tif".into(),
        bucket: "dem-tiles".into(),
        native_crs: "EPSG:4326".into(),
        transform: AffineTransform {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 0.0,
            e: 1.0,
            f: 0.0,
        },
        pixel_bounds_wgs84: bbox,
        width: 4,
        height: 4,
        nodata_sentinel: Some(-9999.0),
        owning_dataset_id: DatasetId(dataset_id.into()),
    };
    let dataset = Dataset {
        id: DatasetId(dataset_id.into()),
        name: dataset_id.into(),
        provider: "elvis".into(),
        native_crs: "EPSG:4326".into(),
        resolution_m: 1.0,
        acquisition_year: 2019,
        coverage_bbox: bbox,
        confidence: 0.9,
        priority_class: PriorityClass::High,
        file_list: vec![0],
    };
    let mut datasets = HashMap::new();
    datasets.insert(dataset_id.to_string(), dataset);
    let mut cells = HashMap::new();
    cells.insert("-55:306".to_string(), vec![dataset_id.to_string()]);
    let artifact = IndexArtifact {
        schema_version: 2,
        grid: GridArtifact {
            cell_deg: 0.5,
            cells,
        },
        datasets,
        files: vec![file],
        tiled_overlays: HashMap::new(),
    };
    let index = Arc::new(SpatialIndex::load(artifact).unwrap());

    let object_store_provider = ProviderDescriptor::ObjectStore {
        name: ProviderId("object_store".into()),
        bucket: "dem-tiles".into(),
        region: "us-west-2".into(),
        access: ObjectStoreAccess::Public,
        priority: PriorityClass::High,
    };
    let http_provider = ProviderDescriptor::HttpApi {
        name: ProviderId("open_elevation".into()),
        endpoint: "https://api.open-elevation.example/lookup".into(),
        auth_token: None,
        rate_limit_rps: 20.0,
        daily_quota: None,
        priority: PriorityClass::Low,
    };
    let config = ResolverConfig::new(
        PathBuf::from("index.json"),
        vec![object_store_provider, http_provider],
    );

    let cache_config = CacheConfig {
        max_entries: 100,
        max_bytes: 1024 * 1024,
        ttl_seconds: 300,
    };
    let cache = BoundedCache::new(&cache_config, &cache_config);
    let range_reader = Arc::new(AlwaysFailingRangeReader {
        calls: AtomicUsize::new(0),
    });
    let object_store = Arc::new(ObjectStoreReader::new(range_reader.clone(), cache.clone()));

    // Trips after 3 failures within the window and stays open for the
    // rest of the test (a long cool-off, since the test runs in well
    // under a second).
    let breaker_config = BreakerConfig {
        window_size: 10,
        window_seconds: 300,
        error_ratio_threshold: 0.5,
        min_samples: 3,
        cool_off_seconds: 300,
    };
    let reliability = Arc::new(ReliabilityLayer::new(
        breaker_config,
        config.providers.iter().map(|p| (p.name().clone(), None, 64)),
    ));

    let transport = Arc::new(FixedElevationTransport {
        elevation: 77.0,
        calls: AtomicUsize::new(0),
    });
    let client = Arc::new(ApiClient::with_transport(
        "https://api.open-elevation.example/lookup".into(),
        None,
        20.0,
        RetryConfig::default(),
        transport.clone(),
    ));
    let mut api_clients = HashMap::new();
    api_clients.insert(ProviderId("open_elevation".into()), client);

    (
        Resolver::new(index, config, reliability, cache, object_store, api_clients),
        range_reader,
        transport,
    )
}

#[tokio::test]
async fn breaker_trip_fails_over_to_the_next_provider_and_stays_tripped() {
    let (resolver, range_reader, transport) = breaker_trip_resolver().await;
    let lat = -27.45;
    let lon = 153.05;

    // Each of these queries has to use a distinct point so the point
    // cache doesn't short-circuit the object-store attempt.
    for i in 0..3 {
        let query = Query::new(lat + i as f64 * 1e-6, lon);
        let result = resolver.resolve(&query).await.unwrap();
        assert_eq!(result.provider_used, "open_elevation");
        assert_eq!(result.elevation_m, Some(77.0));
    }
    let calls_before_trip = range_reader.calls.load(Ordering::SeqCst);
    assert_eq!(calls_before_trip, 3, "all three failures should have reached the reader");

    // The breaker should now be open for the object-store provider: the
    // next several queries must fail over to the HTTP provider without
    // ever touching the object-store reader again.
    for i in 3..8 {
        let query = Query::new(lat + i as f64 * 1e-6, lon);
        let result = resolver.resolve(&query).await.unwrap();
        assert_eq!(result.provider_used, "open_elevation");
        assert_eq!(result.elevation_m, Some(77.0));
    }

    assert_eq!(
        range_reader.calls.load(Ordering::SeqCst),
        calls_before_trip,
        "the tripped breaker must keep the object-store reader from being called again"
    );
    assert_eq!(transport.calls.load(Ordering::SeqCst), 8);
}
