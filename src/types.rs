//! Core data model: datasets, raster files, providers, and query/result shapes.
//!
//! These types are shared read-only by every request handler once the
//! [`crate::spatial_index::SpatialIndex`] is loaded at startup; only
//! [`ProviderRuntimeState`] is mutated at runtime, and only by the
//! reliability layer.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Newtype around a dataset's catalog id, to avoid mixing it up with a
/// raster file's `storage_key` or a provider name at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(s: &str) -> Self {
        DatasetId(s.to_string())
    }
}

impl From<String> for DatasetId {
    fn from(s: String) -> Self {
        DatasetId(s)
    }
}

/// A provider's logical name, e.g. `"object_store"` or `"open_elevation"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderId(pub String);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        ProviderId(s.to_string())
    }
}

/// Relative priority of a dataset within the catalog. Ties in the spatial
/// index are broken by this field descending, then by `Dataset.id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityClass {
    Low,
    Medium,
    High,
}

/// A WGS84 axis-aligned bounding box: `min_lat/min_lon/max_lat/max_lon`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Area in square degrees, used by the scorer's spatial sub-score.
    pub fn area_deg2(&self) -> f64 {
        (self.max_lat - self.min_lat).max(0.0) * (self.max_lon - self.min_lon).max(0.0)
    }
}

/// A named coherent survey ("campaign" / "collection" in source parlance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub provider: String,
    pub native_crs: String,
    pub resolution_m: f64,
    pub acquisition_year: i32,
    pub coverage_bbox: BBox,
    pub confidence: f64,
    pub priority_class: PriorityClass,
    pub file_list: Vec<usize>,
}

/// An affine transform from pixel (col, row) to native CRS (x, y):
/// `x = a*col + b*row + c`, `y = d*col + e*row + f`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl AffineTransform {
    pub fn pixel_to_native(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Invert to map native (x, y) back to fractional (col, row).
    pub fn native_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.a * self.e - self.b * self.d;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let dx = x - self.c;
        let dy = y - self.f;
        let col = (self.e * dx - self.b * dy) / det;
        let row = (self.a * dy - self.d * dx) / det;
        Some((col, row))
    }
}

/// A single GeoTIFF-like tile in object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterFile {
    pub storage_key: String,
    pub bucket: String,
    pub native_crs: String,
    pub transform: AffineTransform,
    pub pixel_bounds_wgs84: BBox,
    pub width: u32,
    pub height: u32,
    pub nodata_sentinel: Option<f64>,
    pub owning_dataset_id: DatasetId,
}

/// Logical entry in the provider fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderDescriptor {
    ObjectStore {
        name: ProviderId,
        bucket: String,
        region: String,
        access: ObjectStoreAccess,
        priority: PriorityClass,
    },
    HttpApi {
        name: ProviderId,
        endpoint: String,
        auth_token: Option<String>,
        rate_limit_rps: f64,
        daily_quota: Option<u64>,
        priority: PriorityClass,
    },
}

impl ProviderDescriptor {
    pub fn name(&self) -> &ProviderId {
        match self {
            ProviderDescriptor::ObjectStore { name, .. } => name,
            ProviderDescriptor::HttpApi { name, .. } => name,
        }
    }

    pub fn priority(&self) -> PriorityClass {
        match self {
            ProviderDescriptor::ObjectStore { priority, .. } => *priority,
            ProviderDescriptor::HttpApi { priority, .. } => *priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStoreAccess {
    Public,
    Signed,
}

/// Circuit-breaker state for a single provider. See [`crate::reliability`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerStatus {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

/// Per-provider mutable runtime state, shared across all request handlers
/// and serialized by the reliability layer's per-provider lock.
#[derive(Debug)]
pub struct ProviderRuntimeState {
    pub status: BreakerStatus,
    pub window: Vec<bool>,
    pub window_started_at: Instant,
    pub outstanding_requests: u32,
    pub remaining_quota: Option<u64>,
    /// Set while a single HalfOpen probe is outstanding, so concurrent
    /// callers don't all fire probes at once (spec.md §4.7).
    pub probe_in_flight: bool,
}

impl ProviderRuntimeState {
    pub fn new(initial_quota: Option<u64>) -> Self {
        Self {
            status: BreakerStatus::Closed,
            window: Vec::new(),
            window_started_at: Instant::now(),
            outstanding_requests: 0,
            remaining_quota: initial_quota,
            probe_in_flight: false,
        }
    }
}

/// Confidence tag attached to the scorer's chosen dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// A single elevation query.
#[derive(Debug, Clone)]
pub struct Query {
    pub lat: f64,
    pub lon: f64,
    pub deadline: Option<Instant>,
    pub preferred_provider: Option<String>,
}

impl Query {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            deadline: None,
            preferred_provider: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The resolver's answer to a single [`Query`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub elevation_m: Option<f64>,
    pub provider_used: String,
    pub dataset_id: Option<String>,
    pub resolution_m: Option<f64>,
    pub latency_ms: u32,
}

impl QueryResult {
    pub fn no_coverage(latency_ms: u32) -> Self {
        Self {
            elevation_m: None,
            provider_used: "none".to_string(),
            dataset_id: None,
            resolution_m: None,
            latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_contains_is_inclusive_of_edges() {
        let bbox = BBox {
            min_lat: -10.0,
            min_lon: -10.0,
            max_lat: 10.0,
            max_lon: 10.0,
        };
        assert!(bbox.contains(-10.0, -10.0));
        assert!(bbox.contains(10.0, 10.0));
        assert!(bbox.contains(0.0, 0.0));
        assert!(!bbox.contains(10.1, 0.0));
        assert!(!bbox.contains(0.0, -10.1));
    }

    #[test]
    fn affine_round_trips_pixel_native_native_pixel() {
        let transform = AffineTransform {
            a: 0.001,
            b: 0.0,
            c: 100.0,
            d: 0.0,
            e: -0.001,
            f: 50.0,
        };
        let (x, y) = transform.pixel_to_native(10.0, 20.0);
        let (col, row) = transform.native_to_pixel(x, y).unwrap();
        assert!((col - 10.0).abs() < 1e-9);
        assert!((row - 20.0).abs() < 1e-9);
    }
}
