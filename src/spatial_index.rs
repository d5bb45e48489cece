//! In-memory spatial index: given (lat, lon), enumerate candidate raster
//! files and their owning datasets in sub-millisecond time (spec.md §4.1).
//!
//! Two tiers, as specified:
//!   1. a coarse uniform grid over datasets' `coverage_bbox`, giving O(1)
//!      cell lookup;
//!   2. per dataset, a fine index keyed on *file* bounds (never dataset
//!      bounds, per the spec's anti-over-match rule) built with
//!      `rstar::RTree`, the same R-tree crate this corpus already reaches
//!      for elsewhere (`versatiles_pipeline`'s edge-segment index).
//!
//! Dense datasets additionally carry a materialized `tiled_overlays`
//! sub-grid, produced by the offline index builder and consumed verbatim
//! here: the runtime never rebuilds it, only looks it up.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};

use crate::config::SUPPORTED_SCHEMA_VERSIONS;
use crate::error::ResolverError;
use crate::types::{BBox, Dataset, DatasetId, PriorityClass, RasterFile};

/// On-disk artifact shape (spec.md §6). Produced by the offline
/// index-builder; the resolver only ever deserializes and reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexArtifact {
    pub schema_version: u32,
    pub grid: GridArtifact,
    pub datasets: HashMap<String, Dataset>,
    pub files: Vec<RasterFile>,
    #[serde(default)]
    pub tiled_overlays: HashMap<String, TiledOverlayArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridArtifact {
    pub cell_deg: f64,
    pub cells: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiledOverlayArtifact {
    pub tile_deg: f64,
    pub tiles: HashMap<String, Vec<usize>>,
}

/// A file wrapped for `rstar` indexing: its AABB is its WGS84 bounds.
#[derive(Debug, Clone)]
struct IndexedFile {
    file_index: usize,
    bbox: BBox,
}

impl RTreeObject for IndexedFile {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bbox.min_lat, self.bbox.min_lon],
            [self.bbox.max_lat, self.bbox.max_lon],
        )
    }
}

/// Per-dataset fine index: an R-tree over that dataset's file footprints,
/// plus the optional dense-metro sub-grid consumed verbatim.
struct DatasetIndex {
    tree: RTree<IndexedFile>,
    overlay: Option<TiledOverlayArtifact>,
}

fn cell_key(cell_deg: f64, lat: f64, lon: f64) -> String {
    let row = (lat / cell_deg).floor() as i64;
    let col = (lon / cell_deg).floor() as i64;
    format!("{row}:{col}")
}

/// Immutable, bulk-loaded spatial index. Shared read-only across every
/// request handler via `Arc<SpatialIndex>` for the lifetime of the
/// process.
pub struct SpatialIndex {
    datasets: HashMap<DatasetId, Dataset>,
    files: Vec<RasterFile>,
    coarse_cell_deg: f64,
    coarse_grid: HashMap<String, Vec<DatasetId>>,
    fine: HashMap<DatasetId, DatasetIndex>,
}

/// A candidate returned by [`SpatialIndex::lookup`]: a dataset together
/// with the index of one of its files whose bounds contain the query
/// point.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub dataset: Dataset,
    pub file_index: usize,
}

impl SpatialIndex {
    /// Load and validate an artifact. Rejects artifacts outside the
    /// supported schema range or with no datasets at all (spec.md §6).
    pub fn load(artifact: IndexArtifact) -> Result<Self, ResolverError> {
        if !SUPPORTED_SCHEMA_VERSIONS.contains(&artifact.schema_version) {
            return Err(ResolverError::ConfigError(format!(
                "unsupported spatial index schema_version {} (supported: {:?})",
                artifact.schema_version, SUPPORTED_SCHEMA_VERSIONS
            )));
        }
        if artifact.datasets.is_empty() {
            return Err(ResolverError::ConfigError(
                "spatial index artifact has collections_available == 0".to_string(),
            ));
        }

        let datasets: HashMap<DatasetId, Dataset> = artifact
            .datasets
            .into_iter()
            .map(|(id, dataset)| (DatasetId(id), dataset))
            .collect();

        let coarse_grid: HashMap<String, Vec<DatasetId>> = artifact
            .grid
            .cells
            .into_iter()
            .map(|(cell, ids)| (cell, ids.into_iter().map(DatasetId).collect()))
            .collect();

        let mut fine: HashMap<DatasetId, Vec<IndexedFile>> = HashMap::new();
        for (idx, file) in artifact.files.iter().enumerate() {
            fine.entry(file.owning_dataset_id.clone())
                .or_default()
                .push(IndexedFile {
                    file_index: idx,
                    bbox: file.pixel_bounds_wgs84,
                });
        }

        let fine: HashMap<DatasetId, DatasetIndex> = fine
            .into_iter()
            .map(|(dataset_id, indexed_files)| {
                let overlay = artifact.tiled_overlays.get(&dataset_id.0).cloned();
                (
                    dataset_id,
                    DatasetIndex {
                        tree: RTree::bulk_load(indexed_files),
                        overlay,
                    },
                )
            })
            .collect();

        Ok(Self {
            datasets,
            files: artifact.files,
            coarse_cell_deg: artifact.grid.cell_deg,
            coarse_grid,
            fine,
        })
    }

    /// Read a JSON-encoded index artifact from disk and load it
    /// (spec.md §6: "artifact deserialization uses `serde_json`").
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading spatial index artifact from {}", path.display()))?;
        let artifact: IndexArtifact = serde_json::from_str(&text)
            .with_context(|| format!("parsing spatial index artifact at {}", path.display()))?;
        Self::load(artifact).context("loading spatial index artifact")
    }

    pub fn file(&self, index: usize) -> Option<&RasterFile> {
        self.files.get(index)
    }

    pub fn dataset(&self, id: &DatasetId) -> Option<&Dataset> {
        self.datasets.get(id)
    }

    /// Enumerate candidates for a point, stable-ordered by
    /// `(priority_class descending, dataset.id ascending)` (spec.md §4.1).
    /// Empty, never an error: "no candidates" is a valid outcome.
    pub fn lookup(&self, lat: f64, lon: f64) -> Vec<Candidate> {
        let cell = cell_key(self.coarse_cell_deg, lat, lon);
        let Some(dataset_ids) = self.coarse_grid.get(&cell) else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        for dataset_id in dataset_ids {
            let Some(dataset) = self.datasets.get(dataset_id) else {
                continue;
            };
            if !dataset.coverage_bbox.contains(lat, lon) {
                continue;
            }
            let Some(dataset_index) = self.fine.get(dataset_id) else {
                continue;
            };

            if let Some(file_index) = self.lookup_via_overlay(dataset_index, lat, lon) {
                candidates.push(Candidate {
                    dataset: dataset.clone(),
                    file_index,
                });
                continue;
            }

            for indexed in dataset_index.tree.locate_all_at_point(&[lat, lon]) {
                candidates.push(Candidate {
                    dataset: dataset.clone(),
                    file_index: indexed.file_index,
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.dataset
                .priority_class
                .cmp(&a.dataset.priority_class)
                .then_with(|| a.dataset.id.cmp(&b.dataset.id))
        });
        candidates
    }

    /// Prefer the finest applicable tile: if a dense-metro sub-grid cell
    /// at the query point names exactly one file, trust it directly
    /// rather than falling through to the general R-tree scan.
    fn lookup_via_overlay(&self, dataset_index: &DatasetIndex, lat: f64, lon: f64) -> Option<usize> {
        let overlay = dataset_index.overlay.as_ref()?;
        let cell = cell_key(overlay.tile_deg, lat, lon);
        let file_indices = overlay.tiles.get(&cell)?;
        file_indices.first().copied().filter(|_| file_indices.len() == 1)
    }
}
