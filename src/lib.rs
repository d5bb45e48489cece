//! Elevation query resolver: given a WGS84 point, determine which DEM
//! dataset(s) cover it, rank candidates, and fetch an elevation sample
//! from object storage or an external HTTP API with failover.
//!
//! The crate is organized the way the spec's component boundaries are
//! drawn:
//!
//! - [`spatial_index`] — "what dataset/file covers this point" (§4.1)
//! - [`scorer`] — "which candidate is best" (§4.2)
//! - [`object_store`] — remote raster reads (§4.3)
//! - [`api_client`] — remote HTTP elevation API reads (§4.4)
//! - [`selector`] — single-point resolution, tying the above together (§4.5)
//! - [`batch`] — bounded concurrent fan-out over many points (§4.6)
//! - [`reliability`] — circuit breakers and concurrency limits (§4.7)
//! - [`cache`] — bounded in-process memoization (§4.8)
//!
//! Plus the ambient stack: [`types`] (data model), [`error`] (caller-
//! visible error taxonomy), [`config`] (typed configuration), and
//! [`sampling`] (pure multi-point query helpers).

pub mod api_client;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod log_format;
pub mod object_store;
pub mod reliability;
pub mod sampling;
pub mod scorer;
pub mod selector;
pub mod spatial_index;
pub mod types;

pub use config::ResolverConfig;
pub use error::ResolverError;
pub use selector::Resolver;
pub use types::{Query, QueryResult};

use tracing_subscriber::EnvFilter;

/// Initialize structured logging from `RUST_LOG` (default `info`), using
/// the target-first event formatter in [`log_format`]. Call once at
/// process startup.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .event_format(log_format::TargetFirstFormat)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
