//! Typed resolver configuration (spec.md §6: "values, not names, normative").
//!
//! Loaded from TOML via `toml` (already this codebase's dependency) with
//! `#[serde(deny_unknown_fields)]` so a typo in a config file is a startup
//! `ConfigError`, not a silently-ignored key, matching the rejection
//! behavior `spec.md` demands of the index artifact loader.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ResolverError;
use crate::types::ProviderDescriptor;

/// Scoring weights for the campaign scorer (spec.md §4.2). Re-normalized
/// to sum to 1.0 at load time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringWeights {
    pub resolution: f64,
    pub temporal: f64,
    pub spatial: f64,
    pub provider: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            resolution: 0.50,
            temporal: 0.30,
            spatial: 0.15,
            provider: 0.05,
        }
    }
}

impl ScoringWeights {
    fn normalized(&self) -> Result<Self, ResolverError> {
        let sum = self.resolution + self.temporal + self.spatial + self.provider;
        if sum.abs() < 1e-9 {
            return Err(ResolverError::ConfigError(
                "scoring weights sum to zero".to_string(),
            ));
        }
        Ok(Self {
            resolution: self.resolution / sum,
            temporal: self.temporal / sum,
            spatial: self.spatial / sum,
            provider: self.provider / sum,
        })
    }
}

/// Cache capacity and TTL bounds for the bounded cache (spec.md §4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub max_bytes: u64,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachesConfig {
    pub headers: CacheConfig,
    pub points: CacheConfig,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            headers: CacheConfig {
                max_entries: 2048,
                max_bytes: 128 * 1024 * 1024,
                ttl_seconds: 3600,
            },
            points: CacheConfig {
                max_entries: 100_000,
                max_bytes: 16 * 1024 * 1024,
                ttl_seconds: 300,
            },
        }
    }
}

/// Per-provider circuit breaker tuning (spec.md §4.7, §9 Open Questions).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    pub window_size: usize,
    pub window_seconds: u64,
    pub error_ratio_threshold: f64,
    pub min_samples: usize,
    pub cool_off_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            window_seconds: 30,
            error_ratio_threshold: 0.5,
            min_samples: 5,
            cool_off_seconds: 30,
        }
    }
}

/// Per-request-kind default timeouts, used when `Query.deadline` is absent
/// (spec.md §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    pub object_store_ms: u64,
    pub http_api_ms: u64,
    pub batch_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            object_store_ms: 2_000,
            http_api_ms: 3_000,
            batch_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn object_store(&self) -> Duration {
        Duration::from_millis(self.object_store_ms)
    }

    pub fn http_api(&self) -> Duration {
        Duration::from_millis(self.http_api_ms)
    }

    pub fn batch(&self) -> Duration {
        Duration::from_millis(self.batch_ms)
    }
}

/// Worker-pool and concurrency bounds (spec.md §4.6, §4.7, §5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    pub batch_worker_pool_size: usize,
    pub per_provider_semaphore: usize,
    pub global_high_water_mark: usize,
    pub http_batch_chunk_size: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            batch_worker_pool_size: 32,
            per_provider_semaphore: 64,
            global_high_water_mark: 512,
            http_batch_chunk_size: 512,
        }
    }
}

/// Retry policy for idempotent external API calls (spec.md §4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_total_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 100,
            max_total_backoff_ms: 2_000,
        }
    }
}

/// The schema versions this resolver knows how to read (spec.md §6).
pub const SUPPORTED_SCHEMA_VERSIONS: std::ops::RangeInclusive<u32> = 1..=2;

/// Top-level typed configuration. Deliberately does not derive `Default`
/// as a whole: callers must supply `index_path` and `providers`, which
/// have no sane default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    pub index_path: PathBuf,
    pub providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub scoring_weights: ScoringWeights,
    #[serde(default)]
    pub caches: CachesConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub max_candidate_datasets_before_escalation: usize,
}

fn default_max_candidates() -> usize {
    3
}

impl ResolverConfig {
    pub fn new(index_path: PathBuf, providers: Vec<ProviderDescriptor>) -> Self {
        Self {
            index_path,
            providers,
            scoring_weights: ScoringWeights::default(),
            caches: CachesConfig::default(),
            breaker: BreakerConfig::default(),
            timeouts: TimeoutConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            max_candidate_datasets_before_escalation: default_max_candidates(),
        }
    }

    /// Parse a TOML config document, rejecting unknown keys.
    pub fn from_toml(text: &str) -> Result<Self, ResolverError> {
        let mut config: ResolverConfig =
            toml::from_str(text).map_err(|e| ResolverError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file from disk. File I/O failures carry
    /// path context via `anyhow`, the same as the rest of this
    /// codebase's startup plumbing; parse/validation failures surface as
    /// the narrower [`ResolverError::ConfigError`] once read.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading resolver config from {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("parsing resolver config at {}", path.display()))
    }

    /// Validate and normalize (re-normalize scoring weights, check for at
    /// least one provider). Called automatically by `from_toml`; callers
    /// building a config programmatically should call this too.
    pub fn validate(&mut self) -> Result<(), ResolverError> {
        if self.providers.is_empty() {
            return Err(ResolverError::ConfigError(
                "at least one provider is required".to_string(),
            ));
        }
        self.scoring_weights = self.scoring_weights.normalized()?;
        if self.max_candidate_datasets_before_escalation == 0 {
            self.max_candidate_datasets_before_escalation = default_max_candidates();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ObjectStoreAccess, PriorityClass, ProviderId};

    fn sample_provider() -> ProviderDescriptor {
        ProviderDescriptor::ObjectStore {
            name: ProviderId("object_store".into()),
            bucket: "dem-tiles".into(),
            region: "us-west-2".into(),
            access: ObjectStoreAccess::Public,
            priority: PriorityClass::High,
        }
    }

    #[test]
    fn rejects_unknown_keys() {
        let toml = r#"
            index_path = "index.json"
            providers = []
            bogus_key = true
        "#;
        let result = ResolverConfig::from_toml(toml);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_provider_list() {
        let mut config = ResolverConfig::new(PathBuf::from("index.json"), vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalizes_scoring_weights_to_sum_one() {
        let mut config = ResolverConfig::new(PathBuf::from("index.json"), vec![sample_provider()]);
        config.scoring_weights = ScoringWeights {
            resolution: 1.0,
            temporal: 1.0,
            spatial: 1.0,
            provider: 1.0,
        };
        config.validate().unwrap();
        let w = config.scoring_weights;
        let sum = w.resolution + w.temporal + w.spatial + w.provider;
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((w.resolution - 0.25).abs() < 1e-9);
    }

    #[test]
    fn defaults_match_spec() {
        let weights = ScoringWeights::default();
        assert_eq!(weights.resolution, 0.50);
        assert_eq!(weights.temporal, 0.30);
        assert_eq!(weights.spatial, 0.15);
        assert_eq!(weights.provider, 0.05);

        let breaker = BreakerConfig::default();
        assert_eq!(breaker.cool_off_seconds, 30);
        assert_eq!(breaker.error_ratio_threshold, 0.5);
    }

    #[test]
    fn load_from_path_reads_and_validates_a_toml_file_on_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            index_path = "index.json"

            [[providers]]
            type = "ObjectStore"
            name = "object_store"
            bucket = "dem-tiles"
            region = "us-west-2"
            access = "Public"
            priority = "High"
            "#
        )
        .unwrap();

        let config = ResolverConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].name().0, "object_store");
    }

    #[test]
    fn load_from_path_surfaces_the_path_when_the_file_is_missing() {
        let missing = PathBuf::from("/nonexistent/resolver-config-test.toml");
        let err = ResolverConfig::load_from_path(&missing).unwrap_err();
        assert!(err.to_string().contains("resolver-config-test.toml"));
    }
}
