//! Reliability layer: per-provider circuit breakers, concurrency
//! semaphores, and deadline enforcement (spec.md §4.7, §5).
//!
//! Nothing in this codebase implements a breaker state machine today,
//! but the shape here follows the corpus convention of a small `Config`
//! struct plus mutable state guarded behind a lock, the way
//! `tile_downloader::TileDownloader` keeps its in-flight-download map
//! behind an `Arc<Mutex<HashMap<..>>>` and releases the lock before
//! awaiting anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::BreakerConfig;
use crate::types::{BreakerStatus, ProviderId, ProviderRuntimeState};

/// Per-provider reliability state: the circuit breaker plus a bounded
/// concurrency semaphore. Shared across all request handlers; the only
/// process-wide mutable state outside the two bounded caches.
pub struct ReliabilityLayer {
    config: BreakerConfig,
    states: Mutex<HashMap<ProviderId, ProviderRuntimeState>>,
    semaphores: HashMap<ProviderId, Arc<Semaphore>>,
}

/// What the caller should do about a provider right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    BreakerOpen,
}

impl ReliabilityLayer {
    pub fn new(
        config: BreakerConfig,
        providers: impl Iterator<Item = (ProviderId, Option<u64>, usize)>,
    ) -> Self {
        let mut states = HashMap::new();
        let mut semaphores = HashMap::new();
        for (id, quota, permits) in providers {
            states.insert(id.clone(), ProviderRuntimeState::new(quota));
            semaphores.insert(id, Arc::new(Semaphore::new(permits)));
        }
        Self {
            config,
            states: Mutex::new(states),
            semaphores,
        }
    }

    /// Check whether the breaker allows a call right now, transitioning
    /// Open -> HalfOpen if the cool-off has elapsed. Zero outbound calls
    /// are issued while the breaker reports `BreakerOpen` (spec.md §8
    /// "Breaker safety"). While HalfOpen, only a single probe is ever
    /// admitted at a time (spec.md §4.7 "allow a single probe request");
    /// concurrent callers racing the same window are turned away until
    /// that probe's outcome is recorded.
    pub async fn admit(&self, provider: &ProviderId) -> Admission {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(provider) else {
            return Admission::Allowed;
        };
        match state.status {
            BreakerStatus::Open { until } if Instant::now() < until => Admission::BreakerOpen,
            BreakerStatus::Open { .. } => {
                debug!(provider = %provider, "breaker cool-off elapsed, half-opening");
                state.status = BreakerStatus::HalfOpen;
                state.probe_in_flight = true;
                Admission::Allowed
            }
            BreakerStatus::HalfOpen => {
                if state.probe_in_flight {
                    Admission::BreakerOpen
                } else {
                    state.probe_in_flight = true;
                    Admission::Allowed
                }
            }
            BreakerStatus::Closed => Admission::Allowed,
        }
    }

    /// Acquire a concurrency permit for this provider, bounded by the
    /// configured semaphore. Returns `None` if the provider is unknown.
    pub fn semaphore(&self, provider: &ProviderId) -> Option<Arc<Semaphore>> {
        self.semaphores.get(provider).cloned()
    }

    /// Record the outcome of a call and update the breaker state machine:
    ///
    /// - Closed: rolling error ratio >= threshold with enough samples ->
    ///   Open for `cool_off`.
    /// - HalfOpen: success -> Closed (counters reset); failure -> Open
    ///   again (cool-off timer reset).
    pub async fn record(&self, provider: &ProviderId, success: bool) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(provider) else {
            return;
        };

        match state.status {
            BreakerStatus::HalfOpen => {
                state.probe_in_flight = false;
                if success {
                    debug!(provider = %provider, "probe succeeded, closing breaker");
                    state.status = BreakerStatus::Closed;
                    state.window.clear();
                    state.window_started_at = Instant::now();
                } else {
                    warn!(provider = %provider, "probe failed, reopening breaker");
                    self.trip(state);
                }
            }
            BreakerStatus::Closed => {
                if state.window_started_at.elapsed().as_secs() > self.config.window_seconds {
                    state.window.clear();
                    state.window_started_at = Instant::now();
                }
                state.window.push(success);
                if state.window.len() > self.config.window_size {
                    state.window.remove(0);
                }

                let samples = state.window.len();
                let errors = state.window.iter().filter(|ok| !**ok).count();
                let ratio = errors as f64 / samples.max(1) as f64;

                if samples >= self.config.min_samples && ratio >= self.config.error_ratio_threshold
                {
                    warn!(
                        provider = %provider,
                        ratio,
                        samples,
                        "error ratio exceeded threshold, tripping breaker"
                    );
                    self.trip(state);
                }
            }
            BreakerStatus::Open { .. } => {}
        }
    }

    fn trip(&self, state: &mut ProviderRuntimeState) {
        state.status = BreakerStatus::Open {
            until: Instant::now() + std::time::Duration::from_secs(self.config.cool_off_seconds),
        };
        state.window.clear();
        state.probe_in_flight = false;
    }

    pub async fn status(&self, provider: &ProviderId) -> Option<BreakerStatus> {
        self.states.lock().await.get(provider).map(|s| s.status)
    }
}
