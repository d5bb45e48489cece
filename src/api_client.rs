//! External API client: point and small-batch elevation lookups against a
//! third-party HTTP elevation service (spec.md §4.4).
//!
//! Rate limiting follows a token bucket, the same shape as this
//! codebase's Nominatim geocoder keeping a `base_url`/`user_agent`
//! client alongside request pacing. Retry/backoff config mirrors
//! `beast::client::BeastClientConfig`'s `max_retries` /
//! `retry_delay_seconds` / `max_retry_delay_seconds` triple, generalized
//! here into `config::RetryConfig` and applied with jitter so that a
//! thundering herd of resolver instances doesn't retry in lockstep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ApiClientError;

/// Token bucket rate limiter: refills continuously at `rate_per_sec`,
/// capped at `capacity` tokens.
struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    fn new(rate_per_sec: f64) -> Self {
        let capacity = rate_per_sec.max(1.0);
        Self {
            capacity,
            rate_per_sec,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    /// Block until a token is available, then consume it.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last_refill) = &mut *state;
                let elapsed = last_refill.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.rate_per_sec).min(self.capacity);
                *last_refill = Instant::now();

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - *tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
                }
            };
            match wait {
                None => return,
                Some(delay) => sleep(delay).await,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ElevationApiResponse {
    results: Vec<ElevationApiPoint>,
}

#[derive(Debug, Deserialize)]
struct ElevationApiPoint {
    elevation: Option<f64>,
}

/// Abstraction over "send a batch of (lat, lon) to the elevation
/// endpoint, get back one elevation-or-None per point", so tests can
/// substitute a scripted fake instead of driving a live HTTP endpoint
/// (mirrors `object_store::RangeReader`'s seam over S3).
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        auth_token: Option<&str>,
        points: &[(f64, f64)],
    ) -> Result<Vec<Option<f64>>, ApiClientError>;
}

/// Production `ApiTransport` backed by `reqwest`.
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { http }
    }
}

#[async_trait]
impl ApiTransport for ReqwestTransport {
    async fn send(
        &self,
        endpoint: &str,
        auth_token: Option<&str>,
        points: &[(f64, f64)],
    ) -> Result<Vec<Option<f64>>, ApiClientError> {
        let locations = points
            .iter()
            .map(|(lat, lon)| format!("{lat},{lon}"))
            .collect::<Vec<_>>()
            .join("|");

        let mut request = self.http.get(endpoint).query(&[("locations", locations)]);
        if let Some(token) = auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiClientError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(ApiClientError::RateLimited),
            status if status.is_success() => {
                let body: ElevationApiResponse = response
                    .json()
                    .await
                    .map_err(|e| ApiClientError::Transient(e.to_string()))?;
                Ok(body.results.into_iter().map(|p| p.elevation).collect())
            }
            status => Err(ApiClientError::Http(status.as_u16())),
        }
    }
}

/// Client for a single external HTTP elevation API endpoint.
pub struct ApiClient {
    transport: Arc<dyn ApiTransport>,
    endpoint: String,
    auth_token: Option<String>,
    bucket: TokenBucket,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(
        endpoint: String,
        auth_token: Option<String>,
        rate_limit_rps: f64,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self::with_transport(
            endpoint,
            auth_token,
            rate_limit_rps,
            retry,
            Arc::new(ReqwestTransport::new(timeout)),
        )
    }

    /// Construct against an arbitrary transport, e.g. a scripted fake in
    /// tests, instead of a live `reqwest::Client`.
    pub fn with_transport(
        endpoint: String,
        auth_token: Option<String>,
        rate_limit_rps: f64,
        retry: RetryConfig,
        transport: Arc<dyn ApiTransport>,
    ) -> Self {
        Self {
            transport,
            endpoint,
            auth_token,
            bucket: TokenBucket::new(rate_limit_rps.max(0.1)),
            retry,
        }
    }

    /// Query a single point, retrying transient failures with capped
    /// jittered exponential backoff (spec.md §4.4, §4.7).
    pub async fn point(&self, lat: f64, lon: f64) -> Result<Option<f64>, ApiClientError> {
        let mut attempt = 0;
        let mut total_backoff = Duration::ZERO;
        loop {
            self.bucket.acquire().await;
            match self.request(&[(lat, lon)]).await {
                Ok(mut values) => return Ok(values.pop().flatten()),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.backoff_for(attempt);
                    if total_backoff + backoff > Duration::from_millis(self.retry.max_total_backoff_ms)
                    {
                        warn!(endpoint = %self.endpoint, "retry backoff budget exhausted");
                        return Err(err);
                    }
                    debug!(endpoint = %self.endpoint, attempt, ?backoff, "retrying after transient error");
                    sleep(backoff).await;
                    total_backoff += backoff;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Query a batch of points in a single request (spec.md §4.6).
    pub async fn batch(&self, points: &[(f64, f64)]) -> Result<Vec<Option<f64>>, ApiClientError> {
        self.bucket.acquire().await;
        self.request(points).await
    }

    async fn request(&self, points: &[(f64, f64)]) -> Result<Vec<Option<f64>>, ApiClientError> {
        self.transport
            .send(&self.endpoint, self.auth_token.as_deref(), points)
            .await
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.retry.base_backoff_ms as f64;
        let exp = base * 2f64.powi(attempt as i32);
        let jitter = rand::rng().random_range(0.5..1.5);
        Duration::from_millis((exp * jitter) as u64)
    }
}

trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for ApiClientError {
    fn is_retryable(&self) -> bool {
        use crate::error::IsTransient;
        self.is_transient() && !matches!(self, ApiClientError::QuotaExhausted)
    }
}

/// Wraps a set of [`ApiClient`]s behind the priority-ordered fallback
/// chain a provider list describes (spec.md §4.5): try each in order,
/// falling through on a transient failure.
pub struct FallbackChain {
    clients: Vec<(String, Arc<ApiClient>)>,
}

impl FallbackChain {
    pub fn new(clients: Vec<(String, Arc<ApiClient>)>) -> Self {
        Self { clients }
    }

    pub fn clients(&self) -> &[(String, Arc<ApiClient>)] {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_admits_burst_up_to_capacity_then_throttles() {
        let bucket = TokenBucket::new(5.0);
        let start = std::time::Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        // The first `capacity` acquisitions should not have needed to
        // wait for a refill.
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn quota_exhausted_is_not_retryable_even_though_transient() {
        let retry_config = RetryConfig::default();
        let client = ApiClient::new(
            "https://example.invalid".into(),
            None,
            1.0,
            Duration::from_secs(1),
            retry_config,
        );
        let _ = client; // constructed only to exercise `new`
        assert!(!ApiClientError::QuotaExhausted.is_retryable());
        assert!(ApiClientError::Http(503).is_retryable());
        assert!(!ApiClientError::Http(404).is_retryable());
    }

    struct FakeTransport {
        calls: std::sync::atomic::AtomicUsize,
        responses: Mutex<std::collections::VecDeque<Result<Vec<Option<f64>>, ApiClientError>>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<Result<Vec<Option<f64>>, ApiClientError>>) -> Self {
            Self {
                calls: std::sync::atomic::AtomicUsize::new(0),
                responses: Mutex::new(responses.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl ApiTransport for FakeTransport {
        async fn send(
            &self,
            _endpoint: &str,
            _auth_token: Option<&str>,
            points: &[(f64, f64)],
        ) -> Result<Vec<Option<f64>>, ApiClientError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(vec![None; points.len()]))
        }
    }

    #[tokio::test]
    async fn point_retries_transient_failure_then_succeeds_via_fake_transport() {
        let transport = Arc::new(FakeTransport::new(vec![
            Err(ApiClientError::Transient("connection reset".into())),
            Ok(vec![Some(123.4)]),
        ]));
        let client = ApiClient::with_transport(
            "https://example.invalid".into(),
            None,
            100.0,
            RetryConfig {
                max_retries: 2,
                base_backoff_ms: 1,
                max_total_backoff_ms: 1_000,
            },
            transport.clone(),
        );

        let elevation = client.point(10.0, 20.0).await.unwrap();
        assert_eq!(elevation, Some(123.4));
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_dispatches_a_single_call_for_every_point() {
        let transport = Arc::new(FakeTransport::new(vec![Ok(vec![
            Some(1.0),
            None,
            Some(3.0),
        ])]));
        let client = ApiClient::with_transport(
            "https://example.invalid".into(),
            None,
            100.0,
            RetryConfig::default(),
            transport.clone(),
        );

        let values = client
            .batch(&[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(1.0), None, Some(3.0)]);
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
