//! Caller-visible error taxonomy.
//!
//! Internal plumbing (I/O, decoding, parsing) propagates via
//! `anyhow::Result` with `.context(...)`, the same as the rest of this
//! codebase. What the resolver hands back across its public API is this
//! narrower, semantic taxonomy instead, following the plain hand-rolled
//! error enum style already used for `AuthError` rather than pulling in a
//! derive-macro error crate.

use std::fmt;

/// Failure modes surfaced out of a single raster file read.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectStoreError {
    NetworkError(String),
    NotFound,
    DecodeError(String),
    OutOfBounds,
    NoData,
}

impl fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectStoreError::NetworkError(msg) => write!(f, "network error: {msg}"),
            ObjectStoreError::NotFound => write!(f, "object not found"),
            ObjectStoreError::DecodeError(msg) => write!(f, "decode error: {msg}"),
            ObjectStoreError::OutOfBounds => write!(f, "point outside file bounds"),
            ObjectStoreError::NoData => write!(f, "nodata pixel"),
        }
    }
}

impl std::error::Error for ObjectStoreError {}

/// Failure modes surfaced out of an external HTTP API call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiClientError {
    RateLimited,
    QuotaExhausted,
    Transient(String),
    Http(u16),
}

impl fmt::Display for ApiClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiClientError::RateLimited => write!(f, "rate limited"),
            ApiClientError::QuotaExhausted => write!(f, "daily quota exhausted"),
            ApiClientError::Transient(msg) => write!(f, "transient error: {msg}"),
            ApiClientError::Http(status) => write!(f, "http status {status}"),
        }
    }
}

impl std::error::Error for ApiClientError {}

/// The resolver's caller-visible error taxonomy (spec.md §7).
///
/// `NoData` and `NoCoverage` are not modeled here: both are valid,
/// non-error outcomes surfaced as a [`crate::types::QueryResult`] with
/// `elevation_m: None` (see `QueryResult::no_coverage`).
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverError {
    /// Local resource exhaustion: all provider semaphores saturated, or
    /// the global in-flight high-water mark was hit.
    Overloaded,
    /// A deadline expired before any provider produced an answer.
    Timeout,
    /// A contract was violated by the caller or a malformed index entry
    /// (e.g. a query the spatial index claims is in a file's bounds, but
    /// the file's own transform disagrees). Always a bug.
    LogicError(String),
    /// Invalid index artifact, missing provider, or bad scoring weights.
    /// Fatal at construction time; never returned from a running query.
    ConfigError(String),
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverError::Overloaded => write!(f, "overloaded"),
            ResolverError::Timeout => write!(f, "timeout"),
            ResolverError::LogicError(msg) => write!(f, "logic error: {msg}"),
            ResolverError::ConfigError(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for ResolverError {}

/// Whether a lower-level failure should drive fallback to the next
/// provider, as opposed to being surfaced to the caller.
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

impl IsTransient for ObjectStoreError {
    fn is_transient(&self) -> bool {
        // NetworkError and DecodeError both fail over to the next
        // candidate/provider rather than aborting resolution (spec.md
        // §4.5 step 2); OutOfBounds is a contract violation, not a
        // transient condition, and is handled separately by the caller.
        matches!(
            self,
            ObjectStoreError::NetworkError(_) | ObjectStoreError::DecodeError(_)
        )
    }
}

impl IsTransient for ApiClientError {
    fn is_transient(&self) -> bool {
        !matches!(self, ApiClientError::Http(code) if (400..500).contains(code) && *code != 429)
    }
}
