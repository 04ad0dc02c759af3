//! relaygrid-ratelimit: the gate every webhook delivery passes through.
//!
//! Tracks two layers of limits:
//!
//! - **Route buckets**: per-destination budgets learned from
//!   `X-RateLimit-*` response headers. A route starts out keyed by its
//!   webhook id and is re-pointed to a shared bucket once the server
//!   names one via `X-RateLimit-Bucket`.
//! - **Global window**: a sliding one-second window capping total
//!   requests across every route, plus a global block set by a global
//!   429.
//!
//! Each bucket sits behind its own `tokio::sync::Mutex`; the global
//! window has one more. Workers never see the state directly.

pub mod headers;
pub mod limiter;
pub mod route;

pub use headers::{RateLimitHeaders, RetryAfter};
pub use limiter::{BucketStats, RateLimiter, RateLimiterStats};
pub use route::RouteKey;
