//! The gateway's dependency container.
//!
//! Everything the request handlers need is constructed once at start-up
//! and passed through axum state. The gateway owns no domain entities,
//! only the composed schema, the response cache, the limiter, and
//! request metrics.

use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::composer::Composer;
use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::rate_limit::IpRateLimiter;

/// Shared gateway state.
#[derive(Clone)]
pub struct GatewayState {
    /// Static configuration.
    pub config: Arc<GatewayConfig>,
    /// Supergraph composer.
    pub composer: Arc<Composer>,
    /// Response cache.
    pub cache: Arc<ResponseCache>,
    /// Per-IP rate limiter.
    pub limiter: Arc<IpRateLimiter>,
    /// Request metrics.
    pub metrics: Arc<GatewayMetrics>,
}

impl GatewayState {
    /// Build the container from configuration.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let composer = Composer::new(config.subgraphs.clone(), config.subgraph_timeout());
        let cache = Arc::new(ResponseCache::new(config.cache_capacity));
        let limiter = Arc::new(IpRateLimiter::per_minute(config.rate_limit_per_minute));
        let metrics = Arc::new(GatewayMetrics::new());
        Self {
            config: Arc::new(config),
            composer,
            cache,
            limiter,
            metrics,
        }
    }
}
