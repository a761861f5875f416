//! Gateway configuration and the shared state handed to every request.

use super::middleware::{NoopRateLimiter, RateLimiter, RequestCounter, WindowRateLimiter};
use crate::{factor::FactorEngine, store::Store};
use std::{sync::Arc, time::Duration};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RATE_LIMIT_BUDGET: u32 = 300;
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    session_ttl: Duration,
    cookie_secure: bool,
    store_timeout: Duration,
    rate_limit_budget: u32,
    rate_limit_window: Duration,
    trust_proxy: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            cookie_secure: true,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            rate_limit_budget: DEFAULT_RATE_LIMIT_BUDGET,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            trust_proxy: false,
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub const fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// A budget of zero disables rate limiting.
    #[must_use]
    pub const fn with_rate_limit(mut self, budget: u32, window: Duration) -> Self {
        self.rate_limit_budget = budget;
        self.rate_limit_window = window;
        self
    }

    /// Key clients by `X-Forwarded-For`/`X-Real-IP`. Only safe behind a proxy
    /// that overwrites those headers.
    #[must_use]
    pub const fn with_trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }

    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    #[must_use]
    pub const fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    #[must_use]
    pub const fn rate_limit_budget(&self) -> u32 {
        self.rate_limit_budget
    }

    #[must_use]
    pub const fn rate_limit_window(&self) -> Duration {
        self.rate_limit_window
    }

    #[must_use]
    pub const fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }
}

/// Everything a request may need, injected as an `Extension`.
#[derive(Clone)]
pub struct AppState {
    config: Arc<GatewayConfig>,
    store: Arc<dyn Store>,
    engine: Arc<FactorEngine>,
    limiter: Arc<dyn RateLimiter>,
    counter: Arc<RequestCounter>,
}

impl AppState {
    #[must_use]
    pub fn new(config: GatewayConfig, store: Arc<dyn Store>, engine: FactorEngine) -> Self {
        let limiter: Arc<dyn RateLimiter> = if config.rate_limit_budget == 0 {
            Arc::new(NoopRateLimiter)
        } else {
            Arc::new(WindowRateLimiter::new(
                config.rate_limit_budget,
                config.rate_limit_window,
            ))
        };
        Self {
            config: Arc::new(config),
            store,
            engine: Arc::new(engine),
            limiter,
            counter: Arc::new(RequestCounter::default()),
        }
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    #[must_use]
    pub fn engine(&self) -> &FactorEngine {
        &self.engine
    }

    pub(crate) fn limiter(&self) -> &dyn RateLimiter {
        self.limiter.as_ref()
    }

    #[must_use]
    pub fn counter(&self) -> &RequestCounter {
        &self.counter
    }
}
