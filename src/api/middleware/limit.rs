//! Per-client request budget over a fixed window.

use super::client_key;
use crate::{api::state::AppState, error::AuthError};
use axum::{Extension, extract::Request, middleware::Next, response::Response};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Entries are pruned once the table grows past this many clients.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, client: &str) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _client: &str) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

#[derive(Debug)]
pub struct WindowRateLimiter {
    budget: u32,
    window: Duration,
    clients: DashMap<String, Window>,
}

impl WindowRateLimiter {
    #[must_use]
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            budget,
            window,
            clients: DashMap::new(),
        }
    }

    fn prune(&self, now: Instant) {
        self.clients
            .retain(|_, entry| now.duration_since(entry.started) < self.window);
    }
}

impl RateLimiter for WindowRateLimiter {
    fn check(&self, client: &str) -> RateLimitDecision {
        let now = Instant::now();
        if self.clients.len() > PRUNE_THRESHOLD {
            self.prune(now);
        }

        let mut entry = self
            .clients
            .entry(client.to_string())
            .or_insert_with(|| Window {
                started: now,
                used: 0,
            });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.used = 0;
        }
        if entry.used >= self.budget {
            return RateLimitDecision::Limited;
        }
        entry.used += 1;
        RateLimitDecision::Allowed
    }
}

pub async fn limit(
    Extension(state): Extension<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let client = client_key(&request, state.config().trust_proxy());
    if state.limiter().check(&client) == RateLimitDecision::Limited {
        warn!(%client, "Rate limit exceeded");
        return Err(AuthError::RateLimited);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_rate_limiter_allows() {
        assert_eq!(NoopRateLimiter.check("anyone"), RateLimitDecision::Allowed);
    }

    #[test]
    fn budget_is_per_client() {
        let limiter = WindowRateLimiter::new(2, Duration::from_secs(60));
        assert_eq!(limiter.check("a"), RateLimitDecision::Allowed);
        assert_eq!(limiter.check("a"), RateLimitDecision::Allowed);
        assert_eq!(limiter.check("a"), RateLimitDecision::Limited);
        assert_eq!(limiter.check("b"), RateLimitDecision::Allowed);
    }

    #[test]
    fn window_resets() {
        let limiter = WindowRateLimiter::new(1, Duration::ZERO);
        assert_eq!(limiter.check("a"), RateLimitDecision::Allowed);
        assert_eq!(limiter.check("a"), RateLimitDecision::Allowed);
    }
}
