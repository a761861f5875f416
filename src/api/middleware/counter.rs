use super::client_key;
use crate::api::state::AppState;
use axum::{Extension, extract::Request, middleware::Next, response::Response};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request totals, overall and per client.
#[derive(Debug, Default)]
pub struct RequestCounter {
    total: AtomicU64,
    clients: DashMap<String, u64>,
}

impl RequestCounter {
    pub fn record(&self, client: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.clients.entry(client.to_string()).or_insert(0) += 1;
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn for_client(&self, client: &str) -> u64 {
        self.clients.get(client).map_or(0, |count| *count)
    }
}

pub async fn count(Extension(state): Extension<AppState>, request: Request, next: Next) -> Response {
    let client = client_key(&request, state.config().trust_proxy());
    state.counter().record(&client);
    next.run(request).await
}
