//! Persistence for users, sessions, factors, challenges and association tokens.
//!
//! Single-use guarantees live here: consuming a challenge, taking an
//! association token, promoting a session tier and approving a certificate
//! request are all single-record compare-and-set operations, so concurrent
//! requests racing for the same record see exactly one winner.

pub mod memory;
pub mod models;
pub mod postgres;
mod prune;

pub use memory::MemoryStore;
pub use models::{
    Approval, AssociationToken, ChallengeRecord, Consumption, FactorRecord, HostBinding, Purpose,
    Pruned, Session, Tier, User,
};
pub use postgres::PgStore;
pub use prune::spawn_pruner;

use crate::factor::Factor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{Instrument, info_span};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("store failure: {0}")]
    Internal(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_user_by_name(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn find_session(&self, token_hash: &[u8]) -> Result<Option<Session>, StoreError>;
    /// Move a session from `from` to `to`; `false` when the tier was not `from`.
    async fn update_session_tier(&self, id: Uuid, from: Tier, to: Tier)
    -> Result<bool, StoreError>;
    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError>;
    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError>;

    async fn insert_factor(&self, record: &FactorRecord) -> Result<(), StoreError>;
    async fn get_factor(&self, id: Uuid) -> Result<Option<FactorRecord>, StoreError>;
    async fn list_factors(&self, user_id: Uuid) -> Result<Vec<FactorRecord>, StoreError>;
    async fn find_linked_factor(&self, username: &str)
    -> Result<Option<FactorRecord>, StoreError>;
    /// Compare-and-set the factor state (hardware counter) and stamp its use.
    /// Returns `false` when the stored factor no longer equals `previous`.
    async fn touch_factor(
        &self,
        id: Uuid,
        previous: &Factor,
        updated: &Factor,
        used_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Delete a factor, restricted to `owner` when given.
    async fn delete_factor(&self, id: Uuid, owner: Option<Uuid>) -> Result<bool, StoreError>;

    async fn insert_challenge(&self, challenge: &ChallengeRecord) -> Result<(), StoreError>;
    async fn get_challenge(&self, id: Uuid) -> Result<Option<ChallengeRecord>, StoreError>;
    /// Atomically mark a challenge consumed. Exactly one caller gets `Taken`.
    async fn consume_challenge(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Consumption, StoreError>;
    /// Resolve a pending certificate request and bind it to `user_id`.
    /// `false` unless the request was unconsumed and still pending.
    async fn set_approval(
        &self,
        id: Uuid,
        user_id: Uuid,
        approval: Approval,
    ) -> Result<bool, StoreError>;
    async fn bind_host(&self, id: Uuid, host: &HostBinding) -> Result<bool, StoreError>;

    async fn insert_association(&self, token: &AssociationToken) -> Result<(), StoreError>;
    /// Read a token without spending it.
    async fn find_association(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<AssociationToken>, StoreError>;
    /// Remove and return the token; a second call for the same hash gets `None`.
    async fn take_association(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<AssociationToken>, StoreError>;

    /// Delete sessions, challenges and association tokens expired at `now`.
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<Pruned, StoreError>;
}

/// Request-scoped store handle; every call is bounded by `timeout`.
#[derive(Clone)]
pub struct Db {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl Db {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        let span = info_span!("db.query", db.operation = operation);
        match tokio::time::timeout(self.timeout, call.instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "{operation} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl Store for Db {
    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded("ping", self.store.ping()).await
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        self.bounded("insert_user", self.store.insert_user(user))
            .await
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.bounded("get_user", self.store.get_user(id)).await
    }

    async fn find_user_by_name(&self, username: &str) -> Result<Option<User>, StoreError> {
        self.bounded("find_user_by_name", self.store.find_user_by_name(username))
            .await
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.bounded("insert_session", self.store.insert_session(session))
            .await
    }

    async fn find_session(&self, token_hash: &[u8]) -> Result<Option<Session>, StoreError> {
        self.bounded("find_session", self.store.find_session(token_hash))
            .await
    }

    async fn update_session_tier(
        &self,
        id: Uuid,
        from: Tier,
        to: Tier,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "update_session_tier",
            self.store.update_session_tier(id, from, to),
        )
        .await
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        self.bounded("delete_session", self.store.delete_session(id))
            .await
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        self.bounded(
            "delete_user_sessions",
            self.store.delete_user_sessions(user_id),
        )
        .await
    }

    async fn insert_factor(&self, record: &FactorRecord) -> Result<(), StoreError> {
        self.bounded("insert_factor", self.store.insert_factor(record))
            .await
    }

    async fn get_factor(&self, id: Uuid) -> Result<Option<FactorRecord>, StoreError> {
        self.bounded("get_factor", self.store.get_factor(id)).await
    }

    async fn list_factors(&self, user_id: Uuid) -> Result<Vec<FactorRecord>, StoreError> {
        self.bounded("list_factors", self.store.list_factors(user_id))
            .await
    }

    async fn find_linked_factor(
        &self,
        username: &str,
    ) -> Result<Option<FactorRecord>, StoreError> {
        self.bounded(
            "find_linked_factor",
            self.store.find_linked_factor(username),
        )
        .await
    }

    async fn touch_factor(
        &self,
        id: Uuid,
        previous: &Factor,
        updated: &Factor,
        used_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "touch_factor",
            self.store.touch_factor(id, previous, updated, used_at),
        )
        .await
    }

    async fn delete_factor(&self, id: Uuid, owner: Option<Uuid>) -> Result<bool, StoreError> {
        self.bounded("delete_factor", self.store.delete_factor(id, owner))
            .await
    }

    async fn insert_challenge(&self, challenge: &ChallengeRecord) -> Result<(), StoreError> {
        self.bounded("insert_challenge", self.store.insert_challenge(challenge))
            .await
    }

    async fn get_challenge(&self, id: Uuid) -> Result<Option<ChallengeRecord>, StoreError> {
        self.bounded("get_challenge", self.store.get_challenge(id))
            .await
    }

    async fn consume_challenge(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Consumption, StoreError> {
        self.bounded("consume_challenge", self.store.consume_challenge(id, at))
            .await
    }

    async fn set_approval(
        &self,
        id: Uuid,
        user_id: Uuid,
        approval: Approval,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "set_approval",
            self.store.set_approval(id, user_id, approval),
        )
        .await
    }

    async fn bind_host(&self, id: Uuid, host: &HostBinding) -> Result<bool, StoreError> {
        self.bounded("bind_host", self.store.bind_host(id, host))
            .await
    }

    async fn insert_association(&self, token: &AssociationToken) -> Result<(), StoreError> {
        self.bounded("insert_association", self.store.insert_association(token))
            .await
    }

    async fn find_association(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<AssociationToken>, StoreError> {
        self.bounded("find_association", self.store.find_association(token_hash))
            .await
    }

    async fn take_association(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<AssociationToken>, StoreError> {
        self.bounded("take_association", self.store.take_association(token_hash))
            .await
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<Pruned, StoreError> {
        self.bounded("prune_expired", self.store.prune_expired(now))
            .await
    }
}
