//! In-process store backed by `DashMap`.
//!
//! Compare-and-set operations hold the shard write guard of the record they
//! touch for the whole check-then-write, which gives the same single-winner
//! behaviour as the conditional updates in the Postgres store.

use super::{
    Approval, AssociationToken, ChallengeRecord, Consumption, FactorRecord, HostBinding, Pruned,
    Session, Store, StoreError, Tier, User,
};
use crate::factor::Factor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    usernames: DashMap<String, Uuid>,
    sessions: DashMap<Uuid, Session>,
    session_tokens: DashMap<Vec<u8>, Uuid>,
    factors: DashMap<Uuid, FactorRecord>,
    challenges: DashMap<Uuid, ChallengeRecord>,
    associations: DashMap<Vec<u8>, AssociationToken>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        match self.usernames.entry(user.username.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "username {} already exists",
                user.username
            ))),
            Entry::Vacant(slot) => {
                slot.insert(user.id);
                self.users.insert(user.id, user.clone());
                Ok(())
            }
        }
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|user| user.clone()))
    }

    async fn find_user_by_name(&self, username: &str) -> Result<Option<User>, StoreError> {
        let Some(id) = self.usernames.get(username).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.users.get(&id).map(|user| user.clone()))
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.session_tokens
            .insert(session.token_hash.clone(), session.id);
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_session(&self, token_hash: &[u8]) -> Result<Option<Session>, StoreError> {
        let Some(id) = self.session_tokens.get(token_hash).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.sessions.get(&id).map(|session| session.clone()))
    }

    async fn update_session_tier(
        &self,
        id: Uuid,
        from: Tier,
        to: Tier,
    ) -> Result<bool, StoreError> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if session.tier != from {
            return Ok(false);
        }
        session.tier = to;
        Ok(true)
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some((_, session)) = self.sessions.remove(&id) {
            self.session_tokens.remove(&session.token_hash);
        }
        Ok(())
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| *entry.key())
            .collect();
        let mut removed = 0;
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                self.session_tokens.remove(&session.token_hash);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn insert_factor(&self, record: &FactorRecord) -> Result<(), StoreError> {
        if let Factor::LinkedAccount { username, .. } = &record.factor
            && self.find_linked_factor(username).await?.is_some()
        {
            return Err(StoreError::Conflict(format!(
                "linked account {username} already registered"
            )));
        }
        self.factors.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_factor(&self, id: Uuid) -> Result<Option<FactorRecord>, StoreError> {
        Ok(self.factors.get(&id).map(|record| record.clone()))
    }

    async fn list_factors(&self, user_id: Uuid) -> Result<Vec<FactorRecord>, StoreError> {
        let mut records: Vec<FactorRecord> = self
            .factors
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    async fn find_linked_factor(
        &self,
        username: &str,
    ) -> Result<Option<FactorRecord>, StoreError> {
        Ok(self
            .factors
            .iter()
            .find(|entry| {
                matches!(&entry.factor, Factor::LinkedAccount { username: linked, .. } if linked == username)
            })
            .map(|entry| entry.value().clone()))
    }

    async fn touch_factor(
        &self,
        id: Uuid,
        previous: &Factor,
        updated: &Factor,
        used_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.factors.get_mut(&id) else {
            return Ok(false);
        };
        if record.factor != *previous {
            return Ok(false);
        }
        record.factor = updated.clone();
        record.last_used_at = Some(used_at);
        Ok(true)
    }

    async fn delete_factor(&self, id: Uuid, owner: Option<Uuid>) -> Result<bool, StoreError> {
        Ok(self
            .factors
            .remove_if(&id, |_, record| {
                owner.is_none_or(|owner| record.user_id == owner)
            })
            .is_some())
    }

    async fn insert_challenge(&self, challenge: &ChallengeRecord) -> Result<(), StoreError> {
        self.challenges.insert(challenge.id, challenge.clone());
        Ok(())
    }

    async fn get_challenge(&self, id: Uuid) -> Result<Option<ChallengeRecord>, StoreError> {
        Ok(self.challenges.get(&id).map(|challenge| challenge.clone()))
    }

    async fn consume_challenge(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Consumption, StoreError> {
        let Some(mut challenge) = self.challenges.get_mut(&id) else {
            return Ok(Consumption::Missing);
        };
        if challenge.consumed_at.is_some() {
            return Ok(Consumption::AlreadyConsumed);
        }
        challenge.consumed_at = Some(at);
        Ok(Consumption::Taken(challenge.clone()))
    }

    async fn set_approval(
        &self,
        id: Uuid,
        user_id: Uuid,
        approval: Approval,
    ) -> Result<bool, StoreError> {
        let Some(mut challenge) = self.challenges.get_mut(&id) else {
            return Ok(false);
        };
        if challenge.consumed_at.is_some() || challenge.approval != Some(Approval::Pending) {
            return Ok(false);
        }
        challenge.approval = Some(approval);
        challenge.user_id = Some(user_id);
        Ok(true)
    }

    async fn bind_host(&self, id: Uuid, host: &HostBinding) -> Result<bool, StoreError> {
        let Some(mut challenge) = self.challenges.get_mut(&id) else {
            return Ok(false);
        };
        if challenge.consumed_at.is_some() {
            return Ok(false);
        }
        challenge.host = Some(host.clone());
        Ok(true)
    }

    async fn insert_association(&self, token: &AssociationToken) -> Result<(), StoreError> {
        self.associations
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_association(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<AssociationToken>, StoreError> {
        Ok(self
            .associations
            .get(token_hash)
            .map(|entry| entry.value().clone()))
    }

    async fn take_association(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<AssociationToken>, StoreError> {
        Ok(self
            .associations
            .remove(token_hash)
            .map(|(_, token)| token))
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<Pruned, StoreError> {
        let mut pruned = Pruned::default();

        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| *entry.key())
            .collect();
        for id in expired {
            if let Some((_, session)) = self
                .sessions
                .remove_if(&id, |_, entry| entry.is_expired(now))
            {
                self.session_tokens.remove(&session.token_hash);
                pruned.sessions += 1;
            }
        }

        self.challenges.retain(|_, challenge| {
            let keep = !challenge.is_expired(now);
            if !keep {
                pruned.challenges += 1;
            }
            keep
        });
        self.associations.retain(|_, token| {
            let keep = now < token.expires_at;
            if !keep {
                pruned.associations += 1;
            }
            keep
        });

        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Purpose;
    use chrono::Duration;
    use std::sync::Arc;

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            password_hash: String::new(),
            is_admin: false,
            created_at: Utc::now(),
        }
    }

    fn challenge(approval: Option<Approval>) -> ChallengeRecord {
        let now = Utc::now();
        ChallengeRecord {
            id: Uuid::new_v4(),
            nonce: "nonce".to_string(),
            user_id: None,
            session_id: None,
            purpose: Purpose::Validation {
                factor_ids: Vec::new(),
            },
            approval,
            host: None,
            created_at: now,
            expires_at: now + Duration::minutes(1),
            consumed_at: None,
        }
    }

    #[tokio::test]
    async fn usernames_are_unique() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.insert_user(&user("alice")).await?;
        let duplicate = store.insert_user(&user("alice")).await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));
        assert!(store.find_user_by_name("alice").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn session_tier_is_compare_and_set() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            token_hash: vec![9; 32],
            user_id: Uuid::new_v4(),
            tier: Tier::SecondaryPending,
            csrf_token: "csrf".to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
        };
        store.insert_session(&session).await?;

        assert!(
            store
                .update_session_tier(session.id, Tier::SecondaryPending, Tier::FullyAuthenticated)
                .await?
        );
        assert!(
            !store
                .update_session_tier(session.id, Tier::SecondaryPending, Tier::FullyAuthenticated)
                .await?
        );
        let found = store.find_session(&[9; 32]).await?;
        assert_eq!(found.map(|s| s.tier), Some(Tier::FullyAuthenticated));
        Ok(())
    }

    #[tokio::test]
    async fn consume_challenge_has_one_winner() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let record = challenge(None);
        store.insert_challenge(&record).await?;

        assert!(matches!(
            store.consume_challenge(record.id, Utc::now()).await?,
            Consumption::Taken(_)
        ));
        assert!(matches!(
            store.consume_challenge(record.id, Utc::now()).await?,
            Consumption::AlreadyConsumed
        ));
        assert!(matches!(
            store.consume_challenge(Uuid::new_v4(), Utc::now()).await?,
            Consumption::Missing
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumption_has_one_winner() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let record = challenge(None);
        store.insert_challenge(&record).await?;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let id = record.id;
            handles.push(tokio::spawn(async move {
                store.consume_challenge(id, Utc::now()).await
            }));
        }
        let mut taken = 0;
        for handle in handles {
            if matches!(handle.await??, Consumption::Taken(_)) {
                taken += 1;
            }
        }
        assert_eq!(taken, 1);
        Ok(())
    }

    #[tokio::test]
    async fn approval_only_moves_from_pending() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let record = challenge(Some(Approval::Pending));
        store.insert_challenge(&record).await?;
        let owner = Uuid::new_v4();

        assert!(store.set_approval(record.id, owner, Approval::Approved).await?);
        assert!(!store.set_approval(record.id, owner, Approval::Denied).await?);
        let stored = store.get_challenge(record.id).await?;
        assert_eq!(stored.as_ref().and_then(|c| c.approval), Some(Approval::Approved));
        assert_eq!(stored.and_then(|c| c.user_id), Some(owner));
        Ok(())
    }

    #[tokio::test]
    async fn association_tokens_are_taken_once() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let token = AssociationToken {
            token_hash: vec![1, 2, 3],
            user_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            username: "alice".to_string(),
            public_key: "key".to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(5),
        };
        store.insert_association(&token).await?;
        assert!(store.find_association(&[1, 2, 3]).await?.is_some());
        assert!(store.find_association(&[1, 2, 3]).await?.is_some());
        assert!(store.take_association(&[1, 2, 3]).await?.is_some());
        assert!(store.take_association(&[1, 2, 3]).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn prune_drops_expired_sessions_and_tokens() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let owner = user("alice");
        let session = |token: u8, expires_at| Session {
            id: Uuid::new_v4(),
            token_hash: vec![token],
            user_id: owner.id,
            tier: Tier::Primary,
            csrf_token: "csrf".to_string(),
            created_at: now - Duration::hours(13),
            expires_at,
        };
        store.insert_session(&session(1, now - Duration::minutes(1))).await?;
        store.insert_session(&session(2, now + Duration::hours(1))).await?;
        let association = |token: u8, expires_at| AssociationToken {
            token_hash: vec![token],
            user_id: owner.id,
            session_id: Uuid::new_v4(),
            username: "alice".to_string(),
            public_key: "key".to_string(),
            created_at: now - Duration::minutes(10),
            expires_at,
        };
        store.insert_association(&association(1, now)).await?;
        store
            .insert_association(&association(2, now + Duration::minutes(5)))
            .await?;
        let mut stale = challenge(None);
        stale.expires_at = now - Duration::seconds(1);
        let fresh = challenge(None);
        store.insert_challenge(&stale).await?;
        store.insert_challenge(&fresh).await?;

        let pruned = store.prune_expired(now).await?;
        assert_eq!(
            pruned,
            Pruned {
                sessions: 1,
                challenges: 1,
                associations: 1,
            }
        );
        assert!(store.find_session(&[1]).await?.is_none());
        assert!(store.find_session(&[2]).await?.is_some());
        assert!(store.take_association(&[1]).await?.is_none());
        assert!(store.take_association(&[2]).await?.is_some());
        assert!(store.get_challenge(stale.id).await?.is_none());
        assert!(store.get_challenge(fresh.id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn touch_factor_is_compare_and_set() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let key = |counter| Factor::HardwareKey {
            key_handle: "handle".to_string(),
            public_key: "key".to_string(),
            counter,
        };
        let record = FactorRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "yubikey".to_string(),
            factor: key(0),
            created_at: Utc::now(),
            last_used_at: None,
        };
        store.insert_factor(&record).await?;

        assert!(store.touch_factor(record.id, &key(0), &key(1), Utc::now()).await?);
        // A second writer that also read counter 0 loses.
        assert!(!store.touch_factor(record.id, &key(0), &key(1), Utc::now()).await?);
        let stored = store.get_factor(record.id).await?;
        assert_eq!(stored.as_ref().map(|r| &r.factor), Some(&key(1)));
        assert!(stored.and_then(|r| r.last_used_at).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn delete_factor_respects_owner() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let record = FactorRecord {
            id: Uuid::new_v4(),
            user_id: owner,
            name: "key".to_string(),
            factor: Factor::SshKey {
                public_key: "ssh-ed25519 AAAA".to_string(),
                fingerprint: "SHA256:x".to_string(),
            },
            created_at: Utc::now(),
            last_used_at: None,
        };
        store.insert_factor(&record).await?;

        assert!(!store.delete_factor(record.id, Some(Uuid::new_v4())).await?);
        assert!(store.delete_factor(record.id, Some(owner)).await?);
        assert!(store.list_factors(owner).await?.is_empty());
        Ok(())
    }
}
