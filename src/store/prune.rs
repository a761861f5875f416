use super::Store;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, warn};

/// Sweep expired sessions, challenges and association tokens every `every`.
/// Failures are logged and retried on the next tick.
pub fn spawn_pruner(store: Arc<dyn Store>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.prune_expired(Utc::now()).await {
                Ok(pruned) if pruned.total() > 0 => debug!(
                    sessions = pruned.sessions,
                    challenges = pruned.challenges,
                    associations = pruned.associations,
                    "Pruned expired records"
                ),
                Ok(_) => {}
                Err(err) => warn!("Failed to prune expired records: {err}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        factor::{CertificateAuthority, EngineSettings, FactorEngine},
        store::{MemoryStore, Pruned},
    };
    use chrono::Duration as ChronoDuration;
    use ssh_key::{Algorithm, PrivateKey};

    async fn stale_requests(store: &MemoryStore, count: usize) -> anyhow::Result<Vec<uuid::Uuid>> {
        let engine = FactorEngine::new(
            EngineSettings::new("https://gateway.test"),
            CertificateAuthority::generate()?,
        );
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)?;
        let public = key.public_key().to_openssh()?;
        let issued_at = Utc::now() - ChronoDuration::hours(2);
        let mut tokens = Vec::with_capacity(count);
        for _ in 0..count {
            let request = engine.request_certificate(store, &public, issued_at).await?;
            tokens.push(request.token);
        }
        Ok(tokens)
    }

    #[tokio::test]
    async fn expired_certificate_requests_are_swept() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let tokens = stale_requests(&store, 200).await?;

        let pruned = store.prune_expired(Utc::now()).await?;
        assert_eq!(pruned.challenges, 200);
        for token in tokens {
            assert!(store.get_challenge(token).await?.is_none());
        }
        assert_eq!(store.prune_expired(Utc::now()).await?, Pruned::default());
        Ok(())
    }

    #[tokio::test]
    async fn background_task_sweeps_on_its_own() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let tokens = stale_requests(&store, 10).await?;

        let task = spawn_pruner(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        for token in tokens {
            assert!(store.get_challenge(token).await?.is_none());
        }
        Ok(())
    }
}
