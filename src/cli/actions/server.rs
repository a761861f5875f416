use crate::{
    api::{self, AppState, GatewayConfig, handlers::auth::hash_password},
    factor::{CertificateAuthority, EngineSettings, FactorEngine},
    store::{MemoryStore, PgStore, Store, User, spawn_pruner},
};
use anyhow::{Context, Result};
use chrono::Utc;
use secrecy::SecretString;
use std::{fs, sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub app_id: String,
    pub service_name: String,
    pub cookie_secure: bool,
    pub session_ttl_seconds: u64,
    pub challenge_ttl_seconds: u64,
    pub association_ttl_seconds: u64,
    pub bootstrap: Option<(String, SecretString)>,
    pub ssh_ca_key_path: Option<String>,
    pub ssh_request_ttl_seconds: u64,
    pub ssh_cert_ttl_seconds: u64,
    pub ssh_host_cert_ttl_seconds: u64,
    pub store_timeout_seconds: u64,
    pub rate_limit: u32,
    pub rate_limit_window_seconds: u64,
    pub trust_proxy: bool,
    pub prune_interval_seconds: u64,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the store, the CA key or the listener cannot be set up.
pub async fn execute(args: Args) -> Result<()> {
    let store: Arc<dyn Store> = match &args.dsn {
        Some(dsn) => Arc::new(
            PgStore::connect(dsn)
                .await
                .context("Failed to connect to database")?,
        ),
        None => {
            warn!("No DSN configured, all state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let authority = load_authority(args.ssh_ca_key_path.as_deref())?
        .with_user_ttl(Duration::from_secs(args.ssh_cert_ttl_seconds))
        .with_host_ttl(Duration::from_secs(args.ssh_host_cert_ttl_seconds));

    let settings = EngineSettings::new(args.app_id)
        .with_service_name(args.service_name)
        .with_challenge_ttl(Duration::from_secs(args.challenge_ttl_seconds))
        .with_association_ttl(Duration::from_secs(args.association_ttl_seconds))
        .with_certificate_request_ttl(Duration::from_secs(args.ssh_request_ttl_seconds));

    if let Some((username, password)) = &args.bootstrap
        && bootstrap_admin(store.as_ref(), username, password).await?
    {
        info!("Created bootstrap administrator {username}");
    }

    let config = GatewayConfig::new()
        .with_session_ttl(Duration::from_secs(args.session_ttl_seconds))
        .with_cookie_secure(args.cookie_secure)
        .with_store_timeout(Duration::from_secs(args.store_timeout_seconds))
        .with_rate_limit(
            args.rate_limit,
            Duration::from_secs(args.rate_limit_window_seconds),
        )
        .with_trust_proxy(args.trust_proxy);

    spawn_pruner(
        store.clone(),
        Duration::from_secs(args.prune_interval_seconds),
    );

    let state = AppState::new(config, store, FactorEngine::new(settings, authority));

    api::new(args.port, state).await
}

fn load_authority(path: Option<&str>) -> Result<CertificateAuthority> {
    if let Some(path) = path {
        let pem = fs::read_to_string(path)
            .with_context(|| format!("Failed to read SSH CA key: {path}"))?;
        CertificateAuthority::from_openssh(&pem)
            .with_context(|| format!("Invalid SSH CA key: {path}"))
    } else {
        warn!("No SSH CA key configured, generated an ephemeral one");
        CertificateAuthority::generate()
    }
}

/// Create the administrator unless the username is taken. Returns whether a
/// user was created.
pub(crate) async fn bootstrap_admin(
    store: &dyn Store,
    username: &str,
    password: &SecretString,
) -> Result<bool> {
    let username = username.trim().to_lowercase();
    if store
        .find_user_by_name(&username)
        .await
        .context("Failed to look up bootstrap user")?
        .is_some()
    {
        return Ok(false);
    }

    let user = User {
        id: Uuid::now_v7(),
        username,
        password_hash: hash_password(password)?,
        is_admin: true,
        created_at: Utc::now(),
    };
    store
        .insert_user(&user)
        .await
        .context("Failed to create bootstrap user")?;
    Ok(true)
}
