//! SSH keys: `SSHSIG` verification and the gateway certificate authority.

use super::challenge::VerifyError;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use ssh_key::{
    Algorithm, HashAlg, PrivateKey, PublicKey, SshSig,
    certificate::{Builder, CertType},
};
use std::time::Duration;
use tracing::debug;

/// Namespace clients must use with `ssh-keygen -Y sign -n`.
pub const SIGNATURE_NAMESPACE: &str = "zerogate";

/// Back-dating applied to `valid_after` for client clock skew.
const CLOCK_SKEW: Duration = Duration::from_secs(60);

pub const DEFAULT_USER_CERT_TTL: Duration = Duration::from_secs(60 * 60 * 16);
pub const DEFAULT_HOST_CERT_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Parse an OpenSSH `authorized_keys` style public key.
///
/// # Errors
/// Returns [`VerifyError::Malformed`] when the key does not parse.
pub fn parse_public_key(openssh: &str) -> Result<PublicKey, VerifyError> {
    PublicKey::from_openssh(openssh.trim())
        .map_err(|err| VerifyError::Malformed(format!("public_key: {err}")))
}

#[must_use]
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Fingerprint of the key embedded in an armored `SSHSIG`, if it parses.
#[must_use]
pub fn signer_fingerprint(signature: &str) -> Option<String> {
    let signature = SshSig::from_pem(signature.trim()).ok()?;
    Some(signature.public_key().fingerprint(HashAlg::Sha256).to_string())
}

/// Verify an armored `SSHSIG` over `message` made with `public_key`.
///
/// # Errors
/// Returns [`VerifyError`] for malformed input, a wrong namespace or a bad signature.
pub fn verify_signature(public_key: &str, message: &str, signature: &str) -> Result<(), VerifyError> {
    let key = parse_public_key(public_key)?;
    let signature = SshSig::from_pem(signature.trim())
        .map_err(|err| VerifyError::Malformed(format!("signature: {err}")))?;
    key.verify(SIGNATURE_NAMESPACE, message.as_bytes(), &signature)
        .map_err(|err| {
            debug!("SSHSIG verification failed: {err}");
            VerifyError::BadSignature
        })
}

/// Signs short-lived user and host certificates.
pub struct CertificateAuthority {
    key: PrivateKey,
    user_ttl: Duration,
    host_ttl: Duration,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("fingerprint", &self.key.public_key().fingerprint(HashAlg::Sha256))
            .field("user_ttl", &self.user_ttl)
            .field("host_ttl", &self.host_ttl)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Ephemeral CA key; certificates die with the process.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate() -> Result<Self> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("failed to generate SSH CA key")?;
        Ok(Self::new(key))
    }

    /// Load an unencrypted OpenSSH private key.
    ///
    /// # Errors
    /// Returns an error if the key does not parse or is passphrase protected.
    pub fn from_openssh(pem: &str) -> Result<Self> {
        let key = PrivateKey::from_openssh(pem).context("invalid SSH CA private key")?;
        if key.is_encrypted() {
            return Err(anyhow!("SSH CA private key must not be encrypted"));
        }
        Ok(Self::new(key))
    }

    fn new(key: PrivateKey) -> Self {
        Self {
            key,
            user_ttl: DEFAULT_USER_CERT_TTL,
            host_ttl: DEFAULT_HOST_CERT_TTL,
        }
    }

    #[must_use]
    pub fn with_user_ttl(mut self, ttl: Duration) -> Self {
        self.user_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_host_ttl(mut self, ttl: Duration) -> Self {
        self.host_ttl = ttl;
        self
    }

    /// CA public key for `TrustedUserCAKeys` / `@cert-authority` lines.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn public_key_openssh(&self) -> Result<String> {
        self.key
            .public_key()
            .to_openssh()
            .context("failed to encode SSH CA public key")
    }

    /// Issue a user certificate valid for `principal`.
    ///
    /// # Errors
    /// Returns an error if the certificate cannot be built or signed.
    pub fn issue_user(
        &self,
        subject: &PublicKey,
        principal: &str,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let mut builder = self.builder(subject, now, self.user_ttl)?;
        builder.cert_type(CertType::User)?;
        builder.key_id(key_id)?;
        builder.valid_principal(principal)?;
        builder.extension("permit-pty", "")?;
        builder.extension("permit-agent-forwarding", "")?;
        builder.extension("permit-port-forwarding", "")?;
        let certificate = builder.sign(&self.key).context("failed to sign user certificate")?;
        certificate
            .to_openssh()
            .context("failed to encode user certificate")
    }

    /// Issue a host certificate for `hostnames`.
    ///
    /// # Errors
    /// Returns an error if the certificate cannot be built or signed.
    pub fn issue_host(
        &self,
        host_key: &PublicKey,
        hostnames: &[String],
        now: DateTime<Utc>,
    ) -> Result<String> {
        let mut builder = self.builder(host_key, now, self.host_ttl)?;
        builder.cert_type(CertType::Host)?;
        builder.key_id(hostnames.first().map_or("host", String::as_str))?;
        for hostname in hostnames {
            builder.valid_principal(hostname.as_str())?;
        }
        let certificate = builder.sign(&self.key).context("failed to sign host certificate")?;
        certificate
            .to_openssh()
            .context("failed to encode host certificate")
    }

    fn builder(&self, subject: &PublicKey, now: DateTime<Utc>, ttl: Duration) -> Result<Builder> {
        let now = u64::try_from(now.timestamp()).context("clock before unix epoch")?;
        let valid_after = now.saturating_sub(CLOCK_SKEW.as_secs());
        let valid_before = now.saturating_add(ttl.as_secs());
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.key_data().clone(),
            valid_after,
            valid_before,
        )
        .context("failed to start certificate")?;
        builder.serial(OsRng.next_u64())?;
        Ok(builder)
    }
}
