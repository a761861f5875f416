//! Argon2id password hashing. Verification runs on the blocking pool.

use crate::error::AuthError;
use anyhow::{Result, anyhow};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use secrecy::{ExposeSecret, SecretString};

/// Hash a password into a PHC string.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &SecretString) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

/// Check `password` against a stored PHC string.
///
/// # Errors
/// Returns [`AuthError::InternalFault`] for an unparsable stored hash or a
/// failed blocking task.
pub async fn verify_password(stored: String, password: SecretString) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored)
            .map_err(|err| AuthError::internal(format!("stored password hash: {err}")))?;
        Ok(Argon2::default()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(AuthError::internal)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_then_verify() -> anyhow::Result<()> {
        let hash = hash_password(&SecretString::from("correct horse"))?;
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(hash.clone(), SecretString::from("correct horse")).await?);
        assert!(!verify_password(hash, SecretString::from("wrong")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_hash_is_internal_fault() {
        let result = verify_password("not-a-hash".to_string(), SecretString::from("x")).await;
        assert!(matches!(result, Err(AuthError::InternalFault(_))));
    }
}
