//! Nonces, challenge messages and verification errors shared by all factors.

use super::FactorKind;
use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;

const NONCE_BYTES: usize = 32;

/// Public part of a challenge addressed to one registered factor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChallengeHint {
    pub kind: FactorKind,
    /// Key handle, key fingerprint or linked username.
    pub identity: String,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("signature does not verify")]
    BadSignature,
    #[error("counter did not advance (stored {stored}, presented {presented})")]
    CounterRegression { stored: u32, presented: u32 },
    #[error("response kind does not match the factor")]
    KindMismatch,
}

/// Fresh random nonce, URL-safe base64 without padding.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_nonce() -> Result<String> {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate challenge nonce")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// SHA-256 of a bearer token; only the hash is persisted.
#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    Sha256::digest(token.trim().as_bytes()).to_vec()
}

/// The exact bytes every factor signs for a challenge.
#[must_use]
pub fn message(app_id: &str, nonce: &str) -> String {
    format!("{app_id}:{nonce}")
}

pub(crate) fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, VerifyError> {
    URL_SAFE_NO_PAD
        .decode(value.trim().trim_end_matches('='))
        .map_err(|err| VerifyError::Malformed(format!("{name}: {err}")))
}

pub(crate) fn decode_fixed<const N: usize>(name: &str, value: &str) -> Result<[u8; N], VerifyError> {
    let bytes = decode_field(name, value)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        VerifyError::Malformed(format!("{name}: expected {N} bytes, got {}", bytes.len()))
    })
}
