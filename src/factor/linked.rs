//! Linked external accounts, proven by an Ed25519 key held by an external tool.

use super::challenge::{VerifyError, decode_fixed};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use regex::Regex;

/// Lowercase external usernames so lookups are case-insensitive.
#[must_use]
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// External usernames are short handles: letters, digits, `_`, `-` and `.`.
#[must_use]
pub fn valid_username(normalized: &str) -> bool {
    Regex::new(r"^[a-z0-9][a-z0-9_.-]{0,63}$").is_ok_and(|regex| regex.is_match(normalized))
}

/// Check that `public_key` decodes to an Ed25519 point.
///
/// # Errors
/// Returns [`VerifyError::Malformed`] if decoding fails.
pub fn parse_public_key(public_key: &str) -> Result<VerifyingKey, VerifyError> {
    let bytes = decode_fixed::<32>("public_key", public_key)?;
    VerifyingKey::from_bytes(&bytes).map_err(|err| VerifyError::Malformed(err.to_string()))
}

/// Verify a detached Ed25519 signature made by the linked account.
///
/// # Errors
/// Returns [`VerifyError`] for malformed input or a signature mismatch.
pub fn verify_signature(
    public_key: &str,
    message: &[u8],
    signature: &str,
) -> Result<(), VerifyError> {
    let key = parse_public_key(public_key)?;
    let signature = Signature::from_bytes(&decode_fixed::<64>("signature", signature)?);
    key.verify_strict(message, &signature)
        .map_err(|_| VerifyError::BadSignature)
}
