//! Hardware security keys (U2F-style challenge/response over Ed25519).
//!
//! Registration proves possession of a freshly generated key pair:
//! the token signs `SHA256(app_id) || SHA256(nonce) || key_handle || public_key`.
//! Authentication signs `SHA256(app_id) || counter (big endian) || SHA256(nonce)`
//! and the counter must strictly increase between uses, which detects cloned tokens.

use super::{
    Factor,
    challenge::{VerifyError, decode_field, decode_fixed},
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

fn digest(value: &[u8]) -> [u8; 32] {
    Sha256::digest(value).into()
}

/// Bytes signed by a token during registration.
#[must_use]
pub fn registration_payload(
    app_id: &str,
    nonce: &str,
    key_handle: &[u8],
    public_key: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + key_handle.len() + public_key.len());
    payload.extend_from_slice(&digest(app_id.as_bytes()));
    payload.extend_from_slice(&digest(nonce.as_bytes()));
    payload.extend_from_slice(key_handle);
    payload.extend_from_slice(public_key);
    payload
}

/// Bytes signed by a token when answering a validation challenge.
#[must_use]
pub fn sign_payload(app_id: &str, counter: u32, nonce: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(68);
    payload.extend_from_slice(&digest(app_id.as_bytes()));
    payload.extend_from_slice(&counter.to_be_bytes());
    payload.extend_from_slice(&digest(nonce.as_bytes()));
    payload
}

fn verifying_key(public_key: &str) -> Result<VerifyingKey, VerifyError> {
    let bytes = decode_fixed::<32>("public_key", public_key)?;
    VerifyingKey::from_bytes(&bytes).map_err(|err| VerifyError::Malformed(err.to_string()))
}

fn verify(key: &VerifyingKey, payload: &[u8], signature: &str) -> Result<(), VerifyError> {
    let signature = Signature::from_bytes(&decode_fixed::<64>("signature", signature)?);
    key.verify(payload, &signature)
        .map_err(|_| VerifyError::BadSignature)
}

/// Verify a registration response and build the factor to persist.
///
/// # Errors
/// Returns [`VerifyError`] if any field is malformed or the signature fails.
pub fn verify_registration(
    app_id: &str,
    nonce: &str,
    key_handle: &str,
    public_key: &str,
    signature: &str,
) -> Result<Factor, VerifyError> {
    let handle = decode_field("key_handle", key_handle)?;
    if handle.is_empty() {
        return Err(VerifyError::Malformed("key_handle: empty".to_string()));
    }
    let key = verifying_key(public_key)?;
    let payload = registration_payload(app_id, nonce, &handle, key.as_bytes());
    verify(&key, &payload, signature)?;

    Ok(Factor::HardwareKey {
        key_handle: key_handle.trim().to_string(),
        public_key: public_key.trim().to_string(),
        counter: 0,
    })
}

/// Verify a sign response against the stored key and counter.
///
/// # Errors
/// Returns [`VerifyError::CounterRegression`] when `presented <= stored`,
/// otherwise [`VerifyError`] for malformed input or a bad signature.
pub fn verify_sign(
    app_id: &str,
    nonce: &str,
    public_key: &str,
    stored: u32,
    presented: u32,
    signature: &str,
) -> Result<(), VerifyError> {
    let key = verifying_key(public_key)?;
    verify(&key, &sign_payload(app_id, presented, nonce), signature)?;
    if presented <= stored {
        return Err(VerifyError::CounterRegression { stored, presented });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    const APP_ID: &str = "https://gateway.test";

    fn register(signing: &SigningKey, nonce: &str) -> (String, String, String) {
        let handle = b"token-handle-1";
        let public = signing.verifying_key().to_bytes();
        let signature = signing.sign(&registration_payload(APP_ID, nonce, handle, &public));
        (
            URL_SAFE_NO_PAD.encode(handle),
            URL_SAFE_NO_PAD.encode(public),
            URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        )
    }

    #[test]
    fn registration_accepts_valid_signature() {
        let signing = SigningKey::generate(&mut OsRng);
        let (handle, public, signature) = register(&signing, "nonce");
        let factor = verify_registration(APP_ID, "nonce", &handle, &public, &signature);
        assert!(matches!(
            factor,
            Ok(Factor::HardwareKey { counter: 0, .. })
        ));
    }

    #[test]
    fn registration_rejects_other_nonce() {
        let signing = SigningKey::generate(&mut OsRng);
        let (handle, public, signature) = register(&signing, "nonce");
        let result = verify_registration(APP_ID, "other", &handle, &public, &signature);
        assert!(matches!(result, Err(VerifyError::BadSignature)));
    }

    #[test]
    fn sign_requires_increasing_counter() {
        let signing = SigningKey::generate(&mut OsRng);
        let public = URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes());
        let sign = |counter| {
            URL_SAFE_NO_PAD.encode(signing.sign(&sign_payload(APP_ID, counter, "n")).to_bytes())
        };

        assert!(verify_sign(APP_ID, "n", &public, 4, 5, &sign(5)).is_ok());
        assert!(matches!(
            verify_sign(APP_ID, "n", &public, 5, 5, &sign(5)),
            Err(VerifyError::CounterRegression {
                stored: 5,
                presented: 5
            })
        ));
        // Counter is covered by the signature.
        assert!(matches!(
            verify_sign(APP_ID, "n", &public, 4, 9, &sign(5)),
            Err(VerifyError::BadSignature)
        ));
    }

    #[test]
    fn malformed_public_key_is_reported() {
        let result = verify_sign(APP_ID, "n", "!!", 0, 1, "AAAA");
        assert!(matches!(result, Err(VerifyError::Malformed(_))));
    }
}
