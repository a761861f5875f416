//! Secondary factors and the challenge/response engine.
//!
//! Every factor kind shares one contract: the server issues a challenge
//! (`issue_challenge` returns the public hint a client needs to pick the right
//! key), and the client answers with a signature over the challenge message
//! (`verify_response`). The verification material kept server-side is public
//! key data only.
//!
//! - **Hardware keys** sign a U2F-style payload with a monotonic counter.
//! - **SSH keys** answer with an `SSHSIG` signature and unlock short-lived
//!   certificates issued by the gateway CA.
//! - **Linked accounts** are external identities proven by an Ed25519 key,
//!   enrolled out of band through a single-use association token.

pub mod challenge;
pub mod engine;
pub mod hardware;
pub mod linked;
pub mod ssh;

pub use challenge::{ChallengeHint, VerifyError};
pub use engine::{
    CertificateOutcome, Decision, EngineSettings, FactorEngine, IssuedCertificates,
    RegistrationChallenge, ValidationChallenge,
};
pub use ssh::CertificateAuthority;

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;

/// Factor kinds exposed over the API (`?factor=` and device listings).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    HardwareKey,
    SshKey,
    LinkedAccount,
}

impl FactorKind {
    pub const ALL: [Self; 3] = [Self::HardwareKey, Self::SshKey, Self::LinkedAccount];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HardwareKey => "hardware_key",
            Self::SshKey => "ssh_key",
            Self::LinkedAccount => "linked_account",
        }
    }
}

impl fmt::Display for FactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "hardware_key" | "u2f" => Ok(Self::HardwareKey),
            "ssh_key" | "ssh" => Ok(Self::SshKey),
            "linked_account" | "keybase" => Ok(Self::LinkedAccount),
            other => Err(format!("unknown factor kind: {other}")),
        }
    }
}

/// Public verification material for a registered factor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Factor {
    HardwareKey {
        key_handle: String,
        public_key: String,
        counter: u32,
    },
    SshKey {
        public_key: String,
        fingerprint: String,
    },
    LinkedAccount {
        username: String,
        public_key: String,
    },
}

/// A client's answer to a validation challenge.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactorResponse {
    HardwareKey {
        key_handle: String,
        counter: u32,
        signature: String,
    },
    /// Armored `SSHSIG` over the challenge message.
    SshKey { signature: String },
    LinkedAccount {
        username: Option<String>,
        signature: String,
    },
}

impl FactorResponse {
    #[must_use]
    pub const fn kind(&self) -> FactorKind {
        match self {
            Self::HardwareKey { .. } => FactorKind::HardwareKey,
            Self::SshKey { .. } => FactorKind::SshKey,
            Self::LinkedAccount { .. } => FactorKind::LinkedAccount,
        }
    }
}

impl Factor {
    #[must_use]
    pub const fn kind(&self) -> FactorKind {
        match self {
            Self::HardwareKey { .. } => FactorKind::HardwareKey,
            Self::SshKey { .. } => FactorKind::SshKey,
            Self::LinkedAccount { .. } => FactorKind::LinkedAccount,
        }
    }

    /// Public hint the client needs to answer a challenge with this factor.
    #[must_use]
    pub fn issue_challenge(&self) -> ChallengeHint {
        let identity = match self {
            Self::HardwareKey { key_handle, .. } => key_handle.clone(),
            Self::SshKey { fingerprint, .. } => fingerprint.clone(),
            Self::LinkedAccount { username, .. } => username.clone(),
        };
        ChallengeHint {
            kind: self.kind(),
            identity,
        }
    }

    /// Whether `response` claims to come from this factor.
    ///
    /// Only identity is compared here; the signature is checked by
    /// [`Factor::verify_response`].
    #[must_use]
    pub fn answers(&self, response: &FactorResponse) -> bool {
        match (self, response) {
            (
                Self::HardwareKey { key_handle, .. },
                FactorResponse::HardwareKey {
                    key_handle: claimed,
                    ..
                },
            ) => key_handle == claimed,
            (Self::SshKey { fingerprint, .. }, FactorResponse::SshKey { signature }) => {
                ssh::signer_fingerprint(signature).is_some_and(|signer| &signer == fingerprint)
            }
            (
                Self::LinkedAccount { username, .. },
                FactorResponse::LinkedAccount {
                    username: claimed, ..
                },
            ) => claimed.as_deref().is_none_or(|claimed| claimed == username),
            _ => false,
        }
    }

    /// Verify a signed response against `message`.
    ///
    /// Returns the factor with any state the response advances (the hardware
    /// key counter), ready to be written back.
    ///
    /// # Errors
    /// Returns [`VerifyError`] when the response is malformed, the signature
    /// does not verify, or the hardware counter did not increase.
    pub fn verify_response(
        &self,
        app_id: &str,
        nonce: &str,
        response: &FactorResponse,
    ) -> Result<Self, VerifyError> {
        match (self, response) {
            (
                Self::HardwareKey {
                    key_handle,
                    public_key,
                    counter,
                },
                FactorResponse::HardwareKey {
                    counter: presented,
                    signature,
                    ..
                },
            ) => {
                hardware::verify_sign(app_id, nonce, public_key, *counter, *presented, signature)?;
                Ok(Self::HardwareKey {
                    key_handle: key_handle.clone(),
                    public_key: public_key.clone(),
                    counter: *presented,
                })
            }
            (Self::SshKey { public_key, .. }, FactorResponse::SshKey { signature }) => {
                ssh::verify_signature(public_key, &challenge::message(app_id, nonce), signature)?;
                Ok(self.clone())
            }
            (
                Self::LinkedAccount { public_key, .. },
                FactorResponse::LinkedAccount { signature, .. },
            ) => {
                linked::verify_signature(
                    public_key,
                    challenge::message(app_id, nonce).as_bytes(),
                    signature,
                )?;
                Ok(self.clone())
            }
            _ => Err(VerifyError::KindMismatch),
        }
    }
}
