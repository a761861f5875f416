//! Request and response bodies for the auth endpoints.

use crate::{
    factor::{FactorKind, FactorResponse},
    store::{FactorRecord, Tier},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub tier: Tier,
    /// Whether a secondary factor must still be presented.
    pub secondary: bool,
    /// Factor kinds the user can answer a validation challenge with.
    pub factors: Vec<FactorKind>,
    /// Bearer token for non-browser clients; browsers use the cookie.
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TierResponse {
    pub tier: Tier,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogoutResponse {
    /// Number of sessions removed.
    pub sessions: u64,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SecondaryQuery {
    /// `hardware_key`, `ssh_key` or `linked_account`.
    pub factor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SecondaryAnswer {
    pub challenge_id: Uuid,
    pub response: FactorResponse,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct U2fSignAnswer {
    pub challenge_id: Uuid,
    pub key_handle: String,
    pub counter: u32,
    pub signature: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct U2fRegisterQuery {
    /// Display name for the key.
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct U2fRegisterAnswer {
    pub challenge_id: Uuid,
    pub key_handle: String,
    pub public_key: String,
    pub signature: String,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CsrfResponse {
    pub csrf_token: String,
}

/// A registered factor as shown to its owner.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeviceView {
    pub id: Uuid,
    pub name: String,
    pub kind: FactorKind,
    /// Key handle, fingerprint or linked username.
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&FactorRecord> for DeviceView {
    fn from(record: &FactorRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            kind: record.kind(),
            identity: record.factor.issue_challenge().identity,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeletedResponse {
    pub id: Uuid,
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthStateResponse {
    pub factors: Vec<FactorKind>,
    pub app_id: String,
    pub service_name: String,
    pub version: String,
    /// OpenSSH public key of the certificate authority.
    pub ssh_certificate_authority: Option<String>,
}
