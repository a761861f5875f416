use crate::factor::{Factor, FactorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;
use uuid::Uuid;

/// How far a session has progressed through authentication.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Anonymous,
    /// Password accepted, secondary factor still required.
    Primary,
    /// A validation challenge has been issued for this session.
    SecondaryPending,
    FullyAuthenticated,
}

impl Tier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Primary => "primary",
            Self::SecondaryPending => "secondary_pending",
            Self::FullyAuthenticated => "fully_authenticated",
        }
    }

    /// Tiers allowed to request or answer a validation challenge.
    #[must_use]
    pub const fn awaits_secondary(self) -> bool {
        matches!(self, Self::Primary | Self::SecondaryPending)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "anonymous" => Ok(Self::Anonymous),
            "primary" => Ok(Self::Primary),
            "secondary_pending" => Ok(Self::SecondaryPending),
            "fully_authenticated" => Ok(Self::FullyAuthenticated),
            other => Err(format!("unknown session tier: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub id: Uuid,
    /// SHA-256 of the cookie token; the raw token is never stored.
    pub token_hash: Vec<u8>,
    pub user_id: Uuid,
    pub tier: Tier,
    pub csrf_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A registered secondary factor.
#[derive(Clone, Debug)]
pub struct FactorRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub factor: Factor,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl FactorRecord {
    #[must_use]
    pub const fn kind(&self) -> FactorKind {
        self.factor.kind()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Purpose {
    /// Enrollment of a new factor. Linked accounts carry the pending factor,
    /// hardware keys deliver theirs in the response.
    Registration {
        kind: FactorKind,
        pending: Option<Factor>,
        label: Option<String>,
    },
    /// Login step-up against already registered factors.
    Validation { factor_ids: Vec<Uuid> },
    /// SSH certificate request for `public_key`.
    Certificate {
        public_key: String,
        linked_factor: Option<Uuid>,
    },
    /// Hardware key confirmation a browser owes before approving certificate
    /// request `certificate`.
    ApprovalStepUp {
        certificate: Uuid,
        factor_ids: Vec<Uuid>,
    },
    /// Hardware key confirmation a linked account owes before its certificate
    /// is issued. Carries what issuance needs; the request itself is spent.
    IssuanceStepUp {
        public_key: String,
        host: Option<HostBinding>,
        factor_ids: Vec<Uuid>,
    },
}

impl Purpose {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registration { .. } => "registration",
            Self::Validation { .. } => "validation",
            Self::Certificate { .. } => "certificate",
            Self::ApprovalStepUp { .. } => "approval_step_up",
            Self::IssuanceStepUp { .. } => "issuance_step_up",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    Pending,
    Approved,
    Denied,
}

impl Approval {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }
}

impl FromStr for Approval {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            other => Err(format!("unknown approval state: {other}")),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostBinding {
    pub public_key: String,
    pub hostnames: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ChallengeRecord {
    pub id: Uuid,
    pub nonce: String,
    pub user_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub purpose: Purpose,
    /// Only certificate requests carry an approval state.
    pub approval: Option<Approval>,
    pub host: Option<HostBinding>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ChallengeRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of an atomic challenge consumption.
#[derive(Debug)]
pub enum Consumption {
    /// This caller consumed the challenge; the record is as it was taken.
    Taken(ChallengeRecord),
    AlreadyConsumed,
    Missing,
}

/// Rows removed by one sweep of expired records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Pruned {
    pub sessions: u64,
    pub challenges: u64,
    pub associations: u64,
}

impl Pruned {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.sessions + self.challenges + self.associations
    }
}

#[derive(Clone, Debug)]
pub struct AssociationToken {
    pub token_hash: Vec<u8>,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub username: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
