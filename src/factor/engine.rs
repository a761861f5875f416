//! Challenge lifecycle for every factor kind.
//!
//! Redemption order is fixed: look the challenge up, check it belongs to the
//! caller and has the right purpose, consume it atomically, then check expiry
//! and finally the signature. Anything after the consume step spends the
//! challenge, so a failed answer can never be retried with the same nonce.

use super::{
    ChallengeHint, Factor, FactorKind, FactorResponse, VerifyError,
    challenge::{self, hash_token},
    hardware, linked, ssh,
    ssh::CertificateAuthority,
};
use crate::error::AuthError;
use crate::store::{
    Approval, AssociationToken, ChallengeRecord, Consumption, FactorRecord, HostBinding, Purpose,
    Session, Store, Tier, User,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

pub const DEFAULT_APP_ID: &str = "https://localhost:8080";
pub const DEFAULT_SERVICE_NAME: &str = "zerogate";
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ASSOCIATION_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CERTIFICATE_REQUEST_TTL: Duration = Duration::from_secs(10 * 60);

/// Tunables for challenge issuance.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    app_id: String,
    service_name: String,
    challenge_ttl: Duration,
    association_ttl: Duration,
    certificate_request_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
            association_ttl: DEFAULT_ASSOCIATION_TTL,
            certificate_request_ttl: DEFAULT_CERTIFICATE_REQUEST_TTL,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    #[must_use]
    pub const fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_association_ttl(mut self, ttl: Duration) -> Self {
        self.association_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_certificate_request_ttl(mut self, ttl: Duration) -> Self {
        self.certificate_request_ttl = ttl;
        self
    }

    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// A client's answer to a registration challenge.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistrationResponse {
    HardwareKey {
        key_handle: String,
        public_key: String,
        signature: String,
    },
    LinkedAccount { signature: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RegistrationChallenge {
    pub challenge_id: Uuid,
    pub kind: FactorKind,
    pub app_id: String,
    pub service_name: String,
    pub nonce: String,
    /// Exact string the client must sign.
    pub message: String,
    /// Factors of the same kind the user already has.
    pub registered: Vec<ChallengeHint>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidationChallenge {
    pub challenge_id: Uuid,
    pub kind: FactorKind,
    pub app_id: String,
    pub nonce: String,
    pub message: String,
    pub hints: Vec<ChallengeHint>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct CertificateRequest {
    pub token: Uuid,
    pub nonce: String,
    /// Sign with `ssh-keygen -Y sign -n zerogate` (or the linked key).
    pub message: String,
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct IssuedCertificates {
    pub principal: String,
    pub certificate: String,
    pub host_certificate: Option<String>,
}

#[derive(Debug)]
pub enum CertificateOutcome {
    /// Still waiting for the user to approve the request in the browser.
    Pending,
    /// The linked account's owner has hardware keys; one must sign first.
    SecondaryRequired(ValidationChallenge),
    Issued(IssuedCertificates),
}

/// A browser's decision on a certificate request.
#[derive(Debug)]
pub enum Decision {
    Recorded { fingerprint: String },
    /// Approval waits for one of the user's hardware keys.
    SecondaryRequired(ValidationChallenge),
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct AssociationGrant {
    pub token: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

/// A pending association as shown to the browser that created it.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct AssociationInfo {
    pub username: String,
    pub public_key: String,
    pub expires_at: DateTime<Utc>,
}

/// Another validation advanced the factor between our read and write.
fn lost_counter_race(previous: &Factor, updated: &Factor) -> AuthError {
    match (previous, updated) {
        (
            Factor::HardwareKey { counter: stored, .. },
            Factor::HardwareKey {
                counter: presented, ..
            },
        ) => AuthError::SignatureInvalid(VerifyError::CounterRegression {
            stored: *stored,
            presented: *presented,
        }),
        _ => AuthError::FactorNotFound,
    }
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, AuthError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| AuthError::internal("challenge ttl out of range"))
}

fn default_name(kind: FactorKind, factor: &Factor) -> String {
    match factor {
        Factor::LinkedAccount { username, .. } => format!("linked:{username}"),
        Factor::SshKey { fingerprint, .. } => fingerprint.clone(),
        Factor::HardwareKey { .. } => kind.as_str().replace('_', " "),
    }
}

pub struct FactorEngine {
    settings: EngineSettings,
    authority: CertificateAuthority,
}

impl FactorEngine {
    #[must_use]
    pub const fn new(settings: EngineSettings, authority: CertificateAuthority) -> Self {
        Self {
            settings,
            authority,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub const fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }

    fn new_challenge(
        &self,
        purpose: Purpose,
        user_id: Option<Uuid>,
        session_id: Option<Uuid>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ChallengeRecord, AuthError> {
        let approval = match &purpose {
            Purpose::Certificate {
                linked_factor: None,
                ..
            } => Some(Approval::Pending),
            Purpose::Certificate { .. } => Some(Approval::Approved),
            _ => None,
        };
        Ok(ChallengeRecord {
            id: Uuid::new_v4(),
            nonce: challenge::generate_nonce().map_err(AuthError::internal)?,
            user_id,
            session_id,
            purpose,
            approval,
            host: None,
            created_at: now,
            expires_at: deadline(now, ttl)?,
            consumed_at: None,
        })
    }

    fn message(&self, record: &ChallengeRecord) -> String {
        challenge::message(&self.settings.app_id, &record.nonce)
    }

    fn validation_challenge(
        &self,
        record: ChallengeRecord,
        kind: FactorKind,
        factors: &[FactorRecord],
    ) -> ValidationChallenge {
        ValidationChallenge {
            challenge_id: record.id,
            kind,
            app_id: self.settings.app_id.clone(),
            message: self.message(&record),
            nonce: record.nonce,
            hints: factors
                .iter()
                .map(|record| record.factor.issue_challenge())
                .collect(),
            expires_at: record.expires_at,
        }
    }

    async fn hardware_keys(
        store: &dyn Store,
        user_id: Uuid,
    ) -> Result<Vec<FactorRecord>, AuthError> {
        Ok(store
            .list_factors(user_id)
            .await?
            .into_iter()
            .filter(|record| record.kind() == FactorKind::HardwareKey)
            .collect())
    }

    /// Find the factor among `factor_ids` that answers `response`, verify the
    /// answer and store the factor's advanced state.
    async fn verify_answer(
        &self,
        store: &dyn Store,
        user_id: Uuid,
        factor_ids: &[Uuid],
        nonce: &str,
        response: &FactorResponse,
        now: DateTime<Utc>,
    ) -> Result<FactorRecord, AuthError> {
        let mut matched = None;
        for id in factor_ids {
            if let Some(candidate) = store.get_factor(*id).await?
                && candidate.user_id == user_id
                && candidate.factor.answers(response)
            {
                matched = Some(candidate);
                break;
            }
        }
        let Some(factor_record) = matched else {
            return Err(AuthError::FactorNotFound);
        };

        let updated = factor_record
            .factor
            .verify_response(&self.settings.app_id, nonce, response)?;
        if !store
            .touch_factor(factor_record.id, &factor_record.factor, &updated, now)
            .await?
        {
            return Err(lost_counter_race(&factor_record.factor, &updated));
        }
        Ok(factor_record)
    }

    /// Look up, check ownership and purpose, then atomically consume.
    async fn redeem(
        &self,
        store: &dyn Store,
        id: Uuid,
        session_id: Option<Uuid>,
        purpose: &'static str,
        now: DateTime<Utc>,
    ) -> Result<ChallengeRecord, AuthError> {
        let Some(found) = store.get_challenge(id).await? else {
            return Err(AuthError::FactorNotFound);
        };
        if found.purpose.as_str() != purpose {
            return Err(AuthError::FactorNotFound);
        }
        if let Some(session_id) = session_id
            && found.session_id != Some(session_id)
        {
            return Err(AuthError::FactorNotFound);
        }

        let record = match store.consume_challenge(id, now).await? {
            Consumption::Taken(record) => record,
            Consumption::AlreadyConsumed => return Err(AuthError::ChallengeConsumed),
            Consumption::Missing => return Err(AuthError::FactorNotFound),
        };
        if record.is_expired(now) {
            return Err(AuthError::ChallengeExpired);
        }
        Ok(record)
    }

    /// Start enrolling a hardware key for a fully authenticated session.
    ///
    /// # Errors
    /// Returns [`AuthError`] on store failures.
    pub async fn begin_registration(
        &self,
        store: &dyn Store,
        session: &Session,
        label: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RegistrationChallenge, AuthError> {
        let kind = FactorKind::HardwareKey;
        let registered = store
            .list_factors(session.user_id)
            .await?
            .iter()
            .filter(|record| record.kind() == kind)
            .map(|record| record.factor.issue_challenge())
            .collect();
        let record = self.new_challenge(
            Purpose::Registration {
                kind,
                pending: None,
                label,
            },
            Some(session.user_id),
            Some(session.id),
            self.settings.challenge_ttl,
            now,
        )?;
        store.insert_challenge(&record).await?;
        debug!("Issued {kind} registration challenge {}", record.id);

        Ok(RegistrationChallenge {
            challenge_id: record.id,
            kind,
            app_id: self.settings.app_id.clone(),
            service_name: self.settings.service_name.clone(),
            message: self.message(&record),
            nonce: record.nonce,
            registered,
            expires_at: record.expires_at,
        })
    }

    /// Verify a registration response and persist the new factor.
    ///
    /// # Errors
    /// Challenge failures map to the `invalid_challenge` family; the challenge
    /// is spent whatever the outcome once it has been consumed.
    pub async fn finish_registration(
        &self,
        store: &dyn Store,
        session: &Session,
        challenge_id: Uuid,
        response: &RegistrationResponse,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FactorRecord, AuthError> {
        let record = self
            .redeem(store, challenge_id, Some(session.id), "registration", now)
            .await?;
        let Purpose::Registration {
            kind,
            pending,
            label,
        } = &record.purpose
        else {
            return Err(AuthError::FactorNotFound);
        };
        if record.user_id != Some(session.user_id) {
            return Err(AuthError::FactorNotFound);
        }

        let factor = match (kind, pending, response) {
            (
                FactorKind::HardwareKey,
                None,
                RegistrationResponse::HardwareKey {
                    key_handle,
                    public_key,
                    signature,
                },
            ) => hardware::verify_registration(
                &self.settings.app_id,
                &record.nonce,
                key_handle,
                public_key,
                signature,
            )?,
            (
                FactorKind::LinkedAccount,
                Some(pending @ Factor::LinkedAccount { public_key, .. }),
                RegistrationResponse::LinkedAccount { signature },
            ) => {
                linked::verify_signature(public_key, self.message(&record).as_bytes(), signature)?;
                pending.clone()
            }
            _ => return Err(VerifyError::KindMismatch.into()),
        };

        let factor_record = FactorRecord {
            id: Uuid::new_v4(),
            user_id: session.user_id,
            name: name
                .or_else(|| label.clone())
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| default_name(*kind, &factor)),
            factor,
            created_at: now,
            last_used_at: None,
        };
        store.insert_factor(&factor_record).await?;
        info!(
            target: "audit",
            user_id = %session.user_id,
            factor_id = %factor_record.id,
            kind = %kind,
            "factor registered"
        );
        Ok(factor_record)
    }

    /// Discard a pending registration. Expired challenges are discarded too.
    ///
    /// # Errors
    /// Returns [`AuthError::FactorNotFound`] for unknown or foreign challenges
    /// and [`AuthError::ChallengeConsumed`] if it was already answered.
    pub async fn reject_registration(
        &self,
        store: &dyn Store,
        session: &Session,
        challenge_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        match self
            .redeem(store, challenge_id, Some(session.id), "registration", now)
            .await
        {
            Ok(_) | Err(AuthError::ChallengeExpired) => {
                info!(target: "audit", user_id = %session.user_id, %challenge_id, "registration rejected");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Issue a validation challenge against the user's factors of `kind` and
    /// move the session to `secondary_pending`.
    ///
    /// # Errors
    /// [`AuthError::Forbidden`] if the session does not await a second factor,
    /// [`AuthError::FactorNotFound`] if the user has no factor of that kind.
    pub async fn begin_validation(
        &self,
        store: &dyn Store,
        session: &Session,
        kind: FactorKind,
        now: DateTime<Utc>,
    ) -> Result<ValidationChallenge, AuthError> {
        if !session.tier.awaits_secondary() {
            return Err(AuthError::Forbidden("secondary factor not pending"));
        }
        let factors: Vec<FactorRecord> = store
            .list_factors(session.user_id)
            .await?
            .into_iter()
            .filter(|record| record.kind() == kind)
            .collect();
        if factors.is_empty() {
            return Err(AuthError::FactorNotFound);
        }

        let record = self.new_challenge(
            Purpose::Validation {
                factor_ids: factors.iter().map(|record| record.id).collect(),
            },
            Some(session.user_id),
            Some(session.id),
            self.settings.challenge_ttl,
            now,
        )?;
        store.insert_challenge(&record).await?;
        if session.tier == Tier::Primary {
            store
                .update_session_tier(session.id, Tier::Primary, Tier::SecondaryPending)
                .await?;
        }
        debug!("Issued {kind} validation challenge {}", record.id);

        Ok(self.validation_challenge(record, kind, &factors))
    }

    /// Verify a validation response and promote the session exactly once.
    ///
    /// # Errors
    /// Challenge failures leave the session tier unchanged.
    pub async fn finish_validation(
        &self,
        store: &dyn Store,
        session: &Session,
        challenge_id: Uuid,
        response: &FactorResponse,
        now: DateTime<Utc>,
    ) -> Result<Tier, AuthError> {
        // A replayed challenge fails as consumed whatever the tier.
        let record = self
            .redeem(store, challenge_id, Some(session.id), "validation", now)
            .await?;
        if !session.tier.awaits_secondary() {
            return Err(AuthError::Forbidden("secondary factor not pending"));
        }
        let Purpose::Validation { factor_ids } = &record.purpose else {
            return Err(AuthError::FactorNotFound);
        };
        let factor_record = self
            .verify_answer(store, session.user_id, factor_ids, &record.nonce, response, now)
            .await?;

        let promoted = store
            .update_session_tier(session.id, Tier::SecondaryPending, Tier::FullyAuthenticated)
            .await?
            || store
                .update_session_tier(session.id, Tier::Primary, Tier::FullyAuthenticated)
                .await?;
        if !promoted {
            return Err(AuthError::ChallengeConsumed);
        }
        info!(
            target: "audit",
            user_id = %session.user_id,
            factor_id = %factor_record.id,
            kind = %factor_record.kind(),
            "secondary factor verified"
        );
        Ok(Tier::FullyAuthenticated)
    }

    /// Open an SSH certificate request that a logged-in user must approve.
    ///
    /// # Errors
    /// [`AuthError::InputMalformed`] for an unparsable key.
    pub async fn request_certificate(
        &self,
        store: &dyn Store,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateRequest, AuthError> {
        let key = ssh::parse_public_key(public_key)
            .map_err(|err| AuthError::InputMalformed(err.to_string()))?;
        let openssh = key.to_openssh().map_err(AuthError::internal)?;
        let record = self.new_challenge(
            Purpose::Certificate {
                public_key: openssh,
                linked_factor: None,
            },
            None,
            None,
            self.settings.certificate_request_ttl,
            now,
        )?;
        store.insert_challenge(&record).await?;
        info!(target: "audit", token = %record.id, fingerprint = %ssh::fingerprint(&key), "certificate requested");

        Ok(CertificateRequest {
            token: record.id,
            message: self.message(&record),
            nonce: record.nonce,
            fingerprint: ssh::fingerprint(&key),
            expires_at: record.expires_at,
        })
    }

    /// Open an SSH certificate request proven by a linked account instead of
    /// a browser approval.
    ///
    /// # Errors
    /// [`AuthError::FactorNotFound`] if `username` is not linked.
    pub async fn request_linked_certificate(
        &self,
        store: &dyn Store,
        username: &str,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateRequest, AuthError> {
        let username = linked::normalize_username(username);
        let key = ssh::parse_public_key(public_key)
            .map_err(|err| AuthError::InputMalformed(err.to_string()))?;
        let Some(factor) = store.find_linked_factor(&username).await? else {
            return Err(AuthError::FactorNotFound);
        };
        let record = self.new_challenge(
            Purpose::Certificate {
                public_key: key.to_openssh().map_err(AuthError::internal)?,
                linked_factor: Some(factor.id),
            },
            Some(factor.user_id),
            None,
            self.settings.challenge_ttl,
            now,
        )?;
        store.insert_challenge(&record).await?;

        Ok(CertificateRequest {
            token: record.id,
            message: self.message(&record),
            nonce: record.nonce,
            fingerprint: ssh::fingerprint(&key),
            expires_at: record.expires_at,
        })
    }

    async fn pending_certificate(
        store: &dyn Store,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ChallengeRecord, AuthError> {
        let Some(record) = store.get_challenge(token).await? else {
            return Err(AuthError::FactorNotFound);
        };
        if !matches!(record.purpose, Purpose::Certificate { .. }) {
            return Err(AuthError::FactorNotFound);
        }
        if record.consumed_at.is_some() {
            return Err(AuthError::ChallengeConsumed);
        }
        if record.is_expired(now) {
            return Err(AuthError::ChallengeExpired);
        }
        Ok(record)
    }

    /// Approve or deny a pending certificate request on behalf of `user`.
    /// Users with hardware keys get a challenge to sign before an approval
    /// counts; denial always applies at once.
    ///
    /// # Errors
    /// Challenge failures if the request is unknown, decided, or expired.
    pub async fn approve_certificate(
        &self,
        store: &dyn Store,
        session: &Session,
        user: &User,
        token: Uuid,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<Decision, AuthError> {
        let record = Self::pending_certificate(store, token, now).await?;
        if approve {
            let keys = Self::hardware_keys(store, user.id).await?;
            if !keys.is_empty() {
                let step_up = self.new_challenge(
                    Purpose::ApprovalStepUp {
                        certificate: token,
                        factor_ids: keys.iter().map(|record| record.id).collect(),
                    },
                    Some(user.id),
                    Some(session.id),
                    self.settings.challenge_ttl,
                    now,
                )?;
                store.insert_challenge(&step_up).await?;
                debug!("Certificate request {token} awaits hardware key confirmation");
                return Ok(Decision::SecondaryRequired(self.validation_challenge(
                    step_up,
                    FactorKind::HardwareKey,
                    &keys,
                )));
            }
        }
        let fingerprint = Self::record_decision(store, user, &record, approve, now).await?;
        Ok(Decision::Recorded { fingerprint })
    }

    /// Answer the hardware key challenge from [`Self::approve_certificate`]
    /// and approve the request it guards.
    ///
    /// # Errors
    /// Challenge failures for the step-up challenge or the request itself.
    pub async fn finish_approval_step_up(
        &self,
        store: &dyn Store,
        session: &Session,
        user: &User,
        challenge_id: Uuid,
        response: &FactorResponse,
        now: DateTime<Utc>,
    ) -> Result<(Uuid, String), AuthError> {
        let record = self
            .redeem(store, challenge_id, Some(session.id), "approval_step_up", now)
            .await?;
        let Purpose::ApprovalStepUp {
            certificate,
            factor_ids,
        } = &record.purpose
        else {
            return Err(AuthError::FactorNotFound);
        };
        self.verify_answer(store, user.id, factor_ids, &record.nonce, response, now)
            .await?;
        let request = Self::pending_certificate(store, *certificate, now).await?;
        let fingerprint = Self::record_decision(store, user, &request, true, now).await?;
        Ok((*certificate, fingerprint))
    }

    /// Record the decision. Approval also registers the key as an SSH factor
    /// for the user.
    async fn record_decision(
        store: &dyn Store,
        user: &User,
        record: &ChallengeRecord,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let token = record.id;
        let Purpose::Certificate { public_key, .. } = &record.purpose else {
            return Err(AuthError::FactorNotFound);
        };
        let key = ssh::parse_public_key(public_key)?;
        let fingerprint = ssh::fingerprint(&key);

        let decision = if approve {
            Approval::Approved
        } else {
            Approval::Denied
        };
        if !store.set_approval(token, user.id, decision).await? {
            return Err(AuthError::ChallengeConsumed);
        }
        info!(
            target: "audit",
            user_id = %user.id,
            %token,
            %fingerprint,
            decision = decision.as_str(),
            "certificate request decided"
        );

        if !approve {
            store.consume_challenge(token, now).await?;
            return Ok(fingerprint);
        }

        let known = store.list_factors(user.id).await?.into_iter().any(|record| {
            matches!(&record.factor, Factor::SshKey { fingerprint: existing, .. } if *existing == fingerprint)
        });
        if !known {
            let factor = Factor::SshKey {
                public_key: public_key.clone(),
                fingerprint: fingerprint.clone(),
            };
            store
                .insert_factor(&FactorRecord {
                    id: Uuid::new_v4(),
                    user_id: user.id,
                    name: default_name(FactorKind::SshKey, &factor),
                    factor,
                    created_at: now,
                    last_used_at: None,
                })
                .await?;
        }
        Ok(fingerprint)
    }

    /// Attach a host key and hostnames to an open certificate request.
    ///
    /// # Errors
    /// [`AuthError::InputMalformed`] for a bad key or hostname list.
    pub async fn bind_host(
        &self,
        store: &dyn Store,
        token: Uuid,
        host_key: &str,
        hostnames: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let key = ssh::parse_public_key(host_key)
            .map_err(|err| AuthError::InputMalformed(err.to_string()))?;
        let hostnames: Vec<String> = hostnames
            .iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        if hostnames.is_empty() || !hostnames.iter().all(|name| valid_hostname(name)) {
            return Err(AuthError::InputMalformed(
                "hostnames must be non-empty DNS names or addresses".to_string(),
            ));
        }

        Self::pending_certificate(store, token, now).await?;
        let binding = HostBinding {
            public_key: key.to_openssh().map_err(AuthError::internal)?,
            hostnames,
        };
        if !store.bind_host(token, &binding).await? {
            return Err(AuthError::ChallengeConsumed);
        }
        debug!("Bound host key to certificate request {token}");
        Ok(())
    }

    /// Redeem a certificate request with a signature over its message.
    ///
    /// # Errors
    /// Challenge failures for unknown, spent, expired, or badly signed requests.
    pub async fn redeem_certificate(
        &self,
        store: &dyn Store,
        token: Uuid,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateOutcome, AuthError> {
        if let Some(found) = store.get_challenge(token).await?
            && found.consumed_at.is_none()
            && found.approval == Some(Approval::Pending)
            && !found.is_expired(now)
        {
            return Ok(CertificateOutcome::Pending);
        }

        let record = self.redeem(store, token, None, "certificate", now).await?;
        let Purpose::Certificate {
            public_key,
            linked_factor,
        } = &record.purpose
        else {
            return Err(AuthError::FactorNotFound);
        };
        if record.approval != Some(Approval::Approved) {
            return Err(AuthError::ChallengeConsumed);
        }
        let Some(user_id) = record.user_id else {
            return Err(AuthError::FactorNotFound);
        };
        let Some(user) = store.get_user(user_id).await? else {
            return Err(AuthError::FactorNotFound);
        };

        let message = self.message(&record);
        if let Some(factor_id) = linked_factor {
            let Some(factor_record) = store.get_factor(*factor_id).await? else {
                return Err(AuthError::FactorNotFound);
            };
            let Factor::LinkedAccount {
                public_key: linked_key,
                ..
            } = &factor_record.factor
            else {
                return Err(AuthError::FactorNotFound);
            };
            linked::verify_signature(linked_key, message.as_bytes(), signature)?;
            store
                .touch_factor(
                    factor_record.id,
                    &factor_record.factor,
                    &factor_record.factor,
                    now,
                )
                .await?;

            let keys = Self::hardware_keys(store, user.id).await?;
            if !keys.is_empty() {
                let step_up = self.new_challenge(
                    Purpose::IssuanceStepUp {
                        public_key: public_key.clone(),
                        host: record.host.clone(),
                        factor_ids: keys.iter().map(|record| record.id).collect(),
                    },
                    Some(user.id),
                    None,
                    self.settings.challenge_ttl,
                    now,
                )?;
                store.insert_challenge(&step_up).await?;
                debug!("Linked certificate request {token} awaits hardware key confirmation");
                return Ok(CertificateOutcome::SecondaryRequired(
                    self.validation_challenge(step_up, FactorKind::HardwareKey, &keys),
                ));
            }
        } else {
            ssh::verify_signature(public_key, &message, signature)?;
        }

        let issued = self.issue(user, public_key, record.host.as_ref(), token, now)?;
        Ok(CertificateOutcome::Issued(issued))
    }

    /// Answer the hardware key challenge a linked certificate request ran
    /// into and issue the certificates.
    ///
    /// # Errors
    /// Challenge failures for unknown, spent, expired or badly signed answers.
    pub async fn finish_issuance_step_up(
        &self,
        store: &dyn Store,
        challenge_id: Uuid,
        response: &FactorResponse,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificates, AuthError> {
        let record = self
            .redeem(store, challenge_id, None, "issuance_step_up", now)
            .await?;
        let Purpose::IssuanceStepUp {
            public_key,
            host,
            factor_ids,
        } = &record.purpose
        else {
            return Err(AuthError::FactorNotFound);
        };
        let Some(user_id) = record.user_id else {
            return Err(AuthError::FactorNotFound);
        };
        let Some(user) = store.get_user(user_id).await? else {
            return Err(AuthError::FactorNotFound);
        };
        self.verify_answer(store, user.id, factor_ids, &record.nonce, response, now)
            .await?;
        self.issue(user, public_key, host.as_ref(), record.id, now)
    }

    fn issue(
        &self,
        user: User,
        public_key: &str,
        host: Option<&HostBinding>,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificates, AuthError> {
        let subject = ssh::parse_public_key(public_key)?;
        let key_id = format!("{}@{}", user.username, self.settings.service_name);
        let certificate = self
            .authority
            .issue_user(&subject, &user.username, &key_id, now)
            .map_err(AuthError::internal)?;
        let host_certificate = match host {
            Some(host) => {
                let host_key = ssh::parse_public_key(&host.public_key)?;
                Some(
                    self.authority
                        .issue_host(&host_key, &host.hostnames, now)
                        .map_err(AuthError::internal)?,
                )
            }
            None => None,
        };
        info!(
            target: "audit",
            user_id = %user.id,
            %token,
            host = host_certificate.is_some(),
            "certificate issued"
        );

        Ok(IssuedCertificates {
            principal: user.username,
            certificate,
            host_certificate,
        })
    }

    /// Create a single-use token that lets an external tool enroll
    /// `username` as a linked account for the session's user.
    ///
    /// # Errors
    /// [`AuthError::InputMalformed`] for a bad username or key, or when the
    /// account is already linked.
    pub async fn associate(
        &self,
        store: &dyn Store,
        session: &Session,
        username: &str,
        public_key: &str,
        now: DateTime<Utc>,
    ) -> Result<AssociationGrant, AuthError> {
        let username = linked::normalize_username(username);
        if !linked::valid_username(&username) {
            return Err(AuthError::InputMalformed("invalid username".to_string()));
        }
        linked::parse_public_key(public_key)
            .map_err(|err| AuthError::InputMalformed(err.to_string()))?;
        if store.find_linked_factor(&username).await?.is_some() {
            return Err(AuthError::InputMalformed(format!(
                "{username} is already linked"
            )));
        }

        let token = challenge::generate_nonce().map_err(AuthError::internal)?;
        let association = AssociationToken {
            token_hash: hash_token(&token),
            user_id: session.user_id,
            session_id: session.id,
            username: username.clone(),
            public_key: public_key.trim().to_string(),
            created_at: now,
            expires_at: deadline(now, self.settings.association_ttl)?,
        };
        store.insert_association(&association).await?;
        info!(target: "audit", user_id = %session.user_id, %username, "association token issued");

        Ok(AssociationGrant {
            token,
            username,
            expires_at: association.expires_at,
        })
    }

    /// Trade an association token for a registration challenge. The token is
    /// destroyed whether or not it is still valid.
    ///
    /// # Errors
    /// [`AuthError::FactorNotFound`] for unknown tokens,
    /// [`AuthError::ChallengeExpired`] for stale ones.
    pub async fn redeem_association(
        &self,
        store: &dyn Store,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RegistrationChallenge, AuthError> {
        let Some(association) = store.take_association(&hash_token(token)).await? else {
            return Err(AuthError::FactorNotFound);
        };
        if now >= association.expires_at {
            return Err(AuthError::ChallengeExpired);
        }

        let kind = FactorKind::LinkedAccount;
        let pending = Factor::LinkedAccount {
            username: association.username.clone(),
            public_key: association.public_key.clone(),
        };
        let registered = store
            .list_factors(association.user_id)
            .await?
            .iter()
            .filter(|record| record.kind() == kind)
            .map(|record| record.factor.issue_challenge())
            .collect();
        let record = self.new_challenge(
            Purpose::Registration {
                kind,
                pending: Some(pending),
                label: None,
            },
            Some(association.user_id),
            Some(association.session_id),
            self.settings.challenge_ttl,
            now,
        )?;
        store.insert_challenge(&record).await?;

        Ok(RegistrationChallenge {
            challenge_id: record.id,
            kind,
            app_id: self.settings.app_id.clone(),
            service_name: self.settings.service_name.clone(),
            message: self.message(&record),
            nonce: record.nonce,
            registered,
            expires_at: record.expires_at,
        })
    }

    /// Show a pending association to the user that created it without
    /// spending the token.
    ///
    /// # Errors
    /// [`AuthError::FactorNotFound`] for unknown or foreign tokens,
    /// [`AuthError::ChallengeExpired`] for stale ones.
    pub async fn association_info(
        &self,
        store: &dyn Store,
        session: &Session,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AssociationInfo, AuthError> {
        let Some(association) = store.find_association(&hash_token(token)).await? else {
            return Err(AuthError::FactorNotFound);
        };
        if association.user_id != session.user_id {
            return Err(AuthError::FactorNotFound);
        }
        if now >= association.expires_at {
            return Err(AuthError::ChallengeExpired);
        }
        Ok(AssociationInfo {
            username: association.username,
            public_key: association.public_key,
            expires_at: association.expires_at,
        })
    }

    /// Whether an external username is linked to some user.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn is_linked(&self, store: &dyn Store, username: &str) -> Result<bool, AuthError> {
        let username = linked::normalize_username(username);
        Ok(store.find_linked_factor(&username).await?.is_some())
    }
}

fn valid_hostname(name: &str) -> bool {
    name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '*'))
}
