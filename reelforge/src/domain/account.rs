//! Provider accounts and their leases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, JobId};

/// Session/token validity of an account.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Never logged in.
    #[default]
    Pending,
    Valid,
    Expired,
}

/// Mutual-exclusion hold on an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLease {
    pub holder: JobId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccountLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Input for registering an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub platform: String,
    pub label: String,
    pub auth_ref: String,
    pub credits: Option<i64>,
}

impl NewAccount {
    pub fn new(
        platform: impl Into<String>,
        label: impl Into<String>,
        auth_ref: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            label: label.into(),
            auth_ref: auth_ref.into(),
            credits: None,
        }
    }

    pub fn with_credits(mut self, credits: i64) -> Self {
        self.credits = Some(credits);
        self
    }
}

/// A credential/session bound to a provider platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub platform: String,
    pub label: String,
    /// Reference to where the secret lives, never the secret itself.
    pub auth_ref: String,
    pub token_status: TokenStatus,
    /// `None` means unknown, which counts as available.
    pub credits: Option<i64>,
    pub credits_reset_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub lease: Option<AccountLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn from_new(id: AccountId, new: NewAccount, now: DateTime<Utc>) -> Self {
        Self {
            id,
            platform: new.platform,
            label: new.label,
            auth_ref: new.auth_ref,
            token_status: TokenStatus::Pending,
            credits: new.credits,
            credits_reset_at: None,
            last_used: None,
            lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unknown credit balances are treated as available.
    pub fn has_credits(&self) -> bool {
        self.credits.is_none_or(|c| c > 0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.credits.is_some_and(|c| c <= 0)
    }

    pub fn lease_is_free(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_none_or(|l| l.is_expired(now))
    }

    pub fn is_leased_by(&self, job_id: JobId, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.holder == job_id && !l.is_expired(now))
    }

    /// Availability predicate used by the allocation policy.
    pub fn is_available_for(
        &self,
        platform: &str,
        exclude: &[AccountId],
        now: DateTime<Utc>,
    ) -> bool {
        self.platform == platform
            && self.has_credits()
            && !exclude.contains(&self.id)
            && self.lease_is_free(now)
    }

    pub fn needs_login(&self) -> bool {
        self.token_status != TokenStatus::Valid
    }
}
