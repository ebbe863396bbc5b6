use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamMemberStatus {
    Active,
    Invited,
    Removed,
}

impl TeamMemberStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Invited => "invited",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    /// The creating user. Never also present as a membership row.
    pub owner_id: i64,
    pub team_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMembership {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub role: Role,
    pub granted_by: i64,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMembership {
    pub project_id: i64,
    pub user_id: i64,
    pub role: Role,
    pub granted_by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredential {
    pub id: i64,
    pub owner_user_id: i64,
    pub name: String,
    #[serde(skip)]
    pub key_hash: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiCredential {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct NewApiCredential {
    pub owner_user_id: i64,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// An API credential joined with the user that owns it.
#[derive(Debug, Clone)]
pub struct CredentialOwner {
    pub credential: ApiCredential,
    pub user: User,
}

/// Second-factor state embedded in the user record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TwoFactorState {
    pub enabled: bool,
    /// Base32 TOTP secret; present while pending or enabled.
    pub secret: Option<String>,
    /// PHC-format hashes of unused backup codes.
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoFactorPhase {
    Disabled,
    PendingEnrollment,
    Enabled,
}

impl TwoFactorState {
    #[must_use]
    pub fn phase(&self) -> TwoFactorPhase {
        match (self.enabled, self.secret.is_some()) {
            (true, true) => TwoFactorPhase::Enabled,
            (false, true) => TwoFactorPhase::PendingEnrollment,
            _ => TwoFactorPhase::Disabled,
        }
    }
}
