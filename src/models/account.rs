use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    /// AWS IAM Identity Center device-code credentials.
    Idc,
    /// Kiro desktop social login (Google / GitHub).
    Social,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    AwsDeviceCode,
    SocialGoogle,
    SocialGithub,
    ScannedLocalCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Active,
    Cooldown,
    Unhealthy,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEnvelope {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
    pub auth_kind: AuthKind,
}

impl CredentialEnvelope {
    pub fn is_expiring_within(&self, now: i64, window_secs: i64) -> bool {
        self.expires_at - now <= window_secs
    }
}

/// One upstream credential pair plus its derived runtime state.
///
/// Fields after `client_secret` are volatile and never persisted.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub label: String,
    pub provenance: Provenance,
    pub credentials: CredentialEnvelope,
    pub enabled: bool,
    pub region: String,
    pub profile_arn: Option<String>,
    // Device-code refresh inputs; absent for social accounts.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,

    pub health: HealthState,
    pub cooldown_until: Option<i64>,
    pub unhealthy_reason: Option<String>,
    pub last_used_at: i64,
    pub request_count: u64,
    pub error_count: u64,
    pub in_flight: u32,
}

impl Account {
    pub fn new(
        label: String,
        provenance: Provenance,
        credentials: CredentialEnvelope,
        region: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label,
            provenance,
            credentials,
            enabled: true,
            region,
            profile_arn: None,
            client_id: None,
            client_secret: None,
            health: HealthState::Active,
            cooldown_until: None,
            unhealthy_reason: None,
            last_used_at: 0,
            request_count: 0,
            error_count: 0,
            in_flight: 0,
        }
    }

    /// Health with lazy cooldown expiry: a cooled-down account whose deadline
    /// has passed reads as active again without a separate sweep.
    pub fn effective_health(&self, now: i64) -> HealthState {
        match self.health {
            HealthState::Cooldown => match self.cooldown_until {
                Some(until) if now < until => HealthState::Cooldown,
                _ => HealthState::Active,
            },
            other => other,
        }
    }

    pub fn is_selectable(&self, now: i64) -> bool {
        self.enabled && self.effective_health(now) == HealthState::Active
    }

    /// Logical identity used to merge duplicate adds: the refresh token is
    /// stable across access-token rotations, so two envelopes sharing one
    /// describe the same upstream credential lineage.
    pub fn logical_identity(&self) -> (AuthKind, String) {
        let anchor = self
            .credentials
            .refresh_token
            .clone()
            .unwrap_or_else(|| self.credentials.access_token.clone());
        (self.credentials.auth_kind, anchor)
    }

    pub fn to_persisted(&self) -> PersistedAccount {
        PersistedAccount {
            id: self.id.clone(),
            label: self.label.clone(),
            provenance: self.provenance,
            credentials: self.credentials.clone(),
            enabled: self.enabled,
            region: self.region.clone(),
            profile_arn: self.profile_arn.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }

    pub fn from_persisted(p: PersistedAccount) -> Self {
        Self {
            id: p.id,
            label: p.label,
            provenance: p.provenance,
            credentials: p.credentials,
            enabled: p.enabled,
            region: p.region,
            profile_arn: p.profile_arn,
            client_id: p.client_id,
            client_secret: p.client_secret,
            health: HealthState::Active,
            cooldown_until: None,
            unhealthy_reason: None,
            last_used_at: 0,
            request_count: 0,
            error_count: 0,
            in_flight: 0,
        }
    }
}

/// The subset of an account that survives restarts. Health, cooldown,
/// in-flight and usage counters are intentionally absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedAccount {
    pub id: String,
    pub label: String,
    pub provenance: Provenance,
    pub credentials: CredentialEnvelope,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_region() -> String {
    crate::constants::DEFAULT_REGION.to_string()
}

/// Quota figures harvested from upstream response headers, when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub remaining: i64,
    pub reset_at: Option<String>,
    pub observed_at: i64,
}
