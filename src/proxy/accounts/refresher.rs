use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::models::account::{Account, AuthKind, CredentialEnvelope};
use crate::modules::auth;
use crate::proxy::accounts::store::CredentialStore;

/// Background token refresh. One sweep every five minutes plus on-demand
/// triggers; a per-account mutex coalesces whatever arrives concurrently.
pub struct TokenRefresher {
    store: Arc<CredentialStore>,
    http: reqwest::Client,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

pub fn is_due(account: &Account, now: i64) -> bool {
    account
        .credentials
        .is_expiring_within(now, crate::constants::REFRESH_BEFORE_EXPIRY_SECS)
}

impl TokenRefresher {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(20))
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()
            .expect("Failed to create refresh HTTP client");
        Self {
            store,
            http,
            locks: DashMap::new(),
        }
    }

    fn account_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Refresh one account. With `force` false the expiry window is
    /// re-checked after acquiring the lock, so concurrent triggers coalesce:
    /// whoever loses the race finds fresh credentials and returns early.
    pub async fn refresh_account(&self, id: &str, force: bool) -> AppResult<()> {
        let lock = self.account_lock(id);
        let _guard = lock.lock().await;

        let account = self
            .store
            .get(id)
            .ok_or_else(|| AppError::Account(format!("unknown account {}", id)))?;

        if !account.enabled {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        if !force && !is_due(&account, now) {
            return Ok(());
        }

        tracing::info!("Refreshing token for account {}", account.label);
        match self.call_refresh(&account).await {
            Ok(tokens) => {
                let expires_at = now + tokens.expires_in.unwrap_or(3600);
                let envelope = CredentialEnvelope {
                    access_token: tokens.access_token,
                    refresh_token: tokens
                        .refresh_token
                        .filter(|t| !t.is_empty())
                        .or(account.credentials.refresh_token),
                    expires_at,
                    auth_kind: account.credentials.auth_kind,
                };
                self.store.update_credentials(id, envelope);
                // The profile ARN can rotate alongside device-code tokens.
                if let Some(arn) = tokens.profile_arn.filter(|a| !a.is_empty()) {
                    self.store.set_profile_arn(id, arn);
                }
                self.store.mark_active(id);
                tracing::info!("Token refresh succeeded for {}", account.label);
                Ok(())
            }
            Err(e) => {
                self.store.mark_unhealthy(id, &e.to_string());
                Err(e)
            }
        }
    }

    async fn call_refresh(&self, account: &Account) -> AppResult<auth::RefreshedTokens> {
        let refresh_token = account
            .credentials
            .refresh_token
            .as_deref()
            .ok_or_else(|| AppError::Auth("account has no refresh token".to_string()))?;

        match account.credentials.auth_kind {
            AuthKind::Idc => {
                let client_id = account
                    .client_id
                    .as_deref()
                    .ok_or_else(|| AppError::Auth("device-code account missing clientId".into()))?;
                let client_secret = account.client_secret.as_deref().ok_or_else(|| {
                    AppError::Auth("device-code account missing clientSecret".into())
                })?;
                auth::refresh_device_code_token(
                    &self.http,
                    &account.region,
                    client_id,
                    client_secret,
                    refresh_token,
                )
                .await
            }
            AuthKind::Social => {
                auth::refresh_social_token(&self.http, &account.region, refresh_token).await
            }
        }
    }

    /// One pass over the pool. Individual failures are logged and never
    /// abort the sweep.
    pub async fn sweep(&self, force: bool) -> (usize, usize) {
        let now = chrono::Utc::now().timestamp();
        let due: Vec<String> = self
            .store
            .list()
            .into_iter()
            .filter(|a| a.enabled && (force || is_due(a, now)))
            .map(|a| a.id)
            .collect();

        if due.is_empty() {
            return (0, 0);
        }
        tracing::info!("Refresh sweep: {} account(s) due", due.len());

        let mut ok = 0;
        let mut failed = 0;
        for id in due {
            match self.refresh_account(&id, force).await {
                Ok(()) => ok += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Refresh failed for {}: {}", id, e);
                }
            }
        }
        (ok, failed)
    }

    /// Fire-and-forget per-account trigger used after auth failures.
    pub fn trigger(self: &Arc<Self>, id: &str) {
        let refresher = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = refresher.refresh_account(&id, true).await {
                tracing::warn!("Triggered refresh failed for {}: {}", id, e);
            }
        });
    }

    /// Long-lived 5-minute ticker, cancelled at shutdown.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(crate::constants::REFRESH_TICK_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick; the startup path already did a sweep.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Token refresher stopped");
                    return;
                }
                _ = interval.tick() => {
                    let (ok, failed) = self.sweep(false).await;
                    if ok + failed > 0 {
                        tracing::info!("Refresh sweep done: {} ok, {} failed", ok, failed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::Provenance;

    fn account_expiring_at(expires_at: i64) -> Account {
        Account::new(
            "a".into(),
            Provenance::SocialGoogle,
            CredentialEnvelope {
                access_token: "at".into(),
                refresh_token: Some("rt".into()),
                expires_at,
                auth_kind: AuthKind::Social,
            },
            "us-east-1".into(),
        )
    }

    #[test]
    fn due_inside_fifteen_minute_window() {
        let now = 10_000;
        assert!(is_due(&account_expiring_at(now), now));
        assert!(is_due(&account_expiring_at(now + 899), now));
        assert!(is_due(&account_expiring_at(now + 900), now));
        assert!(!is_due(&account_expiring_at(now + 901), now));
    }

    #[tokio::test]
    async fn refresh_of_disabled_account_is_a_no_op() {
        let store = Arc::new(CredentialStore::ephemeral());
        let id = store.add(account_expiring_at(0));
        store.set_enabled(&id, false);

        let refresher = TokenRefresher::new(store.clone());
        // Would hit the network if it tried; disabled accounts return early.
        refresher.refresh_account(&id, true).await.expect("no-op");
        assert_eq!(
            store.get(&id).unwrap().health,
            crate::models::account::HealthState::Disabled
        );
    }

    #[tokio::test]
    async fn sweep_skips_accounts_outside_the_window() {
        let store = Arc::new(CredentialStore::ephemeral());
        let far_future = chrono::Utc::now().timestamp() + 86_400;
        store.add(account_expiring_at(far_future));

        let refresher = TokenRefresher::new(store.clone());
        let (ok, failed) = refresher.sweep(false).await;
        assert_eq!((ok, failed), (0, 0));
    }
}
