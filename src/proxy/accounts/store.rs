use std::sync::Arc;

use dashmap::DashMap;

use crate::models::account::{
    Account, CredentialEnvelope, HealthState, PersistedAccount, QuotaSnapshot,
};

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The single owner of account state. Mutations are atomic per entry; the
/// selector serializes its pick-and-mark step on top of this. Persisted-field
/// mutations schedule an async flush to the config document; a failed flush
/// keeps the in-memory change and surfaces through `last_persist_error`.
pub struct CredentialStore {
    accounts: DashMap<String, Account>,
    quotas: DashMap<String, QuotaSnapshot>,
    last_persist_error: parking_lot::Mutex<Option<String>>,
    persistence_enabled: bool,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            quotas: DashMap::new(),
            last_persist_error: parking_lot::Mutex::new(None),
            persistence_enabled: true,
        }
    }

    /// A store that never writes the config document. Used by tests.
    pub fn ephemeral() -> Self {
        Self {
            persistence_enabled: false,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn list(&self) -> Vec<Account> {
        let mut out: Vec<Account> = self.accounts.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.label.cmp(&b.label).then(a.id.cmp(&b.id)));
        out
    }

    pub fn get(&self, id: &str) -> Option<Account> {
        self.accounts.get(id).map(|e| e.value().clone())
    }

    /// Add an account, merging into an existing one when the logical
    /// identity (auth kind + refresh lineage) already exists. Returns the id
    /// that ended up holding the credentials.
    pub fn add(self: &Arc<Self>, account: Account) -> String {
        let identity = account.logical_identity();
        let existing = self
            .accounts
            .iter()
            .find(|e| e.value().logical_identity() == identity)
            .map(|e| e.key().clone());

        let id = match existing {
            Some(id) => {
                if let Some(mut entry) = self.accounts.get_mut(&id) {
                    let merged = entry.value_mut();
                    apply_credentials(merged, account.credentials);
                    if merged.profile_arn.is_none() {
                        merged.profile_arn = account.profile_arn;
                    }
                    if merged.client_id.is_none() {
                        merged.client_id = account.client_id;
                        merged.client_secret = account.client_secret;
                    }
                    tracing::info!("Merged duplicate account into {} ({})", merged.label, id);
                }
                id
            }
            None => {
                let id = account.id.clone();
                tracing::info!("Added account {} ({})", account.label, id);
                self.accounts.insert(id.clone(), account);
                id
            }
        };
        self.schedule_flush();
        id
    }

    pub fn remove(self: &Arc<Self>, id: &str) -> bool {
        let removed = self.accounts.remove(id).is_some();
        if removed {
            self.quotas.remove(id);
            self.schedule_flush();
        }
        removed
    }

    /// Swap in refreshed credentials. Expiry is clamped so a refresh can
    /// never move `expires_at` backwards within one credential lineage.
    pub fn update_credentials(self: &Arc<Self>, id: &str, envelope: CredentialEnvelope) -> bool {
        let updated = match self.accounts.get_mut(id) {
            Some(mut entry) => {
                apply_credentials(entry.value_mut(), envelope);
                true
            }
            None => false,
        };
        if updated {
            self.schedule_flush();
        }
        updated
    }

    pub fn set_profile_arn(self: &Arc<Self>, id: &str, arn: String) {
        let changed = match self.accounts.get_mut(id) {
            Some(mut entry) => {
                let acc = entry.value_mut();
                if acc.profile_arn.as_deref() != Some(arn.as_str()) {
                    acc.profile_arn = Some(arn);
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if changed {
            self.schedule_flush();
        }
    }

    pub fn set_enabled(self: &Arc<Self>, id: &str, enabled: bool) -> bool {
        let changed = match self.accounts.get_mut(id) {
            Some(mut entry) => {
                let acc = entry.value_mut();
                acc.enabled = enabled;
                if enabled {
                    if acc.health == HealthState::Disabled {
                        acc.health = HealthState::Active;
                    }
                } else {
                    acc.health = HealthState::Disabled;
                }
                true
            }
            None => false,
        };
        if changed {
            self.schedule_flush();
        }
        changed
    }

    pub fn mark_cooldown(&self, id: &str, duration_secs: i64) {
        if let Some(mut entry) = self.accounts.get_mut(id) {
            let acc = entry.value_mut();
            if acc.health != HealthState::Disabled {
                acc.health = HealthState::Cooldown;
                acc.cooldown_until = Some(now_ts() + duration_secs);
                acc.error_count += 1;
                tracing::warn!(
                    "Account {} rate limited, cooling down for {}s",
                    acc.label,
                    duration_secs
                );
            }
        }
    }

    pub fn mark_unhealthy(&self, id: &str, reason: &str) {
        if let Some(mut entry) = self.accounts.get_mut(id) {
            let acc = entry.value_mut();
            if acc.health != HealthState::Disabled {
                acc.health = HealthState::Unhealthy;
                acc.unhealthy_reason = Some(reason.to_string());
                acc.error_count += 1;
                tracing::warn!("Account {} marked unhealthy: {}", acc.label, reason);
            }
        }
    }

    pub fn mark_active(&self, id: &str) {
        if let Some(mut entry) = self.accounts.get_mut(id) {
            let acc = entry.value_mut();
            if acc.health != HealthState::Disabled {
                acc.health = HealthState::Active;
                acc.cooldown_until = None;
                acc.unhealthy_reason = None;
            }
        }
    }

    /// Selection bookkeeping: counts, recency and the in-flight gauge move
    /// together in one entry lock.
    pub fn begin_flight(&self, id: &str) -> bool {
        match self.accounts.get_mut(id) {
            Some(mut entry) => {
                let acc = entry.value_mut();
                acc.in_flight += 1;
                acc.last_used_at = now_ts();
                acc.request_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn end_flight(&self, id: &str) {
        if let Some(mut entry) = self.accounts.get_mut(id) {
            let acc = entry.value_mut();
            acc.in_flight = acc.in_flight.saturating_sub(1);
        }
    }

    pub fn record_error(&self, id: &str) {
        if let Some(mut entry) = self.accounts.get_mut(id) {
            entry.value_mut().error_count += 1;
        }
    }

    pub fn active_count(&self) -> usize {
        let now = now_ts();
        self.accounts
            .iter()
            .filter(|e| e.value().is_selectable(now))
            .count()
    }

    /// Remaining seconds until the earliest cooldown deadline, if any
    /// account is currently cooling down.
    pub fn earliest_cooldown_wait(&self) -> Option<i64> {
        let now = now_ts();
        self.accounts
            .iter()
            .filter_map(|e| {
                let acc = e.value();
                if acc.enabled && acc.effective_health(now) == HealthState::Cooldown {
                    acc.cooldown_until.map(|until| (until - now).max(0))
                } else {
                    None
                }
            })
            .min()
    }

    pub fn record_quota(&self, id: &str, snapshot: QuotaSnapshot) {
        self.quotas.insert(id.to_string(), snapshot);
    }

    pub fn quota(&self, id: &str) -> Option<QuotaSnapshot> {
        self.quotas.get(id).map(|e| e.value().clone())
    }

    pub fn export_snapshot(&self) -> Vec<PersistedAccount> {
        let mut out: Vec<PersistedAccount> =
            self.accounts.iter().map(|e| e.value().to_persisted()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Replace-or-merge from a persisted snapshot; returns how many accounts
    /// were imported.
    pub fn import_snapshot(self: &Arc<Self>, snapshot: Vec<PersistedAccount>) -> usize {
        let mut imported = 0;
        for persisted in snapshot {
            let account = Account::from_persisted(persisted);
            let identity = account.logical_identity();
            let existing = self
                .accounts
                .iter()
                .find(|e| e.value().logical_identity() == identity)
                .map(|e| e.key().clone());
            match existing {
                Some(id) => {
                    if let Some(mut entry) = self.accounts.get_mut(&id) {
                        apply_credentials(entry.value_mut(), account.credentials);
                    }
                }
                None => {
                    self.accounts.insert(account.id.clone(), account);
                }
            }
            imported += 1;
        }
        self.schedule_flush();
        imported
    }

    /// Load accounts at startup without triggering a write-back.
    pub fn load_initial(&self, snapshot: Vec<PersistedAccount>) {
        for persisted in snapshot {
            let account = Account::from_persisted(persisted);
            self.accounts.insert(account.id.clone(), account);
        }
    }

    pub fn last_persist_error(&self) -> Option<String> {
        self.last_persist_error.lock().clone()
    }

    /// Flush the persisted subset into the config document off the hot path.
    /// The in-memory state is authoritative; a failed write is only recorded.
    pub fn schedule_flush(self: &Arc<Self>) {
        if !self.persistence_enabled {
            return;
        }
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let snapshot = store.export_snapshot();
            let result = tokio::task::spawn_blocking(move || {
                let mut config = crate::modules::config::load_app_config()?;
                config.accounts = snapshot;
                crate::modules::config::save_app_config(&config)
            })
            .await;

            let mut last_error = store.last_persist_error.lock();
            match result {
                Ok(Ok(())) => *last_error = None,
                Ok(Err(e)) => {
                    tracing::error!("Account flush failed: {}", e);
                    *last_error = Some(e.to_string());
                }
                Err(e) => {
                    tracing::error!("Account flush task failed: {}", e);
                    *last_error = Some(e.to_string());
                }
            }
        });
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_credentials(account: &mut Account, envelope: CredentialEnvelope) {
    let floor = account.credentials.expires_at;
    let mut envelope = envelope;
    if envelope.refresh_token.is_none() {
        envelope.refresh_token = account.credentials.refresh_token.clone();
    }
    envelope.expires_at = envelope.expires_at.max(floor);
    account.credentials = envelope;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::{AuthKind, Provenance};

    fn envelope(token: &str, refresh: &str, expires_at: i64) -> CredentialEnvelope {
        CredentialEnvelope {
            access_token: token.into(),
            refresh_token: Some(refresh.into()),
            expires_at,
            auth_kind: AuthKind::Social,
        }
    }

    fn account(label: &str, refresh: &str) -> Account {
        Account::new(
            label.into(),
            Provenance::SocialGoogle,
            envelope("at", refresh, 1000),
            "us-east-1".into(),
        )
    }

    #[tokio::test]
    async fn duplicate_add_merges_instead_of_duplicating() {
        let store = Arc::new(CredentialStore::ephemeral());
        let first = store.add(account("one", "shared-rt"));
        let second = store.add(account("two", "shared-rt"));
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);

        let third = store.add(account("three", "other-rt"));
        assert_ne!(first, third);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn refresh_never_moves_expiry_backwards() {
        let store = Arc::new(CredentialStore::ephemeral());
        let id = store.add(account("a", "rt"));

        assert!(store.update_credentials(&id, envelope("new", "rt", 2000)));
        assert_eq!(store.get(&id).unwrap().credentials.expires_at, 2000);

        // A stale refresh response cannot regress the deadline.
        assert!(store.update_credentials(&id, envelope("newer", "rt", 1500)));
        let acc = store.get(&id).unwrap();
        assert_eq!(acc.credentials.expires_at, 2000);
        assert_eq!(acc.credentials.access_token, "newer");
    }

    #[tokio::test]
    async fn health_transitions() {
        let store = Arc::new(CredentialStore::ephemeral());
        let id = store.add(account("a", "rt"));

        store.mark_cooldown(&id, 300);
        assert_eq!(store.get(&id).unwrap().health, HealthState::Cooldown);
        assert_eq!(store.active_count(), 0);
        assert!(store.earliest_cooldown_wait().unwrap() <= 300);

        store.mark_active(&id);
        assert_eq!(store.get(&id).unwrap().health, HealthState::Active);

        store.mark_unhealthy(&id, "refresh failed");
        let acc = store.get(&id).unwrap();
        assert_eq!(acc.health, HealthState::Unhealthy);
        assert_eq!(acc.unhealthy_reason.as_deref(), Some("refresh failed"));

        // Operator disable wins over everything until re-enabled.
        store.set_enabled(&id, false);
        assert_eq!(store.get(&id).unwrap().health, HealthState::Disabled);
        store.mark_active(&id);
        assert_eq!(store.get(&id).unwrap().health, HealthState::Disabled);
        store.set_enabled(&id, true);
        assert_eq!(store.get(&id).unwrap().health, HealthState::Active);
    }

    #[tokio::test]
    async fn flight_bookkeeping_balances() {
        let store = Arc::new(CredentialStore::ephemeral());
        let id = store.add(account("a", "rt"));

        assert!(store.begin_flight(&id));
        assert!(store.begin_flight(&id));
        let acc = store.get(&id).unwrap();
        assert_eq!(acc.in_flight, 2);
        assert_eq!(acc.request_count, 2);
        assert!(acc.last_used_at > 0);

        store.end_flight(&id);
        store.end_flight(&id);
        store.end_flight(&id); // extra end never underflows
        assert_eq!(store.get(&id).unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let store = Arc::new(CredentialStore::ephemeral());
        store.add(account("a", "rt-a"));
        store.add(account("b", "rt-b"));

        let snapshot = store.export_snapshot();
        assert_eq!(snapshot.len(), 2);

        let other = Arc::new(CredentialStore::ephemeral());
        assert_eq!(other.import_snapshot(snapshot), 2);
        assert_eq!(other.len(), 2);

        // Importing the same snapshot again merges rather than duplicates.
        assert_eq!(other.import_snapshot(store.export_snapshot()), 2);
        assert_eq!(other.len(), 2);
    }
}
