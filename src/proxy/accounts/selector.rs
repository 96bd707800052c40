use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::proxy::accounts::store::CredentialStore;

/// What a handler needs to place one upstream call. A snapshot, not a live
/// reference; the store remains the single owner of account state.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub id: String,
    pub label: String,
    pub region: String,
    pub profile_arn: Option<String>,
    pub access_token: String,
}

#[derive(Debug, Clone)]
struct SessionBinding {
    account_id: String,
    last_seen: Instant,
}

/// Sticky-session-then-LRU account selection. The pick and its bookkeeping
/// (last-used, in-flight) run under one lock so two concurrent selections
/// cannot both observe the same "least recently used" account.
pub struct AccountSelector {
    store: Arc<CredentialStore>,
    sessions: DashMap<String, SessionBinding>,
    select_lock: parking_lot::Mutex<()>,
    session_ttl: Duration,
}

impl AccountSelector {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            select_lock: parking_lot::Mutex::new(()),
            session_ttl: Duration::from_secs(crate::constants::SESSION_IDLE_TTL_SECS),
        }
    }

    #[cfg(test)]
    pub fn with_session_ttl(store: Arc<CredentialStore>, ttl: Duration) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            select_lock: parking_lot::Mutex::new(()),
            session_ttl: ttl,
        }
    }

    pub fn select(
        &self,
        session_id: Option<&str>,
        excluded: &HashSet<String>,
    ) -> Option<SelectedAccount> {
        let _guard = self.select_lock.lock();
        let now = chrono::Utc::now().timestamp();

        // 1. Session stickiness: reuse the bound account while it stays
        // selectable and the binding is fresh. Any non-selectable transition
        // drops the binding so the next pick re-binds.
        if let Some(sid) = session_id {
            if let Some(binding) = self.sessions.get(sid).map(|e| e.value().clone()) {
                if binding.last_seen.elapsed() < self.session_ttl {
                    if let Some(account) = self.store.get(&binding.account_id) {
                        if account.is_selectable(now) && !excluded.contains(&account.id) {
                            self.sessions.insert(
                                sid.to_string(),
                                SessionBinding {
                                    account_id: account.id.clone(),
                                    last_seen: Instant::now(),
                                },
                            );
                            self.store.begin_flight(&account.id);
                            tracing::debug!(
                                "Sticky session {} reusing account {}",
                                sid,
                                account.label
                            );
                            return Some(snapshot_of(&account));
                        }
                    }
                    tracing::debug!(
                        "Sticky session {}: bound account no longer selectable, unbinding",
                        sid
                    );
                }
                self.sessions.remove(sid);
            }
        }

        // 2. Least-recently-used with in-flight tiebreak across the active
        // enabled pool minus the exclusions.
        let candidate = self
            .store
            .list()
            .into_iter()
            .filter(|a| a.is_selectable(now) && !excluded.contains(&a.id))
            .min_by_key(|a| (a.last_used_at, a.in_flight))?;

        self.store.begin_flight(&candidate.id);
        if let Some(sid) = session_id {
            self.sessions.insert(
                sid.to_string(),
                SessionBinding {
                    account_id: candidate.id.clone(),
                    last_seen: Instant::now(),
                },
            );
            tracing::debug!("Bound session {} to account {}", sid, candidate.label);
        }
        Some(snapshot_of(&candidate))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn clear_sessions(&self) {
        self.sessions.clear();
    }

    /// Drop bindings idle past the TTL. Runs on the 30 s sweep.
    pub fn prune_sessions(&self) -> usize {
        let ttl = self.session_ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, b| b.last_seen.elapsed() < ttl);
        let pruned = before - self.sessions.len();
        if pruned > 0 {
            tracing::debug!("Pruned {} expired session binding(s)", pruned);
        }
        pruned
    }
}

fn snapshot_of(account: &crate::models::account::Account) -> SelectedAccount {
    SelectedAccount {
        id: account.id.clone(),
        label: account.label.clone(),
        region: account.region.clone(),
        profile_arn: account.profile_arn.clone(),
        access_token: account.credentials.access_token.clone(),
    }
}
