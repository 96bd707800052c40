use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::models::config::GovernorConfig;
use crate::modules::auth::{DeviceFlowState, SocialAuthState};
use crate::proxy::accounts::{AccountSelector, CredentialStore, TokenRefresher};
use crate::proxy::mappers::governor::SummaryCache;
use crate::proxy::monitor::FlowMonitor;
use crate::proxy::upstream::UpstreamClient;

#[derive(Clone)]
pub struct CoreServices {
    pub store: Arc<CredentialStore>,
    pub selector: Arc<AccountSelector>,
    pub refresher: Arc<TokenRefresher>,
    pub upstream: Arc<UpstreamClient>,
    pub monitor: Arc<FlowMonitor>,
    pub summary_cache: Arc<SummaryCache>,
}

pub struct ConfigState {
    pub governor: RwLock<GovernorConfig>,
    pub scan_paths: RwLock<Vec<String>>,
    pub request_deadline_secs: u64,
    pub max_inflight: u32,
    pub port: u16,
}

pub struct RuntimeState {
    pub started_at: i64,
    pub cancel: CancellationToken,
    pub inflight: AtomicI64,
    // In-progress login flows; one of each kind at a time.
    pub device_flow: Mutex<Option<DeviceFlowState>>,
    pub social_flow: Mutex<Option<SocialAuthState>>,
    pub login_http: reqwest::Client,
}

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreServices>,
    pub config: Arc<ConfigState>,
    pub runtime: Arc<RuntimeState>,
}

impl AppState {
    pub fn build(app_config: &crate::models::AppConfig) -> Self {
        let store = Arc::new(CredentialStore::new());
        store.load_initial(app_config.accounts.clone());

        let selector = Arc::new(AccountSelector::new(store.clone()));
        let refresher = Arc::new(TokenRefresher::new(store.clone()));
        let upstream = Arc::new(UpstreamClient::new(
            app_config.proxy.upstream_proxy.as_deref(),
        ));
        let monitor = Arc::new(FlowMonitor::new(crate::constants::FLOW_RING_CAPACITY));

        let core = Arc::new(CoreServices {
            store,
            selector,
            refresher,
            upstream,
            monitor,
            summary_cache: Arc::new(SummaryCache::new()),
        });
        let config = Arc::new(ConfigState {
            governor: RwLock::new(app_config.governor),
            scan_paths: RwLock::new(app_config.scan_paths.clone()),
            request_deadline_secs: app_config.proxy.request_deadline_secs,
            max_inflight: app_config.proxy.max_inflight,
            port: app_config.proxy.port,
        });
        let runtime = Arc::new(RuntimeState {
            started_at: chrono::Utc::now().timestamp(),
            cancel: CancellationToken::new(),
            inflight: AtomicI64::new(0),
            device_flow: Mutex::new(None),
            social_flow: Mutex::new(None),
            login_http: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(20))
                .timeout(std::time::Duration::from_secs(30))
                .user_agent(crate::constants::USER_AGENT.as_str())
                .build()
                .expect("Failed to create login HTTP client"),
        });

        Self {
            core,
            config,
            runtime,
        }
    }

    #[cfg(test)]
    pub fn build_for_test(upstream: UpstreamClient) -> Self {
        let store = Arc::new(CredentialStore::ephemeral());
        let selector = Arc::new(AccountSelector::new(store.clone()));
        let refresher = Arc::new(TokenRefresher::new(store.clone()));
        let core = Arc::new(CoreServices {
            store,
            selector,
            refresher,
            upstream: Arc::new(upstream),
            monitor: Arc::new(FlowMonitor::new(64)),
            summary_cache: Arc::new(SummaryCache::new()),
        });
        let config = Arc::new(ConfigState {
            governor: RwLock::new(GovernorConfig::default()),
            scan_paths: RwLock::new(Vec::new()),
            request_deadline_secs: 10,
            max_inflight: 0,
            port: 0,
        });
        let runtime = Arc::new(RuntimeState {
            started_at: chrono::Utc::now().timestamp(),
            cancel: CancellationToken::new(),
            inflight: AtomicI64::new(0),
            device_flow: Mutex::new(None),
            social_flow: Mutex::new(None),
            login_http: reqwest::Client::new(),
        });
        Self {
            core,
            config,
            runtime,
        }
    }
}
