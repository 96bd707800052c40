pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;

use tracing::{info, warn};

use crate::models::AppConfig;

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("KIRO_PROXY_PORT").or_else(|_| std::env::var("PORT")) {
        match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => {
                info!("Using port from environment: {}", p);
                config.proxy.port = p;
            }
            _ => warn!("Ignoring invalid port value: {}", port),
        }
    }

    if let Ok(host) = std::env::var("KIRO_PROXY_HOST") {
        if !host.trim().is_empty() {
            info!("Using bind host from environment: {}", host);
            config.proxy.host = host;
        }
    }

    if let Ok(deadline) = std::env::var("KIRO_PROXY_DEADLINE_SECS") {
        match deadline.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => config.proxy.request_deadline_secs = secs,
            _ => warn!("Ignoring invalid deadline value: {}", deadline),
        }
    }
}

/// Load config, build the application context and serve until shutdown.
/// Config-load and bind failures surface as errors so the binary can exit
/// non-zero.
pub async fn run() -> error::AppResult<()> {
    modules::logger::init_logger();

    let mut config = modules::config::load_app_config()?;
    apply_env_overrides(&mut config);

    info!(
        "Starting kiro-relay v{} ({} account(s) on record)",
        env!("CARGO_PKG_VERSION"),
        config.accounts.len()
    );
    if config.accounts.is_empty() {
        warn!("No accounts configured; add one via /api/accounts or /api/kiro/login");
    }

    let state = proxy::state::AppState::build(&config);
    proxy::serve(state, &config.proxy.host, config.proxy.port).await
}
