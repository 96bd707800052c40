use serde::{Deserialize, Serialize};

use crate::models::account::PersistedAccount;

/// The persisted config document at `~/.kiro-proxy/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default = "default_scan_paths")]
    pub scan_paths: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<PersistedAccount>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            proxy: ProxyConfig::default(),
            governor: GovernorConfig::default(),
            scan_paths: default_scan_paths(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_deadline")]
    pub request_deadline_secs: u64,
    /// Global cap on concurrently in-flight upstream calls. 0 disables.
    #[serde(default)]
    pub max_inflight: u32,
    #[serde(default)]
    pub upstream_proxy: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            request_deadline_secs: default_deadline(),
            max_inflight: 0,
            upstream_proxy: None,
        }
    }
}

/// Long-context mitigation toggles. Only the on-error retry is on by default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default)]
    pub auto_truncate: bool,
    #[serde(default)]
    pub pre_estimate: bool,
    #[serde(default)]
    pub smart_summary: bool,
    #[serde(default = "default_true")]
    pub error_retry: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            auto_truncate: false,
            pre_estimate: false,
            smart_summary: false,
            error_retry: true,
        }
    }
}

fn default_schema_version() -> u32 {
    crate::constants::CONFIG_SCHEMA_VERSION
}

fn default_port() -> u16 {
    crate::constants::DEFAULT_PORT
}

fn default_host() -> String {
    crate::constants::DEFAULT_HOST.to_string()
}

fn default_deadline() -> u64 {
    crate::constants::DEFAULT_REQUEST_DEADLINE_SECS
}

fn default_true() -> bool {
    true
}

fn default_scan_paths() -> Vec<String> {
    vec!["~/.aws/sso/cache".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gets_full_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").expect("defaults");
        assert_eq!(cfg.proxy.port, 8080);
        assert_eq!(cfg.proxy.host, "127.0.0.1");
        assert_eq!(cfg.proxy.request_deadline_secs, 120);
        assert!(cfg.governor.error_retry);
        assert!(!cfg.governor.auto_truncate);
        assert!(cfg.accounts.is_empty());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"schema_version":2,"future_field":true}"#).expect("tolerant");
        assert_eq!(cfg.schema_version, 2);
    }
}
