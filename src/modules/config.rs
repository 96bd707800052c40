use std::path::PathBuf;

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;

pub fn config_dir() -> AppResult<PathBuf> {
    if let Ok(dir) = std::env::var("KIRO_PROXY_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| AppError::Config("cannot resolve home directory".to_string()))?;
    Ok(home.join(crate::constants::CONFIG_DIR_NAME))
}

pub fn config_path() -> AppResult<PathBuf> {
    Ok(config_dir()?.join(crate::constants::CONFIG_FILE_NAME))
}

/// A missing document is not an error at first launch.
pub fn load_app_config() -> AppResult<AppConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|e| AppError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
    Ok(config)
}

/// Writes go through a temp file plus rename so a crash mid-write never
/// leaves a torn document behind.
pub fn save_app_config(config: &AppConfig) -> AppResult<()> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(crate::constants::CONFIG_FILE_NAME);
    let tmp = dir.join(format!("{}.tmp", crate::constants::CONFIG_FILE_NAME));

    let raw = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("failed to serialize config: {}", e)))?;
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::{AuthKind, CredentialEnvelope, PersistedAccount, Provenance};
    use std::sync::{Mutex, MutexGuard, OnceLock};

    // Environment variables are process-wide; serialize the tests that set
    // the config-dir override.
    static CONFIG_ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct ScopedConfigDir {
        _dir: tempfile::TempDir,
        _guard: MutexGuard<'static, ()>,
    }

    impl ScopedConfigDir {
        fn new() -> Self {
            let guard = CONFIG_ENV_LOCK
                .get_or_init(|| Mutex::new(()))
                .lock()
                .expect("config env lock");
            let dir = tempfile::tempdir().expect("tempdir");
            std::env::set_var("KIRO_PROXY_CONFIG_DIR", dir.path());
            Self {
                _dir: dir,
                _guard: guard,
            }
        }
    }

    impl Drop for ScopedConfigDir {
        fn drop(&mut self) {
            std::env::remove_var("KIRO_PROXY_CONFIG_DIR");
        }
    }

    #[test]
    fn missing_document_yields_defaults() {
        let _scope = ScopedConfigDir::new();
        let cfg = load_app_config().expect("load");
        assert!(cfg.accounts.is_empty());
        assert_eq!(cfg.proxy.port, 8080);
    }

    #[test]
    fn save_then_load_round_trips_accounts() {
        let _scope = ScopedConfigDir::new();

        let mut cfg = AppConfig::default();
        cfg.accounts.push(PersistedAccount {
            id: "acc-1".into(),
            label: "primary".into(),
            provenance: Provenance::AwsDeviceCode,
            credentials: CredentialEnvelope {
                access_token: "at".into(),
                refresh_token: Some("rt".into()),
                expires_at: 1_700_000_000,
                auth_kind: AuthKind::Idc,
            },
            enabled: true,
            region: "us-east-1".into(),
            profile_arn: None,
            client_id: Some("cid".into()),
            client_secret: Some("cs".into()),
        });

        save_app_config(&cfg).expect("save");
        let loaded = load_app_config().expect("load");
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].id, "acc-1");
        assert_eq!(loaded.accounts[0].client_id.as_deref(), Some("cid"));

        // No stray temp file after an atomic write.
        let tmp = config_dir().unwrap().join("config.json.tmp");
        assert!(!tmp.exists());
    }
}
