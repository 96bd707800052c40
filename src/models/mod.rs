pub mod account;
pub mod config;

pub use account::{Account, AuthKind, CredentialEnvelope, HealthState, PersistedAccount, Provenance};
pub use config::{AppConfig, GovernorConfig, ProxyConfig};
