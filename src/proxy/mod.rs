pub mod accounts;
pub mod handlers;
pub mod mappers;
pub mod monitor;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod state;
pub mod upstream;

pub use accounts::store::CredentialStore;
pub use server::serve;
