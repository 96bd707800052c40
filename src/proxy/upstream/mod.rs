pub mod client;
pub mod errors;
pub mod stream;

pub use client::UpstreamClient;
pub use errors::UpstreamErrorKind;
