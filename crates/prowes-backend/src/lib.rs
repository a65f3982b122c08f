//! HTTP clients for downstream GA4GH execution services.

mod config;
mod http;
pub mod tes;
pub mod wes;

pub use config::{connect_backend, BackendConfig, BackendConfigError, TesExecutorConfig};
pub use tes::TesBackend;
pub use wes::WesBackend;
