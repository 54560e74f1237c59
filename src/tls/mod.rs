// src/tls/mod.rs - TLS context construction, rotation, and lifecycle
pub mod context;
pub mod hybrid;
pub mod lifecycle;

pub use context::{TlsContext, TlsContextManager};
pub use lifecycle::{CertbotRenewal, LifecycleWorker, RenewalAction};
