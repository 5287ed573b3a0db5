//! App-level wiring of the vaultsync transfer pipeline.
//!
//! Loads [`AppConfig`], initialises tracing and builds the [`AppContext`]
//! that owns the dispatcher, reconciler, fan-out and background bridge.
//! The host forwards its lifecycle callbacks to the context.

mod config;
mod context;
mod logging;

pub use config::AppConfig;
pub use context::{AppContext, ForegroundReport, Platform, SharedAccount};
pub use logging::{DEFAULT_FILTER, init_tracing};
