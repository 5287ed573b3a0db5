//! Bridge between OS background execution and the transfer pipeline.
//!
//! - [`BackgroundBridge`] registers and re-arms the refresh / processing
//!   wakes and turns each wake into an auto-upload scan, a dispatcher pass
//!   or queue maintenance.
//! - [`SessionCompletionHandlers`] keeps the completion handlers the OS
//!   hands over for background transport sessions until their events
//!   drain.
//! - [`CompletionGuard`] makes sure every OS completion handler runs
//!   exactly once.

mod bridge;
mod config;
mod guard;
mod scheduler;
mod sessions;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{BackgroundBridge, BridgeState};
pub use config::BackgroundConfig;
pub use guard::CompletionGuard;
pub use scheduler::{
    AccountSource, AutoUploadScanner, OsTaskScheduler, ScheduleError, TaskKind, TaskRequest,
};
pub use sessions::SessionCompletionHandlers;
