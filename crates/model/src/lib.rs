//! Transfer record model shared by the store, the dispatcher and the
//! background bridge.
//!
//! A [`TransferRecord`] describes one pending or in-flight server
//! operation. Its [`TransferStatus`] only changes through
//! [`TransferStatus::apply`], which rejects edges the state machine does
//! not define.

mod record;
mod status;
mod transition;

pub use record::{NetworkPath, Origin, Session, TransferRecord, progress_key};
pub use status::{Direction, TransferStatus};
pub use transition::{TransferEvent, TransitionError};
