//! Event persistence and fan-out for the Convoy engine.
//!
//! Three concerns live here:
//!
//! - [`log`]: append-only NDJSON event logs, one per item and one per agent,
//!   with a crash-tolerant reader. The file append order is the authoritative
//!   total order of an item's history.
//! - [`bus`]: in-process publish/subscribe fan-out to live observers. The
//!   bus never blocks a publisher and retains no history.
//! - [`derive`]: pure functions from an event history to the current item
//!   status, per-agent statuses, and the pending-approval set.

pub mod bus;
pub mod derive;
pub mod log;

pub use bus::EventBus;
pub use derive::{derive_agent_statuses, derive_item_status, pending_approvals};
pub use log::{EventLog, ItemLedger};
