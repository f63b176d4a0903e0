//! Approval policy for supervised agent sessions.
//!
//! Two interwoven concerns, both regex-driven and deliberately localized in
//! this crate so the patterns evolve in one place:
//!
//! - [`command`]: classify a proposed shell command as blocklisted,
//!   approval-required, or auto-approvable.
//! - [`prompt`]: recognize an approval prompt in a window of terminal
//!   output, classify the UI (menu / y-n / unknown), and extract the
//!   proposed command.
//! - [`flags`]: annotate a request with risk flags (outside-workspace,
//!   destructive, secrets, network) for human reviewers.
//!
//! Terminal-stream matching is semantically approximate by design; the
//! supervisor carries a fallback timer for the cases these patterns miss.

pub mod command;
pub mod flags;
pub mod prompt;

pub use command::{classify_command, CommandClass};
pub use flags::compute_flags;
pub use prompt::{PromptDetection, PromptScanner};
