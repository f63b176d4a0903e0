//! PTY supervision for AI-assistant agent processes.
//!
//! One supervised agent is one child process running inside a pseudo
//! terminal. The supervisor thread owns the PTY master: it forwards output,
//! watches for the task-completion marker, detects approval prompts, and
//! drives the approval micro-protocol (auto-approve, auto-deny, or park the
//! agent until an external decision arrives).
//!
//! - [`pty`]: fork/exec under `openpty`, non-blocking reads, resize, kill
//! - [`ansi`]: escape-sequence stripping for clean pattern matching
//! - [`output`]: bounded tail of recent stripped output plus line assembly
//! - [`locate`]: assistant-binary discovery and launch arguments
//! - [`supervisor`]: the per-agent event loop and approval state machine
//! - [`stall`]: idle detection with a single nudge
//! - [`kill_tree`]: process-tree termination with SIGTERM/SIGKILL escalation

pub mod ansi;
pub mod kill_tree;
pub mod locate;
pub mod output;
pub mod pty;
pub mod stall;
pub mod supervisor;

pub use locate::{launch_args, locate_agent_binary};
pub use pty::{PtySession, PtySize};
pub use supervisor::{
    spawn_supervised, ApprovalState, PilotCommand, PilotConfig, PilotHandle, PilotSignal,
};
