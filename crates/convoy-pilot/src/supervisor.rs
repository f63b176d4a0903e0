//! The per-agent supervisor loop and approval state machine.
//!
//! One supervisor thread owns one PTY session. It forwards output, watches
//! for the `TASKS_COMPLETED` marker, and drives the approval micro-protocol:
//!
//! - a blocklisted command is denied on the spot,
//! - an auto-approvable one is accepted on the spot,
//! - anything else parks the state machine at `Waiting` and surfaces an
//!   `ApprovalRequested` signal for an external decision.
//!
//! After a response is typed at the child, the state moves to `Sent` and
//! settles back to `Idle` once the prompt leaves the screen; if the prompt
//! is still showing after the resend window, one fallback keystroke is sent.
//! Prompt matching is approximate by design, which is exactly why the
//! fallback exists.
//!
//! This path must never panic or return early: every failure is converted
//! into a signal, and the loop always ends in an `Exit`.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use convoy_policy::{classify_command, compute_flags, CommandClass, PromptScanner};
use convoy_types::{ApprovalUi, ConvoyError, Result, RiskFlags};

use crate::kill_tree::kill_tree;
use crate::locate::launch_args;
use crate::output::TailBuffer;
use crate::pty::{PtySession, PtySize};
use crate::stall::{StallCheck, StallDetector, NUDGE_MESSAGE};
use crate::ansi;

/// The marker line an agent prints when it believes its tasks are done.
pub const COMPLETION_MARKER: &str = "TASKS_COMPLETED";

/// Approval micro-protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalState {
    /// No prompt on screen.
    Idle,
    /// A prompt needs an external decision; holds the request id.
    Waiting { request_id: String },
    /// A response was typed; waiting for the prompt to leave the screen.
    Sent { retried: bool },
}

/// Signals emitted by a supervisor to its owner.
#[derive(Debug, Clone)]
pub enum PilotSignal {
    /// A chunk of (ANSI-stripped) terminal output.
    Output { text: String },
    /// The completion marker appeared. Latched so repaints of the same
    /// marker emit nothing; sending new input re-arms the latch.
    TasksCompleted,
    /// A prompt requires an external decision.
    ApprovalRequested {
        request_id: String,
        command: Option<String>,
        ui: ApprovalUi,
        context: String,
        flags: RiskFlags,
    },
    /// A blocklisted command was denied without asking.
    ApprovalAutoDenied {
        request_id: String,
        command: Option<String>,
        ui: ApprovalUi,
        context: String,
        flags: RiskFlags,
    },
    /// A safe command was approved without asking.
    ApprovalAutoApproved {
        request_id: String,
        command: Option<String>,
        ui: ApprovalUi,
    },
    /// The agent went quiet and was nudged.
    StallNudge { idle_secs: u64 },
    /// The child exited; always the final signal.
    Exit {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Commands accepted by a supervisor.
#[derive(Debug)]
pub enum PilotCommand {
    /// Resolve the pending approval positively. Valid only while `Waiting`.
    Approve {
        request_id: String,
        /// Overrides the detected UI kind when the screen changed between
        /// detection and decision.
        ui_override: Option<ApprovalUi>,
    },
    /// Resolve the pending approval negatively. Valid only while `Waiting`.
    Deny {
        request_id: String,
        ui_override: Option<ApprovalUi>,
    },
    /// Type a line at the agent.
    SendInput { text: String },
    /// Change terminal dimensions.
    Resize { cols: u16, rows: u16 },
    /// Terminate the agent's process tree.
    Kill,
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct PilotConfig {
    pub size: PtySize,
    /// The agent's workspace, for risk-flag computation.
    pub workspace: PathBuf,
    /// How long a typed response may sit unacknowledged before the one
    /// fallback keystroke.
    pub resend_after: Duration,
    /// Idle window before a stall nudge.
    pub stall_window: Duration,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            size: PtySize::default(),
            workspace: PathBuf::from("."),
            resend_after: Duration::from_secs(3),
            stall_window: Duration::from_secs(120),
        }
    }
}

/// Handle to a live supervised agent.
pub struct PilotHandle {
    pid: u32,
    command_tx: Sender<PilotCommand>,
    thread: Option<JoinHandle<()>>,
}

impl PilotHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send a command; fails once the supervisor thread has exited.
    pub fn send(&self, command: PilotCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| ConvoyError::Pilot("supervisor is gone".into()))
    }

    /// Whether the supervisor loop has finished.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the supervisor thread to finish.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn the assistant binary under supervision.
///
/// Returns the handle (pid + command channel) and the signal receiver. The
/// final signal on the receiver is always [`PilotSignal::Exit`].
pub fn spawn_supervised(
    binary: &Path,
    prompt: &str,
    working_dir: &Path,
    env: &[(String, String)],
    config: PilotConfig,
) -> Result<(PilotHandle, Receiver<PilotSignal>)> {
    let session = PtySession::spawn(binary, &launch_args(prompt), working_dir, env, config.size)?;
    let pid = session.pid();

    let (signal_tx, signal_rx) = mpsc::channel();
    let (command_tx, command_rx) = mpsc::channel();

    let thread = std::thread::Builder::new()
        .name(format!("pilot-{pid}"))
        .spawn(move || run_loop(session, config, signal_tx, command_rx))
        .map_err(|e| ConvoyError::Pilot(format!("failed to spawn supervisor thread: {e}")))?;

    info!(pid, "agent spawned under supervision");
    Ok((
        PilotHandle {
            pid,
            command_tx,
            thread: Some(thread),
        },
        signal_rx,
    ))
}

struct LoopState {
    approval: ApprovalState,
    pending_ui: ApprovalUi,
    pending_command: Option<String>,
    sent_at: Instant,
    completion_signaled: bool,
}

fn run_loop(
    session: PtySession,
    config: PilotConfig,
    tx: Sender<PilotSignal>,
    rx: Receiver<PilotCommand>,
) {
    let scanner = PromptScanner::new();
    let mut buffer = TailBuffer::new();
    let mut stall = StallDetector::new(config.stall_window);
    let mut read_buf = [0u8; 8192];
    let mut state = LoopState {
        approval: ApprovalState::Idle,
        pending_ui: ApprovalUi::Unknown,
        pending_command: None,
        sent_at: Instant::now(),
        completion_signaled: false,
    };

    loop {
        let readable = session.poll_readable(200).unwrap_or(false);

        let mut got_output = false;
        if readable {
            match session.read(&mut read_buf) {
                Ok(0) => {}
                Ok(n) => {
                    stall.activity();
                    got_output = true;
                    ingest_chunk(&read_buf[..n], &mut buffer, &mut state, &tx);
                }
                Err(e) => {
                    warn!(pid = session.pid(), error = %e, "pty read failed");
                }
            }
        }

        // Prompts are matched on quiet cycles only: a prompt that is still
        // being painted must not be classified from its first lines.
        if !got_output {
            step_approvals(&session, &scanner, &config, &mut state, buffer.tail(), &tx);
        }

        // Drain external commands.
        loop {
            match rx.try_recv() {
                Ok(command) => {
                    handle_command(command, &session, &mut state, &mut stall);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        // Nudge only when nothing approval-shaped is in flight.
        if state.approval == ApprovalState::Idle && stall.check() == StallCheck::Nudge {
            let idle_secs = stall.idle().as_secs();
            info!(pid = session.pid(), idle_secs, "agent stalled, nudging");
            if session.send_line(NUDGE_MESSAGE).is_ok() {
                let _ = tx.send(PilotSignal::StallNudge { idle_secs });
            }
        }

        if !session.is_alive() {
            // Drain whatever is left in the master buffer.
            loop {
                match session.read(&mut read_buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => ingest_chunk(&read_buf[..n], &mut buffer, &mut state, &tx),
                }
            }
            break;
        }
    }

    let (exit_code, signal) = session.wait().unwrap_or((None, None));
    info!(pid = session.pid(), ?exit_code, ?signal, "agent exited");
    let _ = tx.send(PilotSignal::Exit { exit_code, signal });
}

/// Steps 1-3 of chunk handling: buffer, forward, completion marker.
fn ingest_chunk(
    chunk: &[u8],
    buffer: &mut TailBuffer,
    state: &mut LoopState,
    tx: &Sender<PilotSignal>,
) {
    let text = ansi::scrub(chunk);
    let lines = buffer.push_text(&text);
    let _ = tx.send(PilotSignal::Output { text });

    if !state.completion_signaled
        && lines.iter().any(|line| line.trim() == COMPLETION_MARKER)
    {
        state.completion_signaled = true;
        let _ = tx.send(PilotSignal::TasksCompleted);
    }
}

/// Steps 4-5: settle a sent response, or detect and act on a new prompt.
fn step_approvals(
    session: &PtySession,
    scanner: &PromptScanner,
    config: &PilotConfig,
    state: &mut LoopState,
    tail: &str,
    tx: &Sender<PilotSignal>,
) {
    match state.approval.clone() {
        ApprovalState::Sent { retried } => {
            if !scanner.is_prompting(tail) {
                // The child accepted the response.
                state.approval = ApprovalState::Idle;
                state.pending_command = None;
            } else if !retried && state.sent_at.elapsed() >= config.resend_after {
                debug!(
                    ui = ?state.pending_ui,
                    command = ?state.pending_command,
                    "prompt still showing, sending fallback"
                );
                let _ = session.write_all(fallback_response(state.pending_ui));
                state.approval = ApprovalState::Sent { retried: true };
            }
        }
        ApprovalState::Waiting { .. } => {
            // Parked until an external Approve/Deny arrives.
        }
        ApprovalState::Idle => {
            let Some(detection) = scanner.detect(tail) else {
                return;
            };
            let request_id = uuid::Uuid::new_v4().to_string();
            let class = detection
                .command
                .as_deref()
                .map(classify_command)
                // No command extracted: someone has to look at it.
                .unwrap_or(CommandClass::ApprovalRequired);
            let flags = compute_flags(detection.command.as_deref(), &config.workspace);

            state.pending_ui = detection.ui;
            state.pending_command = detection.command.clone();

            match class {
                CommandClass::Blocklist => {
                    info!(command = ?detection.command, "blocklisted command auto-denied");
                    let _ = session.write_all(deny_response(detection.ui));
                    state.sent_at = Instant::now();
                    state.approval = ApprovalState::Sent { retried: false };
                    let _ = tx.send(PilotSignal::ApprovalAutoDenied {
                        request_id,
                        command: detection.command,
                        ui: detection.ui,
                        context: detection.context,
                        flags,
                    });
                }
                CommandClass::ApprovalRequired => {
                    info!(command = ?detection.command, "approval required, parking");
                    state.approval = ApprovalState::Waiting {
                        request_id: request_id.clone(),
                    };
                    let _ = tx.send(PilotSignal::ApprovalRequested {
                        request_id,
                        command: detection.command,
                        ui: detection.ui,
                        context: detection.context,
                        flags,
                    });
                }
                CommandClass::AutoApprove => {
                    debug!(command = ?detection.command, "auto-approving");
                    let _ = session.write_all(approve_response(detection.ui));
                    state.sent_at = Instant::now();
                    state.approval = ApprovalState::Sent { retried: false };
                    let _ = tx.send(PilotSignal::ApprovalAutoApproved {
                        request_id,
                        command: detection.command,
                        ui: detection.ui,
                    });
                }
            }
        }
    }
}

fn handle_command(
    command: PilotCommand,
    session: &PtySession,
    state: &mut LoopState,
    stall: &mut StallDetector,
) {
    match command {
        PilotCommand::Approve {
            request_id,
            ui_override,
        } => match state.approval.clone() {
            ApprovalState::Waiting { request_id: cur } if cur == request_id => {
                let ui = ui_override.unwrap_or(state.pending_ui);
                let _ = session.write_all(approve_response(ui));
                state.pending_ui = ui;
                state.sent_at = Instant::now();
                state.approval = ApprovalState::Sent { retried: false };
                stall.activity();
            }
            _ => warn!(%request_id, "approve ignored: no matching pending request"),
        },
        PilotCommand::Deny {
            request_id,
            ui_override,
        } => match state.approval.clone() {
            ApprovalState::Waiting { request_id: cur } if cur == request_id => {
                let ui = ui_override.unwrap_or(state.pending_ui);
                let _ = session.write_all(deny_response(ui));
                state.pending_ui = ui;
                state.sent_at = Instant::now();
                state.approval = ApprovalState::Sent { retried: false };
                stall.activity();
            }
            _ => warn!(%request_id, "deny ignored: no matching pending request"),
        },
        PilotCommand::SendInput { text } => {
            if let Err(e) = session.send_line(&text) {
                warn!(error = %e, "send_input failed");
            }
            // New instructions re-arm the completion marker: the agent is
            // expected to announce TASKS_COMPLETED again when it finishes.
            state.completion_signaled = false;
            stall.activity();
        }
        PilotCommand::Resize { cols, rows } => {
            if let Err(e) = session.resize(PtySize { cols, rows }) {
                warn!(error = %e, "resize failed");
            }
        }
        PilotCommand::Kill => {
            let pid = session.pid() as i32;
            if let Err(e) = kill_tree(pid) {
                warn!(pid, error = %e, "kill_tree failed, falling back to SIGTERM");
                let _ = session.terminate();
            }
        }
    }
}

/// The keystrokes that accept a prompt, per UI kind.
fn approve_response(ui: ApprovalUi) -> &'static [u8] {
    match ui {
        // The arrow already points at the first (accept) option.
        ApprovalUi::Menu => b"\n",
        ApprovalUi::Yn => b"y\n",
        ApprovalUi::Unknown => b"\n",
    }
}

/// The keystrokes that reject a prompt, per UI kind.
fn deny_response(ui: ApprovalUi) -> &'static [u8] {
    match ui {
        ApprovalUi::Menu => b"3\n",
        ApprovalUi::Yn => b"n\n",
        ApprovalUi::Unknown => b"n\n",
    }
}

/// The one retry keystroke when a response seems to have been swallowed.
fn fallback_response(ui: ApprovalUi) -> &'static [u8] {
    match ui {
        ApprovalUi::Menu => b"1\n",
        _ => b"\n",
    }
}
