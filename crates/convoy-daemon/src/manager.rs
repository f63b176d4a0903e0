//! Agent lifecycle: start, bridge, stop, and orphan recovery.
//!
//! The manager owns the in-memory agent registry. Every supervisor signal is
//! bridged to persisted events by exactly one thread per agent, and every
//! status transition is written to the ledger before the in-memory view is
//! touched; replay and memory can therefore never disagree in the direction
//! that matters.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use convoy_ledger::{derive_agent_statuses, pending_approvals, ItemLedger};
use convoy_pilot::{
    locate_agent_binary, spawn_supervised, PilotCommand, PilotConfig, PilotHandle, PilotSignal,
};
use convoy_types::{
    is_system_role, AgentId, AgentStatus, ConvoyError, EventId, EventKind, EventRecord, Item,
    ItemId, Result,
};

/// Lines of recent output retained per agent for the output-buffer API.
const OUTPUT_CAPACITY: usize = 500;

/// Runtime state for one live agent.
pub struct AgentHandle {
    pub item_id: ItemId,
    pub role: String,
    pub repo: Option<String>,
    pub pid: u32,
    pilot: PilotHandle,
    status: Arc<Mutex<AgentStatus>>,
    recent_output: Arc<Mutex<VecDeque<String>>>,
}

impl AgentHandle {
    pub fn status(&self) -> AgentStatus {
        *self.status.lock().expect("agent status poisoned")
    }

    /// Recent output lines, oldest first.
    pub fn recent_output(&self, n: usize) -> Vec<String> {
        let buf = self.recent_output.lock().expect("agent output poisoned");
        buf.iter().rev().take(n).rev().cloned().collect()
    }
}

/// The process-scoped agent manager.
pub struct AgentManager {
    ledger: ItemLedger,
    registry: Mutex<HashMap<AgentId, Arc<AgentHandle>>>,
    /// Last known status of agents that are not (or no longer) live.
    remembered: Mutex<HashMap<AgentId, AgentStatus>>,
}

impl AgentManager {
    pub fn new(ledger: ItemLedger) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            registry: Mutex::new(HashMap::new()),
            remembered: Mutex::new(HashMap::new()),
        })
    }

    pub fn ledger(&self) -> &ItemLedger {
        &self.ledger
    }

    /// Start an agent with a freshly generated id.
    pub fn start_agent(
        self: &Arc<Self>,
        item: &Item,
        role: &str,
        repo: Option<&str>,
        working_dir: &Path,
        prompt: &str,
    ) -> Result<AgentId> {
        let agent_id = AgentId::generate(role, repo);
        self.start_agent_with_id(item, agent_id.clone(), role, repo, working_dir, prompt)?;
        Ok(agent_id)
    }

    /// Start an agent under a pre-allocated id (review-receive needs the id
    /// in the ledger before the process exists).
    pub fn start_agent_with_id(
        self: &Arc<Self>,
        item: &Item,
        agent_id: AgentId,
        role: &str,
        repo: Option<&str>,
        working_dir: &Path,
        prompt: &str,
    ) -> Result<()> {
        if !is_system_role(role) && repo.is_none() {
            return Err(ConvoyError::Validation(format!(
                "role '{role}' must be bound to a repository"
            )));
        }

        let layout = self.ledger.layout().clone();
        std::fs::create_dir_all(layout.agent_dir(&item.id, &agent_id))?;

        let pilot_config = PilotConfig {
            workspace: layout.workspace_root(&item.id),
            ..PilotConfig::default()
        };

        let spawn = locate_agent_binary().and_then(|binary| {
            spawn_supervised(&binary, prompt, working_dir, &[], pilot_config)
        });
        let (pilot, signals) = match spawn {
            Ok(pair) => pair,
            Err(e) => {
                // Scope the failure to the id the agent would have had.
                let event = EventRecord::agent(
                    &item.id,
                    &agent_id,
                    EventKind::Error {
                        message: format!("failed to start agent: {e}"),
                    },
                );
                if let Err(record_err) = self.ledger.record(&event) {
                    warn!(agent = %agent_id, error = %record_err, "could not record spawn failure");
                }
                return Err(e);
            }
        };

        let pid = pilot.pid();
        self.ledger.record(&EventRecord::agent(
            &item.id,
            &agent_id,
            EventKind::AgentStarted {
                role: role.to_string(),
                repo: repo.map(str::to_string),
                pid,
            },
        ))?;

        let handle = Arc::new(AgentHandle {
            item_id: item.id.clone(),
            role: role.to_string(),
            repo: repo.map(str::to_string),
            pid,
            pilot,
            status: Arc::new(Mutex::new(AgentStatus::Running)),
            recent_output: Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_CAPACITY))),
        });

        self.registry
            .lock()
            .expect("agent registry poisoned")
            .insert(agent_id.clone(), Arc::clone(&handle));

        let manager = Arc::clone(self);
        let bridge_id = agent_id.clone();
        std::thread::Builder::new()
            .name(format!("bridge-{agent_id}"))
            .spawn(move || manager.bridge_signals(bridge_id, handle, signals))
            .map_err(|e| ConvoyError::Pilot(format!("failed to spawn bridge thread: {e}")))?;

        info!(item = %item.id, agent = %agent_id, pid, role, "agent started");
        Ok(())
    }

    /// Stop an agent: record the transition, mark it stopped, kill the tree.
    ///
    /// The `stopped` status is sticky; the agent's subsequent `agent_exited`
    /// will not overwrite it.
    pub fn stop_agent(&self, agent_id: &AgentId) -> Result<()> {
        let handle = self
            .handle(agent_id)
            .ok_or_else(|| ConvoyError::Validation(format!("no live agent {agent_id}")))?;

        let previous = handle.status();
        if previous != AgentStatus::Stopped {
            self.ledger.record(&EventRecord::agent(
                &handle.item_id,
                agent_id,
                EventKind::StatusChanged {
                    from: previous,
                    to: AgentStatus::Stopped,
                },
            ))?;
            *handle.status.lock().expect("agent status poisoned") = AgentStatus::Stopped;
        }

        handle.pilot.send(PilotCommand::Kill)?;
        info!(agent = %agent_id, "agent stop requested");
        Ok(())
    }

    /// Stop every live agent of an item. Returns how many were stopped.
    pub fn stop_item_agents(&self, item_id: &ItemId) -> usize {
        let targets: Vec<AgentId> = {
            let registry = self.registry.lock().expect("agent registry poisoned");
            registry
                .iter()
                .filter(|(_, h)| h.item_id == *item_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut stopped = 0;
        for agent_id in targets {
            match self.stop_agent(&agent_id) {
                Ok(()) => stopped += 1,
                Err(e) => warn!(agent = %agent_id, error = %e, "stop failed"),
            }
        }
        stopped
    }

    /// Current status: live registry first, then the remembered map.
    pub fn agent_status(&self, agent_id: &AgentId) -> Option<AgentStatus> {
        if let Some(handle) = self.handle(agent_id) {
            return Some(handle.status());
        }
        self.remembered
            .lock()
            .expect("remembered statuses poisoned")
            .get(agent_id)
            .copied()
    }

    pub fn handle(&self, agent_id: &AgentId) -> Option<Arc<AgentHandle>> {
        self.registry
            .lock()
            .expect("agent registry poisoned")
            .get(agent_id)
            .cloned()
    }

    /// Whether a live PTY backs this agent.
    pub fn is_live(&self, agent_id: &AgentId) -> bool {
        self.handle(agent_id).is_some()
    }

    pub fn live_agents_for_item(&self, item_id: &ItemId) -> Vec<AgentId> {
        let registry = self.registry.lock().expect("agent registry poisoned");
        registry
            .iter()
            .filter(|(_, h)| h.item_id == *item_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Type a line at an agent's terminal.
    pub fn send_input(&self, agent_id: &AgentId, text: &str) -> Result<()> {
        let handle = self
            .handle(agent_id)
            .ok_or_else(|| ConvoyError::Validation(format!("no live agent {agent_id}")))?;
        handle.pilot.send(PilotCommand::SendInput {
            text: text.to_string(),
        })
    }

    pub fn resize(&self, agent_id: &AgentId, cols: u16, rows: u16) -> Result<()> {
        let handle = self
            .handle(agent_id)
            .ok_or_else(|| ConvoyError::Validation(format!("no live agent {agent_id}")))?;
        handle.pilot.send(PilotCommand::Resize { cols, rows })
    }

    /// Record an orchestrator-driven status transition and mirror it in
    /// memory. A `stopped` agent stays stopped.
    pub fn set_status(
        &self,
        item_id: &ItemId,
        agent_id: &AgentId,
        to: AgentStatus,
    ) -> Result<()> {
        let previous = self.agent_status(agent_id).unwrap_or(AgentStatus::Idle);
        if previous == AgentStatus::Stopped {
            return Ok(());
        }
        self.ledger.record(&EventRecord::agent(
            item_id,
            agent_id,
            EventKind::StatusChanged { from: previous, to },
        ))?;
        if let Some(handle) = self.handle(agent_id) {
            *handle.status.lock().expect("agent status poisoned") = to;
        } else {
            self.remembered
                .lock()
                .expect("remembered statuses poisoned")
                .insert(agent_id.clone(), to);
        }
        Ok(())
    }

    /// Resolve a pending approval request identified by its event id.
    pub fn decide_approval(
        &self,
        item_id: &ItemId,
        request_event_id: &EventId,
        approve: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let events = self.ledger.read_item(item_id)?;
        let request = pending_approvals(&events)
            .into_iter()
            .find(|e| e.id == *request_event_id)
            .ok_or_else(|| {
                ConvoyError::Validation(format!(
                    "event {request_event_id} is not a pending approval request"
                ))
            })?;

        let (request_id, agent_id) = match (&request.kind, &request.agent_id) {
            (EventKind::ApprovalRequested { request_id, .. }, Some(agent_id)) => {
                (request_id.clone(), agent_id.clone())
            }
            _ => {
                return Err(ConvoyError::Validation(
                    "approval request is missing its agent".into(),
                ))
            }
        };

        // Decision first, command second: the log must explain whatever the
        // PTY does next.
        self.ledger.record(&EventRecord::agent(
            item_id,
            &agent_id,
            EventKind::ApprovalDecision {
                request_id: request_id.clone(),
                approved: approve,
                auto: false,
                reason,
            },
        ))?;

        if let Some(handle) = self.handle(&agent_id) {
            let command = if approve {
                PilotCommand::Approve {
                    request_id,
                    ui_override: None,
                }
            } else {
                PilotCommand::Deny {
                    request_id,
                    ui_override: None,
                }
            };
            handle.pilot.send(command)?;
            let mut status = handle.status.lock().expect("agent status poisoned");
            if *status == AgentStatus::WaitingApproval {
                *status = AgentStatus::Running;
            }
        } else {
            warn!(agent = %agent_id, "approval decided for an agent with no live PTY");
        }
        Ok(())
    }

    /// Startup reconstruction: stop every agent the log believes is active
    /// but no live PTY backs.
    ///
    /// For each orphan the role must be determinable (the `agent_started`
    /// role field, else parsed from the id); undeterminable agents are
    /// skipped entirely. The `status_changed(*→stopped)` append happens
    /// before the in-memory map update; crash recovery depends on this
    /// ordering.
    pub fn recover_orphans(&self) -> Result<usize> {
        let mut recovered = 0;
        for item_id in self.ledger.layout().list_item_ids()? {
            let events = self.ledger.read_item(&item_id)?;
            let statuses = derive_agent_statuses(&events);

            let started_roles: HashMap<&AgentId, &str> = events
                .iter()
                .filter_map(|e| match (&e.agent_id, &e.kind) {
                    (Some(id), EventKind::AgentStarted { role, .. }) => {
                        Some((id, role.as_str()))
                    }
                    _ => None,
                })
                .collect();

            for (agent_id, status) in &statuses {
                if !status.is_active() || self.is_live(agent_id) {
                    continue;
                }
                let role = started_roles
                    .get(agent_id)
                    .copied()
                    .or_else(|| agent_id.parse_role());
                if role.is_none() {
                    warn!(agent = %agent_id, "orphan with undeterminable role, skipping");
                    continue;
                }

                self.ledger.record(&EventRecord::agent(
                    &item_id,
                    agent_id,
                    EventKind::StatusChanged {
                        from: *status,
                        to: AgentStatus::Stopped,
                    },
                ))?;
                self.remembered
                    .lock()
                    .expect("remembered statuses poisoned")
                    .insert(agent_id.clone(), AgentStatus::Stopped);
                recovered += 1;
                info!(item = %item_id, agent = %agent_id, was = %status, "orphan stopped");
            }
        }
        Ok(recovered)
    }

    /// Per-agent signal bridge: the only writer of this agent's events.
    fn bridge_signals(
        self: Arc<Self>,
        agent_id: AgentId,
        handle: Arc<AgentHandle>,
        signals: Receiver<PilotSignal>,
    ) {
        let item_id = handle.item_id.clone();
        let mut saw_output = false;

        let record = |kind: EventKind| {
            let event = EventRecord::agent(&item_id, &agent_id, kind);
            if let Err(e) = self.ledger.record(&event) {
                error!(agent = %agent_id, error = %e, "event append failed");
            }
        };

        for signal in signals {
            match signal {
                PilotSignal::Output { text } => {
                    saw_output = true;
                    {
                        let mut buf =
                            handle.recent_output.lock().expect("agent output poisoned");
                        for line in text.lines().filter(|l| !l.is_empty()) {
                            if buf.len() >= OUTPUT_CAPACITY {
                                buf.pop_front();
                            }
                            buf.push_back(line.to_string());
                        }
                    }
                    record(EventKind::Stdout { chunk: text });
                }
                PilotSignal::TasksCompleted => {
                    let previous = handle.status();
                    record(EventKind::StatusChanged {
                        from: previous,
                        to: AgentStatus::WaitingOrchestrator,
                    });
                    record(EventKind::TasksCompleted {});
                    let mut status = handle.status.lock().expect("agent status poisoned");
                    if !status.is_terminal() {
                        *status = AgentStatus::WaitingOrchestrator;
                    }
                }
                PilotSignal::ApprovalRequested {
                    request_id,
                    command,
                    ui,
                    context,
                    flags,
                } => {
                    record(EventKind::ApprovalRequested {
                        request_id,
                        command,
                        ui,
                        context,
                        flags,
                        auto_decision: None,
                    });
                    let mut status = handle.status.lock().expect("agent status poisoned");
                    if !status.is_terminal() {
                        *status = AgentStatus::WaitingApproval;
                    }
                }
                PilotSignal::ApprovalAutoDenied {
                    request_id,
                    command,
                    ui,
                    context,
                    flags,
                } => {
                    record(EventKind::ApprovalRequested {
                        request_id: request_id.clone(),
                        command,
                        ui,
                        context,
                        flags,
                        auto_decision: Some("deny".into()),
                    });
                    record(EventKind::ApprovalDecision {
                        request_id,
                        approved: false,
                        auto: true,
                        reason: Some("blocklisted command".into()),
                    });
                }
                PilotSignal::ApprovalAutoApproved {
                    request_id,
                    command,
                    ui,
                } => {
                    record(EventKind::ApprovalRequested {
                        request_id: request_id.clone(),
                        command,
                        ui,
                        context: String::new(),
                        flags: Default::default(),
                        auto_decision: Some("approve".into()),
                    });
                    record(EventKind::ApprovalDecision {
                        request_id,
                        approved: true,
                        auto: true,
                        reason: None,
                    });
                }
                PilotSignal::StallNudge { idle_secs } => {
                    info!(agent = %agent_id, idle_secs, "stall nudge sent");
                }
                PilotSignal::Exit { exit_code, signal } => {
                    if !saw_output && exit_code != Some(0) {
                        record(EventKind::Error {
                            message: format!(
                                "agent exited before producing output (code {exit_code:?}, signal {signal:?})"
                            ),
                        });
                    }
                    record(EventKind::AgentExited { exit_code, signal });

                    let final_status = {
                        let mut status =
                            handle.status.lock().expect("agent status poisoned");
                        if *status != AgentStatus::Stopped {
                            *status = if exit_code == Some(0) {
                                AgentStatus::Completed
                            } else {
                                AgentStatus::Error
                            };
                        }
                        *status
                    };

                    self.remembered
                        .lock()
                        .expect("remembered statuses poisoned")
                        .insert(agent_id.clone(), final_status);
                    self.registry
                        .lock()
                        .expect("agent registry poisoned")
                        .remove(&agent_id);
                    break;
                }
            }
        }
        // Channel closed or exit handled; this bridge (the agent's only
        // listener) is deregistered by returning.
        info!(agent = %agent_id, "signal bridge finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_ledger::EventBus;
    use convoy_types::DataLayout;

    fn manager(root: &Path) -> Arc<AgentManager> {
        AgentManager::new(ItemLedger::new(DataLayout::new(root), EventBus::new()))
    }

    fn write_events(ledger: &ItemLedger, events: &[EventRecord]) {
        for event in events {
            ledger.record(event).unwrap();
        }
    }

    #[test]
    fn orphan_recovery_stops_active_agents() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let item_id = ItemId::new("ITEM-0BBB0000");
        let agent_id = AgentId::new("agent-front--frontend--a1b2c3");

        write_events(
            mgr.ledger(),
            &[EventRecord::agent(
                &item_id,
                &agent_id,
                EventKind::AgentStarted {
                    role: "front".into(),
                    repo: Some("frontend".into()),
                    pid: 12345,
                },
            )],
        );

        let recovered = mgr.recover_orphans().unwrap();
        assert_eq!(recovered, 1);

        // Exactly one stopped transition was appended.
        let events = mgr.ledger().read_item(&item_id).unwrap();
        let stops = events
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    EventKind::StatusChanged {
                        to: AgentStatus::Stopped,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(stops, 1);

        // Memory agrees with the log.
        assert_eq!(mgr.agent_status(&agent_id), Some(AgentStatus::Stopped));

        // Running again finds nothing to do.
        assert_eq!(mgr.recover_orphans().unwrap(), 0);
    }

    #[test]
    fn orphan_with_unknown_role_is_skipped_entirely() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let item_id = ItemId::new("ITEM-0BBB0001");
        // No agent_started role, and the id is unparseable.
        let agent_id = AgentId::new("mystery-process");

        write_events(
            mgr.ledger(),
            &[EventRecord::agent(
                &item_id,
                &agent_id,
                EventKind::StatusChanged {
                    from: AgentStatus::Idle,
                    to: AgentStatus::Running,
                },
            )],
        );

        assert_eq!(mgr.recover_orphans().unwrap(), 0);
        // No log write either.
        let events = mgr.ledger().read_item(&item_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(mgr.agent_status(&agent_id), None);
    }

    #[test]
    fn terminal_agents_are_not_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let item_id = ItemId::new("ITEM-0BBB0002");
        let agent_id = AgentId::new("agent-back--backend--d4e5f6");

        write_events(
            mgr.ledger(),
            &[
                EventRecord::agent(
                    &item_id,
                    &agent_id,
                    EventKind::AgentStarted {
                        role: "back".into(),
                        repo: Some("backend".into()),
                        pid: 99,
                    },
                ),
                EventRecord::agent(
                    &item_id,
                    &agent_id,
                    EventKind::AgentExited {
                        exit_code: Some(0),
                        signal: None,
                    },
                ),
            ],
        );

        assert_eq!(mgr.recover_orphans().unwrap(), 0);
    }

    #[test]
    fn role_from_id_when_started_event_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let item_id = ItemId::new("ITEM-0BBB0003");
        // Parseable id, but no agent_started in the log.
        let agent_id = AgentId::new("agent-planner--abc123");

        write_events(
            mgr.ledger(),
            &[EventRecord::agent(
                &item_id,
                &agent_id,
                EventKind::StatusChanged {
                    from: AgentStatus::Idle,
                    to: AgentStatus::WaitingOrchestrator,
                },
            )],
        );

        assert_eq!(mgr.recover_orphans().unwrap(), 1);
        assert_eq!(mgr.agent_status(&agent_id), Some(AgentStatus::Stopped));
    }

    #[test]
    fn decide_approval_rejects_unknown_event() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let item_id = ItemId::new("ITEM-0BBB0004");

        let err = mgr
            .decide_approval(&item_id, &EventId::new("nope"), true, None)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn start_agent_validates_repo_binding() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path());
        let item = Item {
            id: ItemId::new("ITEM-0BBB0005"),
            name: "x".into(),
            description: String::new(),
            design_doc: None,
            repositories: vec![],
            created_at: chrono::Utc::now(),
        };

        let err = mgr
            .start_agent(&item, "front", None, tmp.path(), "prompt")
            .unwrap_err();
        assert!(err.is_validation());
    }
}
