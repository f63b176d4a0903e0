//! Plan-artifact watcher.
//!
//! Runs whenever a planning or review-receive cycle expects `plan.yaml` to
//! appear in the workspace root. The OS watch is paired with a polling
//! fallback because filesystem notifications are unreliable across symlink
//! boundaries. On a valid plan the watcher records `plan_created`, marks the
//! producing agent completed, and asks it to exit; it gives up after the
//! deadline or shortly after the producing agent dies without a plan.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use convoy_types::{AgentId, AgentStatus, EventKind, EventRecord, Item, Plan};

use crate::manager::AgentManager;

#[derive(Debug, Clone)]
pub struct PlanWatcherConfig {
    /// Hard deadline for the whole watch.
    pub deadline: Duration,
    /// Polling fallback interval.
    pub poll_interval: Duration,
    /// Grace period after the producing agent dies without a plan.
    pub exit_grace: Duration,
}

impl Default for PlanWatcherConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(3),
            exit_grace: Duration::from_secs(5),
        }
    }
}

/// Start a watcher thread for one expected plan.
///
/// `bound_agent` pins the producing agent (review-receive pre-allocates the
/// id); otherwise the running agent of `expected_role` is located when the
/// plan lands, falling back to the most recently started one.
pub fn start_plan_watcher(
    agents: Arc<AgentManager>,
    item: Item,
    expected_role: String,
    bound_agent: Option<AgentId>,
    config: PlanWatcherConfig,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("plan-watch-{}", item.id))
        .spawn(move || watch_loop(agents, item, expected_role, bound_agent, config))
        .expect("failed to spawn plan watcher thread")
}

fn watch_loop(
    agents: Arc<AgentManager>,
    item: Item,
    expected_role: String,
    bound_agent: Option<AgentId>,
    config: PlanWatcherConfig,
) {
    let layout = agents.ledger().layout().clone();
    let workspace = layout.workspace_root(&item.id);
    let plan_path = layout.plan_file(&item.id);

    // Wake on any change under the workspace root; correctness comes from
    // the poll below, the watch only shortens latency.
    let (notify_tx, notify_rx) = mpsc::channel::<()>();
    let _watcher = start_fs_watch(&workspace, notify_tx);

    let deadline = Instant::now() + config.deadline;
    let mut agent_gone_since: Option<Instant> = None;

    info!(item = %item.id, role = expected_role, "plan watcher started");

    loop {
        // The item being deleted out from under us ends the watch.
        if !layout.item_dir(&item.id).exists() {
            info!(item = %item.id, "item gone, plan watcher stopping");
            return;
        }

        if try_accept_plan(&agents, &item, &expected_role, bound_agent.as_ref(), &plan_path) {
            return;
        }

        if Instant::now() >= deadline {
            warn!(item = %item.id, "plan watcher deadline reached");
            record_error(&agents, &item, "plan was not produced before the deadline");
            return;
        }

        // The producing agent dying without a plan ends the watch after a
        // grace period and one final check.
        if producing_agent_dead(&agents, &item, &expected_role, bound_agent.as_ref()) {
            let since = *agent_gone_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= config.exit_grace {
                if try_accept_plan(
                    &agents,
                    &item,
                    &expected_role,
                    bound_agent.as_ref(),
                    &plan_path,
                ) {
                    return;
                }
                warn!(item = %item.id, role = expected_role, "agent exited without a plan");
                record_error(&agents, &item, "agent exited without producing a plan");
                return;
            }
        } else {
            agent_gone_since = None;
        }

        // Poll interval, shortened by filesystem events.
        let _ = notify_rx.recv_timeout(config.poll_interval);
    }
}

fn start_fs_watch(workspace: &PathBuf, tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let result = RecommendedWatcher::new(
        move |event: std::result::Result<notify::Event, notify::Error>| {
            if event.is_ok() {
                let _ = tx.send(());
            }
        },
        Config::default(),
    );
    match result {
        Ok(mut watcher) => match watcher.watch(workspace, RecursiveMode::NonRecursive) {
            Ok(()) => Some(watcher),
            Err(e) => {
                debug!(error = %e, "fs watch unavailable, relying on polling");
                None
            }
        },
        Err(e) => {
            debug!(error = %e, "fs watcher creation failed, relying on polling");
            None
        }
    }
}

/// If a valid plan is on disk: record it, complete the producer, send
/// `/exit`. Returns true when the watch is finished.
fn try_accept_plan(
    agents: &Arc<AgentManager>,
    item: &Item,
    expected_role: &str,
    bound_agent: Option<&AgentId>,
    plan_path: &PathBuf,
) -> bool {
    if !plan_path.exists() {
        return false;
    }
    let plan = match read_plan(plan_path) {
        Ok(plan) => plan,
        Err(reason) => {
            debug!(item = %item.id, reason, "plan file present but not acceptable yet");
            return false;
        }
    };
    if let Err(e) = plan.validate(item) {
        warn!(item = %item.id, error = %e, "plan failed validation, waiting for a rewrite");
        return false;
    }

    let record = EventRecord::item(
        &item.id,
        EventKind::PlanCreated {
            path: plan_path.display().to_string(),
            task_count: plan.tasks.len(),
        },
    );
    if let Err(e) = agents.ledger().record(&record) {
        warn!(item = %item.id, error = %e, "failed to record plan_created");
        return false;
    }
    info!(item = %item.id, tasks = plan.tasks.len(), "plan accepted");

    if let Some(agent_id) = locate_producer(agents, item, expected_role, bound_agent) {
        if let Err(e) = agents.set_status(&item.id, &agent_id, AgentStatus::Completed) {
            warn!(agent = %agent_id, error = %e, "could not mark producer completed");
        }
        if let Err(e) = agents.send_input(&agent_id, "/exit") {
            debug!(agent = %agent_id, error = %e, "producer did not take /exit");
        }
    }
    true
}

/// A tasks sequence (possibly empty) is the acceptance bar; everything else
/// reads as "still being written".
fn read_plan(path: &PathBuf) -> std::result::Result<Plan, String> {
    let yaml = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_yaml::from_str::<Plan>(&yaml).map_err(|e| e.to_string())
}

/// The producer: the bound agent, else the running agent of the expected
/// role, else the most recently started live agent of the item.
fn locate_producer(
    agents: &Arc<AgentManager>,
    item: &Item,
    expected_role: &str,
    bound_agent: Option<&AgentId>,
) -> Option<AgentId> {
    if let Some(bound) = bound_agent {
        return Some(bound.clone());
    }

    let live = agents.live_agents_for_item(&item.id);
    let mut best: Option<AgentId> = None;
    for agent_id in live {
        let Some(handle) = agents.handle(&agent_id) else {
            continue;
        };
        if handle.role == expected_role && handle.status() == AgentStatus::Running {
            return Some(agent_id);
        }
        best = Some(agent_id);
    }
    if best.is_some() {
        return best;
    }

    // Nothing live: fall back to the last started agent in the log.
    let events = agents.ledger().read_item(&item.id).ok()?;
    events
        .iter()
        .rev()
        .find(|e| matches!(e.kind, EventKind::AgentStarted { .. }))
        .and_then(|e| e.agent_id.clone())
}

/// The agent's status: live registry and remembered map first, then the
/// derived view of the item log (covers agents from a previous process).
fn status_of(
    agents: &Arc<AgentManager>,
    item: &Item,
    agent_id: &AgentId,
) -> Option<AgentStatus> {
    if let Some(status) = agents.agent_status(agent_id) {
        return Some(status);
    }
    let events = agents.ledger().read_item(&item.id).ok()?;
    convoy_ledger::derive_agent_statuses(&events)
        .get(agent_id)
        .copied()
}

fn producing_agent_dead(
    agents: &Arc<AgentManager>,
    item: &Item,
    expected_role: &str,
    bound_agent: Option<&AgentId>,
) -> bool {
    match bound_agent {
        Some(agent_id) => match status_of(agents, item, agent_id) {
            // Not yet started counts as still coming.
            None => false,
            Some(status) => status.is_terminal(),
        },
        None => {
            // Role-located producers: dead once an agent of the role exists
            // in the log and none remains active.
            let Ok(events) = agents.ledger().read_item(&item.id) else {
                return false;
            };
            let started: Vec<AgentId> = events
                .iter()
                .filter_map(|e| match &e.kind {
                    EventKind::AgentStarted { role, .. } if role == expected_role => {
                        e.agent_id.clone()
                    }
                    _ => None,
                })
                .collect();
            if started.is_empty() {
                return false;
            }
            started.iter().all(|id| {
                status_of(agents, item, id).is_none_or(|status| status.is_terminal())
            })
        }
    }
}

fn record_error(agents: &Arc<AgentManager>, item: &Item, message: &str) {
    let event = EventRecord::item(
        &item.id,
        EventKind::Error {
            message: message.to_string(),
        },
    );
    if let Err(e) = agents.ledger().record(&event) {
        warn!(item = %item.id, error = %e, "failed to record watcher error");
    }
}
