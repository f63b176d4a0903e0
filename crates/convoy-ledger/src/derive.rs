//! Pure state derivation from event histories.
//!
//! Nothing here writes. Given the events of one item in append order, these
//! functions compute the item status, the per-agent statuses, and the set of
//! approval requests still awaiting a decision. Re-running them on the same
//! log always yields the same answer; the append order is the total order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use convoy_types::{
    is_system_role, is_worker_role, AgentId, AgentStatus, EventKind, EventRecord, ItemStatus,
};

/// Left-fold the per-agent status machine over an event history.
///
/// `agent_started` puts an agent at running; `agent_exited` is terminal
/// (completed on exit 0, error otherwise) unless the orchestrator already
/// recorded `stopped`; an approval request parks the agent at
/// waiting_approval until its decision; an explicit `status_changed` applies
/// unless the agent is stopped, or exited and the new status is not
/// `stopped`.
pub fn derive_agent_statuses(events: &[EventRecord]) -> BTreeMap<AgentId, AgentStatus> {
    let mut statuses: BTreeMap<AgentId, AgentStatus> = BTreeMap::new();

    for event in events {
        let Some(agent_id) = &event.agent_id else {
            continue;
        };
        let current = statuses
            .entry(agent_id.clone())
            .or_insert(AgentStatus::Idle);

        match &event.kind {
            EventKind::AgentStarted { .. } => {
                *current = AgentStatus::Running;
            }
            EventKind::AgentExited { exit_code, .. } => {
                if *current != AgentStatus::Stopped {
                    *current = if *exit_code == Some(0) {
                        AgentStatus::Completed
                    } else {
                        AgentStatus::Error
                    };
                }
            }
            EventKind::ApprovalRequested { .. } => {
                if !current.is_terminal() {
                    *current = AgentStatus::WaitingApproval;
                }
            }
            EventKind::ApprovalDecision { .. } => {
                if *current == AgentStatus::WaitingApproval {
                    *current = AgentStatus::Running;
                }
            }
            EventKind::StatusChanged { to, .. } => {
                let blocked = *current == AgentStatus::Stopped
                    || (current.is_terminal() && *to != AgentStatus::Stopped);
                if !blocked {
                    *current = *to;
                }
            }
            _ => {}
        }
    }

    statuses
}

/// Approval requests with no decision yet.
///
/// A request is pending when no `approval_decision` references its request
/// id and the request was not synthesized as an auto-deny.
pub fn pending_approvals(events: &[EventRecord]) -> Vec<&EventRecord> {
    let decided: HashSet<&str> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ApprovalDecision { request_id, .. } => Some(request_id.as_str()),
            _ => None,
        })
        .collect();

    events
        .iter()
        .filter(|e| match &e.kind {
            EventKind::ApprovalRequested {
                request_id,
                auto_decision,
                ..
            } => {
                !decided.contains(request_id.as_str())
                    && auto_decision.as_deref() != Some("deny")
            }
            _ => false,
        })
        .collect()
}

/// Derive the item status. First matching rule wins; the rule order is the
/// contract and is load-bearing.
pub fn derive_item_status(events: &[EventRecord]) -> ItemStatus {
    // 1. Nothing recorded yet.
    if events.is_empty() {
        return ItemStatus::Created;
    }

    let agent_statuses = derive_agent_statuses(events);
    let roles = agent_roles(events);

    // 2. An unrepaired error. Only the last error matters: a later
    //    `pr_created` or `repo_no_changes` clears everything before it.
    if let Some(last_error) = events
        .iter()
        .rposition(|e| matches!(e.kind, EventKind::Error { .. }))
    {
        let repaired = events[last_error + 1..].iter().any(|e| {
            matches!(
                e.kind,
                EventKind::PrCreated { .. } | EventKind::RepoNoChanges { .. }
            )
        });
        if !repaired {
            return ItemStatus::Error;
        }
    }

    // 3. Clone phase: any failure is fatal, any clone still open keeps the
    //    item in cloning.
    let mut clone_started: BTreeSet<&str> = BTreeSet::new();
    let mut clone_done: BTreeSet<&str> = BTreeSet::new();
    let mut setup_started: BTreeSet<&str> = BTreeSet::new();
    let mut setup_done: BTreeSet<&str> = BTreeSet::new();
    for event in events {
        match &event.kind {
            EventKind::CloneStarted { repo, .. } => {
                clone_started.insert(repo.as_str());
            }
            EventKind::CloneCompleted { repo, success, .. } => {
                if !success {
                    return ItemStatus::Error;
                }
                clone_done.insert(repo.as_str());
            }
            EventKind::WorkspaceSetupStarted { repo, .. } => {
                setup_started.insert(repo.as_str());
            }
            EventKind::WorkspaceSetupCompleted { repo, success, .. } => {
                if !success {
                    return ItemStatus::Error;
                }
                setup_done.insert(repo.as_str());
            }
            _ => {}
        }
    }
    if !clone_started.is_subset(&clone_done) {
        return ItemStatus::Cloning;
    }

    // 4. Local staging, same shape as cloning.
    if !setup_started.is_subset(&setup_done) {
        return ItemStatus::WorkspaceSetup;
    }

    // 5. A human decision is outstanding somewhere.
    if agent_statuses
        .values()
        .any(|s| *s == AgentStatus::WaitingApproval)
    {
        return ItemStatus::WaitingApproval;
    }

    // 6. A review-receive cycle is open: no plan yet, and the designated
    //    receiver is still alive (or has not started). A receiver that died
    //    without producing a plan is an error.
    if let Some(rr_index) = events
        .iter()
        .rposition(|e| matches!(e.kind, EventKind::ReviewReceiveStarted { .. }))
    {
        let plan_after = events[rr_index + 1..]
            .iter()
            .any(|e| matches!(e.kind, EventKind::PlanCreated { .. }));
        if !plan_after {
            let receiver = events[rr_index].agent_id.as_ref();
            let receiver_status = receiver.and_then(|id| agent_statuses.get(id));
            return match receiver_status {
                None => ItemStatus::ReviewReceiving,
                Some(status) if status.is_active() => ItemStatus::ReviewReceiving,
                Some(_) => ItemStatus::Error,
            };
        }
    }

    // 7. Planner at work.
    if agent_statuses.iter().any(|(id, status)| {
        *status == AgentStatus::Running && role_of(&roles, id).as_deref() == Some("planner")
    }) {
        return ItemStatus::Planning;
    }

    // 8. Any non-system agent at work.
    if agent_statuses.iter().any(|(id, status)| {
        *status == AgentStatus::Running
            && !role_of(&roles, id)
                .as_deref()
                .is_some_and(is_system_role)
    }) {
        return ItemStatus::Running;
    }

    // 9. Everything delivered: every worker ever started reported
    //    tasks_completed, every staged repository reached pr_created or
    //    repo_no_changes, and no new planning cycle opened afterwards.
    let staged_repos: BTreeSet<&str> = clone_started.union(&setup_started).copied().collect();
    if !staged_repos.is_empty() && workers_done(events, &agent_statuses, &roles) {
        let mut last_terminal_repo_event = None;
        let mut terminal_repos: BTreeSet<&str> = BTreeSet::new();
        for (idx, event) in events.iter().enumerate() {
            match &event.kind {
                EventKind::PrCreated { repo, .. } | EventKind::RepoNoChanges { repo } => {
                    terminal_repos.insert(repo.as_str());
                    last_terminal_repo_event = Some(idx);
                }
                _ => {}
            }
        }
        if staged_repos.is_subset(&terminal_repos) {
            let reopened = last_terminal_repo_event.is_some_and(|idx| {
                events[idx + 1..].iter().any(|e| {
                    matches!(
                        e.kind,
                        EventKind::PlanCreated { .. } | EventKind::ReviewReceiveStarted { .. }
                    )
                })
            });
            if !reopened {
                return ItemStatus::Completed;
            }
        }
    }

    // 10. A plan exists but nothing is running.
    if events
        .iter()
        .any(|e| matches!(e.kind, EventKind::PlanCreated { .. }))
    {
        return ItemStatus::Ready;
    }

    // 11. Fallback.
    ItemStatus::Created
}

/// Map agent ids to roles: prefer the role recorded by `agent_started`,
/// fall back to parsing the id.
fn agent_roles(events: &[EventRecord]) -> HashMap<AgentId, String> {
    let mut roles = HashMap::new();
    for event in events {
        if let (Some(agent_id), EventKind::AgentStarted { role, .. }) =
            (&event.agent_id, &event.kind)
        {
            roles.insert(agent_id.clone(), role.clone());
        }
    }
    roles
}

fn role_of(roles: &HashMap<AgentId, String>, agent_id: &AgentId) -> Option<String> {
    roles
        .get(agent_id)
        .cloned()
        .or_else(|| agent_id.parse_role().map(str::to_string))
}

/// Every worker agent that was ever started has a `tasks_completed` event.
fn workers_done(
    events: &[EventRecord],
    agent_statuses: &BTreeMap<AgentId, AgentStatus>,
    roles: &HashMap<AgentId, String>,
) -> bool {
    let completed: HashSet<&AgentId> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TasksCompleted {} => e.agent_id.as_ref(),
            _ => None,
        })
        .collect();

    agent_statuses.keys().all(|id| {
        let Some(role) = role_of(roles, id) else {
            return true;
        };
        !is_worker_role(&role) || completed.contains(id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::{ApprovalUi, ItemId, RiskFlags};

    fn item_id() -> ItemId {
        ItemId::new("ITEM-DE110000")
    }

    fn ev(kind: EventKind) -> EventRecord {
        EventRecord::item(&item_id(), kind)
    }

    fn agent_ev(agent: &str, kind: EventKind) -> EventRecord {
        EventRecord::agent(&item_id(), &AgentId::new(agent), kind)
    }

    fn started(agent: &str, role: &str, repo: Option<&str>) -> EventRecord {
        agent_ev(
            agent,
            EventKind::AgentStarted {
                role: role.into(),
                repo: repo.map(Into::into),
                pid: 4242,
            },
        )
    }

    fn clone_pair(repo: &str) -> Vec<EventRecord> {
        vec![
            ev(EventKind::CloneStarted {
                repo: repo.into(),
                url: format!("https://example.com/{repo}.git"),
            }),
            ev(EventKind::CloneCompleted {
                repo: repo.into(),
                success: true,
                error: None,
            }),
        ]
    }

    fn request(agent: &str, request_id: &str) -> EventRecord {
        agent_ev(
            agent,
            EventKind::ApprovalRequested {
                request_id: request_id.into(),
                command: Some("curl https://example.com".into()),
                ui: ApprovalUi::Menu,
                context: String::new(),
                flags: RiskFlags::default(),
                auto_decision: None,
            },
        )
    }

    fn decision(agent: &str, request_id: &str, approved: bool, auto: bool) -> EventRecord {
        agent_ev(
            agent,
            EventKind::ApprovalDecision {
                request_id: request_id.into(),
                approved,
                auto,
                reason: None,
            },
        )
    }

    const DEV: &str = "agent-front--frontend--a1b2c3";
    const PLANNER: &str = "agent-planner--0f0f0f";

    #[test]
    fn empty_log_is_created() {
        assert_eq!(derive_item_status(&[]), ItemStatus::Created);
    }

    #[test]
    fn open_clone_is_cloning() {
        let events = vec![
            ev(EventKind::ItemCreated { name: "x".into() }),
            ev(EventKind::CloneStarted {
                repo: "frontend".into(),
                url: "https://example.com/f.git".into(),
            }),
        ];
        assert_eq!(derive_item_status(&events), ItemStatus::Cloning);
    }

    #[test]
    fn failed_clone_is_error() {
        let events = vec![
            ev(EventKind::CloneStarted {
                repo: "frontend".into(),
                url: "u".into(),
            }),
            ev(EventKind::CloneCompleted {
                repo: "frontend".into(),
                success: false,
                error: Some("auth".into()),
            }),
        ];
        assert_eq!(derive_item_status(&events), ItemStatus::Error);
    }

    #[test]
    fn open_local_staging_is_workspace_setup() {
        let events = vec![ev(EventKind::WorkspaceSetupStarted {
            repo: "docs".into(),
            path: "/srv/docs".into(),
            link_mode: convoy_types::LinkMode::Symlink,
        })];
        assert_eq!(derive_item_status(&events), ItemStatus::WorkspaceSetup);
    }

    #[test]
    fn planner_running_is_planning() {
        let mut events = clone_pair("frontend");
        events.push(started(PLANNER, "planner", None));
        assert_eq!(derive_item_status(&events), ItemStatus::Planning);
    }

    #[test]
    fn dev_running_is_running() {
        let mut events = clone_pair("frontend");
        events.push(started(PLANNER, "planner", None));
        events.push(agent_ev(
            PLANNER,
            EventKind::AgentExited {
                exit_code: Some(0),
                signal: None,
            },
        ));
        events.push(ev(EventKind::PlanCreated {
            path: "plan.yaml".into(),
            task_count: 2,
        }));
        events.push(started(DEV, "front", Some("frontend")));
        assert_eq!(derive_item_status(&events), ItemStatus::Running);
    }

    #[test]
    fn waiting_approval_wins_over_running() {
        let mut events = clone_pair("frontend");
        events.push(started(DEV, "front", Some("frontend")));
        events.push(request(DEV, "req-1"));
        assert_eq!(derive_item_status(&events), ItemStatus::WaitingApproval);

        events.push(decision(DEV, "req-1", true, false));
        assert_eq!(derive_item_status(&events), ItemStatus::Running);
    }

    #[test]
    fn plan_without_agents_is_ready() {
        let mut events = clone_pair("frontend");
        events.push(ev(EventKind::PlanCreated {
            path: "plan.yaml".into(),
            task_count: 4,
        }));
        assert_eq!(derive_item_status(&events), ItemStatus::Ready);
    }

    #[test]
    fn full_happy_path_is_completed() {
        let mut events = clone_pair("frontend");
        events.extend(clone_pair("backend"));
        events.push(ev(EventKind::PlanCreated {
            path: "plan.yaml".into(),
            task_count: 4,
        }));
        for (agent, repo) in [
            ("agent-front--frontend--aaaaaa", "frontend"),
            ("agent-back--backend--bbbbbb", "backend"),
        ] {
            events.push(started(agent, repo_role(repo), Some(repo)));
            events.push(agent_ev(agent, EventKind::TasksCompleted {}));
            events.push(agent_ev(
                agent,
                EventKind::AgentExited {
                    exit_code: Some(0),
                    signal: None,
                },
            ));
        }
        events.push(ev(EventKind::PrCreated {
            repo: "frontend".into(),
            pr_url: "https://example.com/pr/1".into(),
            pr_number: 1,
            branch: "convoy/item-de110000/frontend".into(),
            commit: "abc".into(),
        }));
        events.push(ev(EventKind::RepoNoChanges {
            repo: "backend".into(),
        }));

        assert_eq!(derive_item_status(&events), ItemStatus::Completed);
    }

    fn repo_role(repo: &str) -> &'static str {
        if repo == "frontend" {
            "front"
        } else {
            "back"
        }
    }

    #[test]
    fn error_is_suppressed_by_later_pr() {
        let mut events = clone_pair("frontend");
        events.push(ev(EventKind::Error {
            message: "transient git failure".into(),
        }));
        events.push(ev(EventKind::PrCreated {
            repo: "frontend".into(),
            pr_url: "https://example.com/pr/2".into(),
            pr_number: 2,
            branch: "convoy/item-de110000/frontend".into(),
            commit: "def".into(),
        }));
        assert_ne!(derive_item_status(&events), ItemStatus::Error);
    }

    #[test]
    fn trailing_error_is_error() {
        let mut events = clone_pair("frontend");
        events.push(ev(EventKind::PrCreated {
            repo: "frontend".into(),
            pr_url: "https://example.com/pr/2".into(),
            pr_number: 2,
            branch: "b".into(),
            commit: "c".into(),
        }));
        events.push(ev(EventKind::Error {
            message: "push rejected".into(),
        }));
        assert_eq!(derive_item_status(&events), ItemStatus::Error);
    }

    #[test]
    fn review_receive_without_plan_is_review_receiving() {
        let receiver = "agent-review-receiver--123abc";
        let mut events = clone_pair("frontend");
        events.push(agent_ev(
            receiver,
            EventKind::ReviewReceiveStarted {
                pr_number: Some(7),
                pr_url: Some("https://example.com/pr/7".into()),
                repo: Some("frontend".into()),
            },
        ));
        // Receiver not yet started: still review_receiving.
        assert_eq!(derive_item_status(&events), ItemStatus::ReviewReceiving);

        events.push(started(receiver, "review-receiver", None));
        assert_eq!(derive_item_status(&events), ItemStatus::ReviewReceiving);
    }

    #[test]
    fn review_receiver_death_without_plan_is_error() {
        let receiver = "agent-review-receiver--123abc";
        let mut events = clone_pair("frontend");
        events.push(agent_ev(
            receiver,
            EventKind::ReviewReceiveStarted {
                pr_number: None,
                pr_url: None,
                repo: None,
            },
        ));
        events.push(started(receiver, "review-receiver", None));
        events.push(agent_ev(
            receiver,
            EventKind::AgentExited {
                exit_code: Some(1),
                signal: None,
            },
        ));
        assert_eq!(derive_item_status(&events), ItemStatus::Error);
    }

    #[test]
    fn plan_after_review_receive_closes_the_cycle() {
        let receiver = "agent-review-receiver--123abc";
        let mut events = clone_pair("frontend");
        events.push(agent_ev(
            receiver,
            EventKind::ReviewReceiveStarted {
                pr_number: None,
                pr_url: None,
                repo: None,
            },
        ));
        events.push(started(receiver, "review-receiver", None));
        events.push(ev(EventKind::PlanCreated {
            path: "plan.yaml".into(),
            task_count: 1,
        }));
        events.push(agent_ev(
            receiver,
            EventKind::StatusChanged {
                from: AgentStatus::Running,
                to: AgentStatus::Completed,
            },
        ));
        assert_eq!(derive_item_status(&events), ItemStatus::Ready);
    }

    #[test]
    fn completed_reopens_on_review_receive() {
        let mut events = clone_pair("frontend");
        events.push(started(DEV, "front", Some("frontend")));
        events.push(agent_ev(DEV, EventKind::TasksCompleted {}));
        events.push(agent_ev(
            DEV,
            EventKind::AgentExited {
                exit_code: Some(0),
                signal: None,
            },
        ));
        events.push(ev(EventKind::PrCreated {
            repo: "frontend".into(),
            pr_url: "https://example.com/pr/9".into(),
            pr_number: 9,
            branch: "b".into(),
            commit: "c".into(),
        }));
        assert_eq!(derive_item_status(&events), ItemStatus::Completed);

        events.push(agent_ev(
            "agent-review-receiver--0a0a0a",
            EventKind::ReviewReceiveStarted {
                pr_number: Some(9),
                pr_url: None,
                repo: Some("frontend".into()),
            },
        ));
        assert_eq!(derive_item_status(&events), ItemStatus::ReviewReceiving);
    }

    #[test]
    fn agent_fold_exit_codes() {
        let events = vec![
            started(DEV, "front", Some("frontend")),
            agent_ev(
                DEV,
                EventKind::AgentExited {
                    exit_code: Some(3),
                    signal: None,
                },
            ),
        ];
        let statuses = derive_agent_statuses(&events);
        assert_eq!(statuses[&AgentId::new(DEV)], AgentStatus::Error);
    }

    #[test]
    fn stopped_survives_a_later_exit() {
        let events = vec![
            started(DEV, "front", Some("frontend")),
            agent_ev(
                DEV,
                EventKind::StatusChanged {
                    from: AgentStatus::Running,
                    to: AgentStatus::Stopped,
                },
            ),
            agent_ev(
                DEV,
                EventKind::AgentExited {
                    exit_code: Some(0),
                    signal: None,
                },
            ),
        ];
        let statuses = derive_agent_statuses(&events);
        assert_eq!(statuses[&AgentId::new(DEV)], AgentStatus::Stopped);
    }

    #[test]
    fn exited_agent_ignores_late_status_except_stopped() {
        let base = vec![
            started(DEV, "front", Some("frontend")),
            agent_ev(
                DEV,
                EventKind::AgentExited {
                    exit_code: Some(0),
                    signal: None,
                },
            ),
        ];

        let mut late_running = base.clone();
        late_running.push(agent_ev(
            DEV,
            EventKind::StatusChanged {
                from: AgentStatus::Completed,
                to: AgentStatus::Running,
            },
        ));
        assert_eq!(
            derive_agent_statuses(&late_running)[&AgentId::new(DEV)],
            AgentStatus::Completed
        );

        let mut late_stopped = base;
        late_stopped.push(agent_ev(
            DEV,
            EventKind::StatusChanged {
                from: AgentStatus::Completed,
                to: AgentStatus::Stopped,
            },
        ));
        assert_eq!(
            derive_agent_statuses(&late_stopped)[&AgentId::new(DEV)],
            AgentStatus::Stopped
        );
    }

    #[test]
    fn pending_approvals_excludes_decided_and_auto_denied() {
        let mut auto_denied_request = request(DEV, "req-blocked");
        if let EventKind::ApprovalRequested { auto_decision, .. } = &mut auto_denied_request.kind {
            *auto_decision = Some("deny".into());
        }

        let events = vec![
            started(DEV, "front", Some("frontend")),
            request(DEV, "req-open"),
            request(DEV, "req-done"),
            decision(DEV, "req-done", true, false),
            auto_denied_request,
            decision(DEV, "req-blocked", false, true),
        ];

        let pending = pending_approvals(&events);
        assert_eq!(pending.len(), 1);
        match &pending[0].kind {
            EventKind::ApprovalRequested { request_id, .. } => {
                assert_eq!(request_id, "req-open")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn same_log_derives_same_status() {
        let mut events = clone_pair("frontend");
        events.push(started(DEV, "front", Some("frontend")));
        let first = derive_item_status(&events);
        let second = derive_item_status(&events);
        assert_eq!(first, second);
    }
}
