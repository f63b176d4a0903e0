//! Event records: the immutable facts every other component is derived from.
//!
//! One event is one JSON line in an item's (and possibly an agent's) log.
//! Every line carries `id`, `type`, `timestamp`, and `itemId`; agent-scoped
//! events additionally carry `agentId`. The kind-specific payload fields are
//! inlined into the same object.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, EventId, ItemId};
use crate::item::LinkMode;
use crate::review::{Finding, OverallAssessment};

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Starting,
    Running,
    WaitingApproval,
    WaitingOrchestrator,
    Stopped,
    Completed,
    Error,
}

impl AgentStatus {
    /// Whether the agent is expected to be backed by a live PTY.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AgentStatus::Running | AgentStatus::WaitingApproval | AgentStatus::WaitingOrchestrator
        )
    }

    /// Whether the agent has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Stopped | AgentStatus::Completed | AgentStatus::Error
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::WaitingApproval => "waiting_approval",
            AgentStatus::WaitingOrchestrator => "waiting_orchestrator",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Derived status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Created,
    Cloning,
    WorkspaceSetup,
    Planning,
    Ready,
    Running,
    WaitingApproval,
    ReviewReceiving,
    Completed,
    Error,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Created => "created",
            ItemStatus::Cloning => "cloning",
            ItemStatus::WorkspaceSetup => "workspace_setup",
            ItemStatus::Planning => "planning",
            ItemStatus::Ready => "ready",
            ItemStatus::Running => "running",
            ItemStatus::WaitingApproval => "waiting_approval",
            ItemStatus::ReviewReceiving => "review_receiving",
            ItemStatus::Completed => "completed",
            ItemStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// The approval-prompt UI style the assistant is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalUi {
    /// Numbered option list with an arrow marker.
    Menu,
    /// Bracketed `[y/n]` / `[yes/no]` question.
    Yn,
    Unknown,
}

/// Annotative flags computed per approval request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFlags {
    /// Path escapes the agent workspace or touches system/secret directories.
    pub is_outside_workspace: bool,
    /// Matches a destructive command pattern.
    pub is_destructive: bool,
    /// References credential-looking filenames.
    pub involves_secrets: bool,
    /// Matches a network-access pattern.
    pub involves_network: bool,
}

/// Kind tag plus payload of an event, inlined into the serialized line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename_all = "camelCase")]
    ItemCreated { name: String },

    #[serde(rename_all = "camelCase")]
    CloneStarted { repo: String, url: String },
    #[serde(rename_all = "camelCase")]
    CloneCompleted {
        repo: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceSetupStarted {
        repo: String,
        path: String,
        link_mode: LinkMode,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceSetupCompleted {
        repo: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    PlanCreated { path: String, task_count: usize },

    #[serde(rename_all = "camelCase")]
    AgentStarted {
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
        pid: u32,
    },
    #[serde(rename_all = "camelCase")]
    AgentExited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged { from: AgentStatus, to: AgentStatus },
    TasksCompleted {},
    #[serde(rename_all = "camelCase")]
    Stdout { chunk: String },
    #[serde(rename_all = "camelCase")]
    Stderr { chunk: String },
    #[serde(rename_all = "camelCase")]
    Error { message: String },

    #[serde(rename_all = "camelCase")]
    ApprovalRequested {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        ui: ApprovalUi,
        /// Up to 4 KiB of surrounding terminal output.
        context: String,
        #[serde(default)]
        flags: RiskFlags,
        /// Set to `"deny"` on requests synthesized for blocklisted commands.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_decision: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ApprovalDecision {
        request_id: String,
        approved: bool,
        /// True when the classifier decided without a human.
        auto: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    GitSnapshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
        dirty_files: usize,
    },
    #[serde(rename_all = "camelCase")]
    GitSnapshotError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    PrCreated {
        repo: String,
        pr_url: String,
        pr_number: u64,
        branch: String,
        commit: String,
    },
    #[serde(rename_all = "camelCase")]
    RepoNoChanges { repo: String },

    #[serde(rename_all = "camelCase")]
    ReviewFindingsExtracted {
        repo: String,
        iteration: u32,
        critical_count: usize,
        major_count: usize,
        minor_count: usize,
        overall_assessment: OverallAssessment,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        findings: Vec<Finding>,
    },
    #[serde(rename_all = "camelCase")]
    ReviewReceiveStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr_number: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
    },
}

impl EventKind {
    /// The serialized kind tag of this event.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::ItemCreated { .. } => "item_created",
            EventKind::CloneStarted { .. } => "clone_started",
            EventKind::CloneCompleted { .. } => "clone_completed",
            EventKind::WorkspaceSetupStarted { .. } => "workspace_setup_started",
            EventKind::WorkspaceSetupCompleted { .. } => "workspace_setup_completed",
            EventKind::PlanCreated { .. } => "plan_created",
            EventKind::AgentStarted { .. } => "agent_started",
            EventKind::AgentExited { .. } => "agent_exited",
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::TasksCompleted {} => "tasks_completed",
            EventKind::Stdout { .. } => "stdout",
            EventKind::Stderr { .. } => "stderr",
            EventKind::Error { .. } => "error",
            EventKind::ApprovalRequested { .. } => "approval_requested",
            EventKind::ApprovalDecision { .. } => "approval_decision",
            EventKind::GitSnapshot { .. } => "git_snapshot",
            EventKind::GitSnapshotError { .. } => "git_snapshot_error",
            EventKind::PrCreated { .. } => "pr_created",
            EventKind::RepoNoChanges { .. } => "repo_no_changes",
            EventKind::ReviewFindingsExtracted { .. } => "review_findings_extracted",
            EventKind::ReviewReceiveStarted { .. } => "review_receive_started",
        }
    }
}

/// One immutable line of an event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "itemId")]
    pub item_id: ItemId,
    #[serde(
        rename = "agentId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_id: Option<AgentId>,
}

impl EventRecord {
    /// Build an item-scoped event with a fresh id and the current time.
    pub fn item(item_id: &ItemId, kind: EventKind) -> Self {
        Self {
            id: EventId::generate(),
            kind,
            timestamp: Utc::now(),
            item_id: item_id.clone(),
            agent_id: None,
        }
    }

    /// Build an agent-scoped event with a fresh id and the current time.
    pub fn agent(item_id: &ItemId, agent_id: &AgentId, kind: EventKind) -> Self {
        Self {
            id: EventId::generate(),
            kind,
            timestamp: Utc::now(),
            item_id: item_id.clone(),
            agent_id: Some(agent_id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_line_carries_required_fields() {
        let item_id = ItemId::new("ITEM-00C0FFEE");
        let event = EventRecord::item(
            &item_id,
            EventKind::CloneStarted {
                repo: "frontend".into(),
                url: "https://example.com/frontend.git".into(),
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "clone_started");
        assert_eq!(json["itemId"], "ITEM-00C0FFEE");
        assert_eq!(json["repo"], "frontend");
        assert!(json["id"].is_string());
        assert!(json["timestamp"].is_string());
        assert!(json.get("agentId").is_none());
    }

    #[test]
    fn agent_scoped_events_carry_agent_id() {
        let item_id = ItemId::new("ITEM-00C0FFEE");
        let agent_id = AgentId::new("agent-front--frontend--a1b2c3");
        let event = EventRecord::agent(
            &item_id,
            &agent_id,
            EventKind::StatusChanged {
                from: AgentStatus::Running,
                to: AgentStatus::Stopped,
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["agentId"], "agent-front--frontend--a1b2c3");
        assert_eq!(json["from"], "running");
        assert_eq!(json["to"], "stopped");
    }

    #[test]
    fn round_trip_preserves_payload() {
        let item_id = ItemId::new("ITEM-00C0FFEE");
        let agent_id = AgentId::new("agent-back--backend--d4e5f6");
        let event = EventRecord::agent(
            &item_id,
            &agent_id,
            EventKind::ApprovalRequested {
                request_id: "req-1".into(),
                command: Some("curl https://example.com".into()),
                ui: ApprovalUi::Menu,
                context: "Allow Bash: curl https://example.com".into(),
                flags: RiskFlags {
                    involves_network: true,
                    ..Default::default()
                },
                auto_decision: None,
            },
        );

        let line = serde_json::to_string(&event).unwrap();
        let back: EventRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
        match back.kind {
            EventKind::ApprovalRequested { ui, flags, .. } => {
                assert_eq!(ui, ApprovalUi::Menu);
                assert!(flags.involves_network);
                assert!(!flags.is_destructive);
            }
            other => panic!("expected approval_requested, got {other:?}"),
        }
    }

    #[test]
    fn tag_matches_serialized_type() {
        let kinds = vec![
            EventKind::TasksCompleted {},
            EventKind::RepoNoChanges { repo: "x".into() },
            EventKind::Error {
                message: "boom".into(),
            },
        ];
        for kind in kinds {
            let event = EventRecord::item(&ItemId::new("ITEM-00000000"), kind);
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind.tag());
        }
    }

    #[test]
    fn statuses_display_snake_case() {
        assert_eq!(AgentStatus::WaitingOrchestrator.to_string(), "waiting_orchestrator");
        assert_eq!(ItemStatus::ReviewReceiving.to_string(), "review_receiving");
    }

    #[test]
    fn active_and_terminal_are_disjoint() {
        for status in [
            AgentStatus::Idle,
            AgentStatus::Starting,
            AgentStatus::Running,
            AgentStatus::WaitingApproval,
            AgentStatus::WaitingOrchestrator,
            AgentStatus::Stopped,
            AgentStatus::Completed,
            AgentStatus::Error,
        ] {
            assert!(!(status.is_active() && status.is_terminal()), "{status}");
        }
    }
}
