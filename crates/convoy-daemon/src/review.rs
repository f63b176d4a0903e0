//! Review-receive: turning pull-request feedback into a new plan cycle.
//!
//! The per-item entry point that re-opens a completed item. Requests are
//! serialized by the item's FIFO lock; the flow validates the item state,
//! pre-allocates the receiver's agent id, records `review_receive_started`,
//! archives the old plan, arms the plan watcher, and spawns the receiver
//! with a prompt that points it at the PR.
//!
//! Validation failures (wrong state, duplicate receiver, no PR) surface as
//! `ConvoyError::Validation` so transports can answer 4xx; everything else
//! is infrastructure.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use convoy_ledger::{derive_agent_statuses, derive_item_status, ItemLedger};
use convoy_types::ids::rand6;
use convoy_types::{AgentId, ConvoyError, EventKind, EventRecord, ItemId, ItemStatus, Result};

use crate::items::ItemManager;
use crate::locks::ItemLocks;
use crate::manager::AgentManager;
use crate::prompts;
use crate::watcher::{start_plan_watcher, PlanWatcherConfig};

const RECEIVER_ROLE: &str = "review-receiver";

pub struct ReviewReceiveController {
    ledger: ItemLedger,
    agents: Arc<AgentManager>,
    items: Arc<ItemManager>,
    locks: ItemLocks,
    watcher_config: PlanWatcherConfig,
}

impl ReviewReceiveController {
    pub fn new(
        ledger: ItemLedger,
        agents: Arc<AgentManager>,
        items: Arc<ItemManager>,
    ) -> Self {
        Self {
            ledger,
            agents,
            items,
            locks: ItemLocks::new(),
            watcher_config: PlanWatcherConfig::default(),
        }
    }

    /// Override the plan-watcher timings (tests shorten them).
    pub fn with_watcher_config(mut self, config: PlanWatcherConfig) -> Self {
        self.watcher_config = config;
        self
    }

    /// Open a review-receive cycle for an item.
    ///
    /// Callers for the same item are served strictly in arrival order; the
    /// second of two racing calls observes the first's side effects and
    /// fails validation rather than interleaving with it.
    pub fn start_review_receive(
        &self,
        item_id: &ItemId,
        repo: Option<&str>,
    ) -> Result<AgentId> {
        let _serial = self.locks.acquire(item_id);

        let item = self.items.load_item(item_id)?;
        let events = self.ledger.read_item(item_id)?;

        let status = derive_item_status(&events);
        if !matches!(status, ItemStatus::Completed | ItemStatus::Error) {
            return Err(ConvoyError::Validation(format!(
                "review-receive requires a completed or failed item, but {item_id} is {status}"
            )));
        }

        let receiver_active = derive_agent_statuses(&events).into_iter().any(|(id, s)| {
            s.is_active() && id.parse_role() == Some(RECEIVER_ROLE)
        });
        if receiver_active {
            return Err(ConvoyError::Validation(format!(
                "a review-receive cycle is already in progress for {item_id}"
            )));
        }

        if let Some(repo) = repo {
            if item.repository(repo).is_none() {
                return Err(ConvoyError::Validation(format!(
                    "item {item_id} has no repository '{repo}'"
                )));
            }
        }

        let pr = find_pr(&events, repo).ok_or_else(|| {
            ConvoyError::Validation(format!(
                "item {item_id} has no pull request to receive reviews from"
            ))
        })?;

        // The id exists in the ledger before the process does, so a crash
        // between here and spawn still leaves a traceable cycle.
        let agent_id = AgentId::generate(RECEIVER_ROLE, None);
        self.ledger.record(&EventRecord::agent(
            item_id,
            &agent_id,
            EventKind::ReviewReceiveStarted {
                pr_number: Some(pr.number),
                pr_url: Some(pr.url.clone()),
                repo: pr.repo.clone(),
            },
        ))?;

        self.archive_plan(item_id)?;

        start_plan_watcher(
            Arc::clone(&self.agents),
            item.clone(),
            RECEIVER_ROLE.to_string(),
            Some(agent_id.clone()),
            self.watcher_config.clone(),
        );

        let workspace = self.ledger.layout().workspace_root(item_id);
        let prompt = prompts::review_receive_prompt(
            &item,
            pr.repo.as_deref(),
            Some(pr.number),
            Some(&pr.url),
        );
        self.agents.start_agent_with_id(
            &item,
            agent_id.clone(),
            RECEIVER_ROLE,
            None,
            &workspace,
            &prompt,
        )?;

        info!(item = %item_id, agent = %agent_id, pr = pr.number, "review-receive cycle started");
        Ok(agent_id)
    }

    /// Move any existing plan aside as `plan_{timestamp}_{rand6}.yaml`.
    fn archive_plan(&self, item_id: &ItemId) -> Result<()> {
        let plan_path = self.ledger.layout().plan_file(item_id);
        if !plan_path.exists() {
            return Ok(());
        }
        let archive_name = format!(
            "plan_{}_{}.yaml",
            Utc::now().format("%Y%m%d%H%M%S"),
            rand6()
        );
        let archive_path = self
            .ledger
            .layout()
            .workspace_root(item_id)
            .join(archive_name);
        std::fs::rename(&plan_path, &archive_path)?;
        info!(item = %item_id, archive = %archive_path.display(), "previous plan archived");
        Ok(())
    }
}

struct PrInfo {
    number: u64,
    url: String,
    repo: Option<String>,
}

/// The PR to receive reviews from: the most recent `pr_created` for the
/// requested repository, else the most recent one overall.
fn find_pr(events: &[EventRecord], repo: Option<&str>) -> Option<PrInfo> {
    events.iter().rev().find_map(|e| match &e.kind {
        EventKind::PrCreated {
            repo: pr_repo,
            pr_url,
            pr_number,
            ..
        } if repo.is_none() || repo == Some(pr_repo.as_str()) => Some(PrInfo {
            number: *pr_number,
            url: pr_url.clone(),
            repo: Some(pr_repo.clone()),
        }),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::AgentStatus;

    fn pr_event(item_id: &ItemId, repo: &str, number: u64) -> EventRecord {
        EventRecord::item(
            item_id,
            EventKind::PrCreated {
                repo: repo.into(),
                pr_url: format!("https://example.com/{repo}/pull/{number}"),
                pr_number: number,
                branch: "b".into(),
                commit: "c".into(),
            },
        )
    }

    #[test]
    fn find_pr_prefers_requested_repo() {
        let item_id = ItemId::new("ITEM-0EEE0000");
        let events = vec![
            pr_event(&item_id, "frontend", 1),
            pr_event(&item_id, "backend", 2),
        ];

        let pr = find_pr(&events, Some("frontend")).unwrap();
        assert_eq!(pr.number, 1);

        // Without a repo, the latest PR wins.
        let pr = find_pr(&events, None).unwrap();
        assert_eq!(pr.number, 2);

        assert!(find_pr(&events, Some("mobile")).is_none());
        assert!(find_pr(&[], None).is_none());
    }

    #[test]
    fn receiver_activity_is_derived_from_ids() {
        let item_id = ItemId::new("ITEM-0EEE0001");
        let receiver = AgentId::new("agent-review-receiver--1a2b3c");
        let events = vec![EventRecord::agent(
            &item_id,
            &receiver,
            EventKind::AgentStarted {
                role: "review-receiver".into(),
                repo: None,
                pid: 7,
            },
        )];

        let statuses = derive_agent_statuses(&events);
        assert_eq!(statuses[&receiver], AgentStatus::Running);
        assert!(statuses
            .iter()
            .any(|(id, s)| s.is_active() && id.parse_role() == Some("review-receiver")));
    }
}
