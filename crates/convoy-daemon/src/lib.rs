//! The Convoy orchestration engine.
//!
//! Convoy drives multi-repository development workflows with a fleet of
//! long-lived, PTY-attached AI-assistant processes. From a design document
//! it derives a task plan, spawns one dev agent per repository, runs a
//! bounded review loop, and opens one draft pull request per repository.
//! Everything that happened is an event in an append-only per-item log;
//! every status anyone sees is derived from that log.
//!
//! [`ConvoyDaemon`] wires the components together and exposes the request
//! surface transports call into. The pieces compose bottom-up:
//!
//! - [`manager`]: agent lifecycle, signal bridging, orphan recovery
//! - [`items`]: item lifecycle and workspace staging
//! - [`watcher`]: plan-artifact detection
//! - [`worker`]: the dev / review / finalize phase controller
//! - [`review`]: review-receive cycles behind per-item FIFO locks
//! - [`gitpr`]: push + draft-PR execution
//! - [`snapshot`]: periodic git snapshots

pub mod gitcmd;
pub mod gitpr;
pub mod items;
pub mod locks;
pub mod manager;
pub mod prompts;
pub mod review;
pub mod snapshot;
pub mod watcher;
pub mod worker;

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use tracing::info;

use convoy_ledger::{
    derive_agent_statuses, derive_item_status, pending_approvals, EventBus, ItemLedger,
};
use convoy_types::{
    AgentId, AgentStatus, ConvoyConfig, ConvoyError, DataLayout, EventId, EventRecord, Item,
    ItemId, ItemStatus, Result,
};

use gitpr::GitPrExecutor;
use items::{ItemManager, NewItem};
use manager::AgentManager;
use review::ReviewReceiveController;
use snapshot::GitSnapshots;
use worker::WorkerController;

/// Install the process-wide tracing subscriber from the configured filter.
pub fn init_logging(config: &ConvoyConfig) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// The assembled engine: every collaborator wired at construction.
pub struct ConvoyDaemon {
    config: ConvoyConfig,
    bus: EventBus,
    ledger: ItemLedger,
    agents: Arc<AgentManager>,
    items: Arc<ItemManager>,
    worker: Arc<WorkerController>,
    review: ReviewReceiveController,
    gitpr: GitPrExecutor,
    snapshots: Arc<GitSnapshots>,
}

impl ConvoyDaemon {
    /// Build the engine over the configured data root and recover any
    /// orphaned agents from a previous process.
    pub fn new(config: ConvoyConfig) -> Result<Self> {
        let layout = DataLayout::new(&config.data_dir);
        std::fs::create_dir_all(layout.root())?;

        let bus = EventBus::new();
        let ledger = ItemLedger::new(layout, bus.clone());
        let agents = AgentManager::new(ledger.clone());
        let items = Arc::new(ItemManager::new(ledger.clone(), Arc::clone(&agents)));
        let snapshots = GitSnapshots::new(ledger.clone());
        let worker = WorkerController::new(
            ledger.clone(),
            Arc::clone(&agents),
            Arc::clone(&snapshots),
        );
        let review =
            ReviewReceiveController::new(ledger.clone(), Arc::clone(&agents), Arc::clone(&items));
        let gitpr = GitPrExecutor::new(ledger.clone());

        let orphans = agents.recover_orphans()?;
        if orphans > 0 {
            info!(orphans, "orphaned agents stopped during startup");
        }

        Ok(Self {
            config,
            bus,
            ledger,
            agents,
            items,
            worker,
            review,
            gitpr,
            snapshots,
        })
    }

    pub fn config(&self) -> &ConvoyConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ItemLedger {
        &self.ledger
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    // ----- items ---------------------------------------------------------

    /// Create an item, stage its workspace, and launch the planner. The
    /// staging and planning halves run on a background thread; the created
    /// item returns immediately.
    pub fn create_item(&self, new: NewItem) -> Result<Item> {
        let item = self.items.create_item(new)?;
        let items = Arc::clone(&self.items);
        let background = item.clone();
        std::thread::Builder::new()
            .name(format!("setup-{}", item.id))
            .spawn(move || {
                if let Err(e) = items.setup_and_plan(&background) {
                    tracing::warn!(item = %background.id, error = %e, "workspace setup failed");
                }
            })
            .map_err(|e| ConvoyError::Workspace(format!("failed to spawn setup thread: {e}")))?;
        Ok(item)
    }

    pub fn get_item(&self, item_id: &ItemId) -> Result<(Item, ItemStatus)> {
        let item = self.items.load_item(item_id)?;
        let events = self.ledger.read_item(item_id)?;
        Ok((item, derive_item_status(&events)))
    }

    pub fn list_items(&self) -> Result<Vec<(Item, ItemStatus)>> {
        self.items
            .list_items()?
            .into_iter()
            .map(|item| {
                let events = self.ledger.read_item(&item.id)?;
                let status = derive_item_status(&events);
                Ok((item, status))
            })
            .collect()
    }

    pub fn update_item(
        &self,
        item_id: &ItemId,
        name: Option<String>,
        description: Option<String>,
        design_doc: Option<String>,
    ) -> Result<Item> {
        self.items.update_item(item_id, name, description, design_doc)
    }

    /// Delete an item: agents and snapshots first, then the directory.
    pub fn delete_item(&self, item_id: &ItemId) -> Result<()> {
        self.snapshots.stop(item_id);
        self.items.delete_item(item_id)
    }

    pub fn retry_setup(&self, item_id: &ItemId) -> Result<()> {
        self.items.retry_setup(item_id)
    }

    // ----- plan ----------------------------------------------------------

    pub fn plan_path(&self, item_id: &ItemId) -> std::path::PathBuf {
        self.ledger.layout().plan_file(item_id)
    }

    pub fn get_plan_content(&self, item_id: &ItemId) -> Result<String> {
        let path = self.plan_path(item_id);
        if !path.exists() {
            return Err(ConvoyError::Validation(format!(
                "item {item_id} has no plan"
            )));
        }
        Ok(std::fs::read_to_string(path)?)
    }

    /// Replace the plan file, requiring the new content to validate.
    pub fn update_plan_content(&self, item_id: &ItemId, content: &str) -> Result<()> {
        let item = self.items.load_item(item_id)?;
        let plan: convoy_types::Plan = serde_yaml::from_str(content)
            .map_err(|e| ConvoyError::Validation(format!("plan does not parse: {e}")))?;
        plan.validate(&item)?;
        std::fs::write(self.plan_path(item_id), content)?;
        Ok(())
    }

    // ----- worker / prs --------------------------------------------------

    /// Run the dev → review → finalize phases on a background thread.
    pub fn run_worker(&self, item_id: &ItemId) -> Result<()> {
        let item = self.items.load_item(item_id)?;
        let worker = Arc::clone(&self.worker);
        std::thread::Builder::new()
            .name(format!("worker-{item_id}"))
            .spawn(move || {
                if let Err(e) = worker.run_item(&item) {
                    tracing::warn!(item = %item.id, error = %e, "worker run failed");
                }
            })
            .map_err(|e| ConvoyError::Pilot(format!("failed to spawn worker thread: {e}")))?;
        Ok(())
    }

    /// Push and open draft PRs for every repository of the item, now.
    pub fn create_prs(&self, item_id: &ItemId) -> Result<()> {
        let item = self.items.load_item(item_id)?;
        self.gitpr.create_prs_for_item(&item);
        Ok(())
    }

    pub fn start_review_receive(
        &self,
        item_id: &ItemId,
        repo: Option<&str>,
    ) -> Result<AgentId> {
        self.review.start_review_receive(item_id, repo)
    }

    // ----- agents --------------------------------------------------------

    pub fn agent_statuses(&self, item_id: &ItemId) -> Result<Vec<(AgentId, AgentStatus)>> {
        let events = self.ledger.read_item(item_id)?;
        let mut statuses: Vec<(AgentId, AgentStatus)> =
            derive_agent_statuses(&events).into_iter().collect();
        // Live agents may be ahead of the log by an in-flight transition.
        for (agent_id, status) in &mut statuses {
            if let Some(live) = self.agents.agent_status(agent_id) {
                *status = live;
            }
        }
        Ok(statuses)
    }

    pub fn start_agent(
        &self,
        item_id: &ItemId,
        role: &str,
        repo: Option<&str>,
        prompt: &str,
    ) -> Result<AgentId> {
        let item = self.items.load_item(item_id)?;
        let working_dir = match repo {
            Some(repo) => {
                if item.repository(repo).is_none() {
                    return Err(ConvoyError::Validation(format!(
                        "item {item_id} has no repository '{repo}'"
                    )));
                }
                self.ledger.layout().repo_workspace(item_id, repo)
            }
            None => self.ledger.layout().workspace_root(item_id),
        };
        self.agents
            .start_agent(&item, role, repo, &working_dir, prompt)
    }

    pub fn stop_agent(&self, agent_id: &AgentId) -> Result<()> {
        self.agents.stop_agent(agent_id)
    }

    pub fn send_agent_input(&self, agent_id: &AgentId, text: &str) -> Result<()> {
        self.agents.send_input(agent_id, text)
    }

    pub fn resize_agent(&self, agent_id: &AgentId, cols: u16, rows: u16) -> Result<()> {
        self.agents.resize(agent_id, cols, rows)
    }

    /// Recent terminal output of a live agent, oldest line first.
    pub fn agent_output(&self, agent_id: &AgentId, lines: usize) -> Result<Vec<String>> {
        let handle = self
            .agents
            .handle(agent_id)
            .ok_or_else(|| ConvoyError::Validation(format!("no live agent {agent_id}")))?;
        Ok(handle.recent_output(lines))
    }

    // ----- approvals -----------------------------------------------------

    pub fn pending_approvals(&self, item_id: &ItemId) -> Result<Vec<EventRecord>> {
        let events = self.ledger.read_item(item_id)?;
        Ok(pending_approvals(&events).into_iter().cloned().collect())
    }

    pub fn decide_approval(
        &self,
        item_id: &ItemId,
        request_event_id: &EventId,
        approve: bool,
        reason: Option<String>,
    ) -> Result<()> {
        self.agents
            .decide_approval(item_id, request_event_id, approve, reason)
    }

    pub fn batch_decide(
        &self,
        item_id: &ItemId,
        request_event_ids: &[EventId],
        approve: bool,
        reason: Option<String>,
    ) -> Vec<(EventId, Result<()>)> {
        request_event_ids
            .iter()
            .map(|id| {
                let result =
                    self.agents
                        .decide_approval(item_id, id, approve, reason.clone());
                (id.clone(), result)
            })
            .collect()
    }

    // ----- streaming -----------------------------------------------------

    /// Live event stream for one item. History comes from the ledger.
    pub fn subscribe_item(&self, item_id: &ItemId) -> Receiver<EventRecord> {
        self.bus.subscribe_item(item_id)
    }

    /// Live event stream for everything.
    pub fn subscribe_all(&self) -> Receiver<EventRecord> {
        self.bus.subscribe_all()
    }
}
