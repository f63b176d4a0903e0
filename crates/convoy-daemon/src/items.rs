//! Item lifecycle and workspace staging.
//!
//! The item manager owns the on-disk item directory from creation to
//! deletion. Staging clones remote repositories (one thread each) and links
//! or copies local ones; when every repository is in place the planner is
//! started automatically.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use convoy_ledger::ItemLedger;
use convoy_types::{
    ConvoyError, EventKind, EventRecord, Item, ItemId, LinkMode, RepositoryCatalog,
    RepositoryConfig, RepositorySource, Result,
};

use crate::gitcmd::{copy_dir_recursive, remove_entry, run_git};
use crate::manager::AgentManager;
use crate::prompts;
use crate::watcher::{start_plan_watcher, PlanWatcherConfig};

/// Inputs for [`ItemManager::create_item`].
#[derive(Debug, Clone)]
pub struct NewItem {
    pub name: String,
    pub description: String,
    pub design_doc: Option<String>,
    pub repositories: Vec<RepositoryConfig>,
}

pub struct ItemManager {
    ledger: ItemLedger,
    agents: Arc<AgentManager>,
}

impl ItemManager {
    pub fn new(ledger: ItemLedger, agents: Arc<AgentManager>) -> Self {
        Self { ledger, agents }
    }

    /// Allocate an id, persist the configuration, record `item_created`.
    pub fn create_item(&self, new: NewItem) -> Result<Item> {
        if new.name.trim().is_empty() {
            return Err(ConvoyError::Validation("item name is required".into()));
        }
        if new.repositories.is_empty() {
            return Err(ConvoyError::Validation(
                "an item needs at least one repository".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for repo in &new.repositories {
            let name = repo.directory_name.as_str();
            if name.is_empty() || name.contains('/') || name.contains("..") {
                return Err(ConvoyError::Validation(format!(
                    "'{name}' is not a valid repository directory name"
                )));
            }
            if !seen.insert(name) {
                return Err(ConvoyError::Validation(format!(
                    "duplicate repository directory name '{name}'"
                )));
            }
        }

        let item = Item {
            id: ItemId::generate(),
            name: new.name,
            description: new.description,
            design_doc: new.design_doc,
            repositories: new.repositories,
            created_at: Utc::now(),
        };

        self.persist(&item)?;
        self.ledger.record(&EventRecord::item(
            &item.id,
            EventKind::ItemCreated {
                name: item.name.clone(),
            },
        ))?;

        info!(item = %item.id, name = item.name, repos = item.repositories.len(), "item created");
        Ok(item)
    }

    pub fn load_item(&self, item_id: &ItemId) -> Result<Item> {
        let path = self.ledger.layout().item_config(item_id);
        if !path.exists() {
            return Err(ConvoyError::Validation(format!("no such item {item_id}")));
        }
        let yaml = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&yaml)?)
    }

    pub fn list_items(&self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        for item_id in self.ledger.layout().list_item_ids()? {
            match self.load_item(&item_id) {
                Ok(item) => items.push(item),
                Err(e) => warn!(item = %item_id, error = %e, "unreadable item config"),
            }
        }
        Ok(items)
    }

    /// Update the mutable fields. Identity and repositories never change.
    pub fn update_item(
        &self,
        item_id: &ItemId,
        name: Option<String>,
        description: Option<String>,
        design_doc: Option<String>,
    ) -> Result<Item> {
        let mut item = self.load_item(item_id)?;
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(ConvoyError::Validation("item name is required".into()));
            }
            item.name = name;
        }
        if let Some(description) = description {
            item.description = description;
        }
        if let Some(design_doc) = design_doc {
            item.design_doc = Some(design_doc);
        }
        self.persist(&item)?;
        Ok(item)
    }

    /// Stop everything attached to the item, then remove its directory.
    pub fn delete_item(&self, item_id: &ItemId) -> Result<()> {
        let stopped = self.agents.stop_item_agents(item_id);
        info!(item = %item_id, stopped, "stopping agents before delete");
        let dir = self.ledger.layout().item_dir(item_id);
        remove_entry(&dir)?;
        Ok(())
    }

    /// Stage every repository in parallel, then auto-start the planner.
    ///
    /// A staging failure leaves the failure events in the log and returns
    /// the first error; a planner-start failure is recorded but does not
    /// tear the item down.
    pub fn setup_workspace(&self, item: &Item) -> Result<()> {
        let workspace = self.ledger.layout().workspace_root(&item.id);
        std::fs::create_dir_all(&workspace)?;

        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = item
                .repositories
                .iter()
                .map(|repo| {
                    let workspace = workspace.clone();
                    scope.spawn(move || self.stage_repository(item, repo, &workspace))
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("stage thread panicked")).collect()
        });

        for result in results {
            result?;
        }
        Ok(())
    }

    /// Stage repositories and, on success, launch the planning cycle.
    pub fn setup_and_plan(self: &Arc<Self>, item: &Item) -> Result<()> {
        self.setup_workspace(item)?;
        self.start_planner(item);
        Ok(())
    }

    /// Re-run staging after a failure. Existing entries are replaced.
    pub fn retry_setup(self: &Arc<Self>, item_id: &ItemId) -> Result<()> {
        let item = self.load_item(item_id)?;
        self.setup_and_plan(&item)
    }

    /// Start the planner agent and its plan watcher. Failures are recorded
    /// as an `error` event, not propagated.
    pub fn start_planner(self: &Arc<Self>, item: &Item) {
        let workspace = self.ledger.layout().workspace_root(&item.id);
        let prompt = prompts::planner_prompt(item);
        match self
            .agents
            .start_agent(item, "planner", None, &workspace, &prompt)
        {
            Ok(agent_id) => {
                info!(item = %item.id, agent = %agent_id, "planner started");
                start_plan_watcher(
                    Arc::clone(&self.agents),
                    item.clone(),
                    "planner".to_string(),
                    None,
                    PlanWatcherConfig::default(),
                );
            }
            Err(e) => {
                warn!(item = %item.id, error = %e, "planner failed to start");
                let event = EventRecord::item(
                    &item.id,
                    EventKind::Error {
                        message: format!("planner failed to start: {e}"),
                    },
                );
                if let Err(record_err) = self.ledger.record(&event) {
                    warn!(item = %item.id, error = %record_err, "could not record planner failure");
                }
            }
        }
    }

    fn stage_repository(
        &self,
        item: &Item,
        repo: &RepositoryConfig,
        workspace: &Path,
    ) -> Result<()> {
        let target = workspace.join(&repo.directory_name);
        // Retry semantics: replace whatever a previous attempt left behind.
        remove_entry(&target)?;

        match &repo.source {
            RepositorySource::Remote {
                url,
                base_branch,
                submodules,
                ..
            } => {
                self.ledger.record(&EventRecord::item(
                    &item.id,
                    EventKind::CloneStarted {
                        repo: repo.directory_name.clone(),
                        url: url.clone(),
                    },
                ))?;

                let result = self.clone_remote(
                    item,
                    repo,
                    url,
                    base_branch.as_deref(),
                    *submodules,
                    &target,
                );
                let (success, error) = match &result {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                };
                self.ledger.record(&EventRecord::item(
                    &item.id,
                    EventKind::CloneCompleted {
                        repo: repo.directory_name.clone(),
                        success,
                        error,
                    },
                ))?;
                result
            }
            RepositorySource::Local { path, link_mode } => {
                self.ledger.record(&EventRecord::item(
                    &item.id,
                    EventKind::WorkspaceSetupStarted {
                        repo: repo.directory_name.clone(),
                        path: path.display().to_string(),
                        link_mode: *link_mode,
                    },
                ))?;

                let result = stage_local(path, *link_mode, &target);
                let (success, error) = match &result {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                };
                self.ledger.record(&EventRecord::item(
                    &item.id,
                    EventKind::WorkspaceSetupCompleted {
                        repo: repo.directory_name.clone(),
                        success,
                        error,
                    },
                ))?;
                result
            }
        }
    }

    fn clone_remote(
        &self,
        item: &Item,
        repo: &RepositoryConfig,
        url: &str,
        base_branch: Option<&str>,
        submodules: bool,
        target: &Path,
    ) -> Result<()> {
        let workspace = target
            .parent()
            .ok_or_else(|| ConvoyError::Workspace("target has no parent".into()))?;
        let target_name = repo.directory_name.as_str();

        let mut args = vec!["clone"];
        if submodules {
            args.push("--recurse-submodules");
        }
        if let Some(branch) = base_branch {
            args.push("--branch");
            args.push(branch);
        }
        args.push(url);
        args.push(target_name);
        run_git(workspace, &args)?;

        if let Some(work_branch) = repo.work_branch(&item.id) {
            run_git(target, &["checkout", "-b", &work_branch])?;
        }
        Ok(())
    }

    fn persist(&self, item: &Item) -> Result<()> {
        let path = self.ledger.layout().item_config(&item.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(item)?)?;
        Ok(())
    }

    /// Load the saved-repositories catalog; missing file means empty.
    pub fn load_catalog(&self) -> Result<RepositoryCatalog> {
        let path = self.ledger.layout().repository_catalog();
        if !path.exists() {
            return Ok(RepositoryCatalog::default());
        }
        Ok(serde_yaml::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn save_catalog(&self, catalog: &RepositoryCatalog) -> Result<()> {
        let path = self.ledger.layout().repository_catalog();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(catalog)?)?;
        Ok(())
    }
}

/// Symlink or copy a local repository into the workspace.
fn stage_local(source: &Path, link_mode: LinkMode, target: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(ConvoyError::Workspace(format!(
            "local repository path {} is not a directory",
            source.display()
        )));
    }
    match link_mode {
        LinkMode::Symlink => {
            std::os::unix::fs::symlink(source, target)?;
            Ok(())
        }
        LinkMode::Copy => copy_dir_recursive(source, target),
    }
}
