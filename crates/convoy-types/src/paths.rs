//! Canonical on-disk layout under the data root.
//!
//! Every path under `$DATA` is derived here. No other module concatenates
//! data paths by hand; doing so would silently fork the layout.

use std::path::{Path, PathBuf};

use crate::ids::{AgentId, ItemId};

pub const ITEM_CONFIG_FILE: &str = "item.yaml";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const PLAN_FILE: &str = "plan.yaml";
pub const REPOSITORY_CATALOG_FILE: &str = "repositories.yaml";
pub const REVIEW_FINDINGS_FILE: &str = "review_findings.json";

/// Deterministic mapping from identifiers to filesystem paths.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    pub fn item_dir(&self, item_id: &ItemId) -> PathBuf {
        self.items_dir().join(item_id.as_str())
    }

    pub fn item_config(&self, item_id: &ItemId) -> PathBuf {
        self.item_dir(item_id).join(ITEM_CONFIG_FILE)
    }

    pub fn item_events(&self, item_id: &ItemId) -> PathBuf {
        self.item_dir(item_id).join(EVENTS_FILE)
    }

    pub fn workspace_root(&self, item_id: &ItemId) -> PathBuf {
        self.item_dir(item_id).join("workspace")
    }

    pub fn repo_workspace(&self, item_id: &ItemId, repo: &str) -> PathBuf {
        self.workspace_root(item_id).join(repo)
    }

    pub fn plan_file(&self, item_id: &ItemId) -> PathBuf {
        self.workspace_root(item_id).join(PLAN_FILE)
    }

    pub fn agents_dir(&self, item_id: &ItemId) -> PathBuf {
        self.item_dir(item_id).join("agents")
    }

    pub fn agent_dir(&self, item_id: &ItemId, agent_id: &AgentId) -> PathBuf {
        self.agents_dir(item_id).join(agent_id.as_str())
    }

    pub fn agent_events(&self, item_id: &ItemId, agent_id: &AgentId) -> PathBuf {
        self.agent_dir(item_id, agent_id).join(EVENTS_FILE)
    }

    pub fn repository_catalog(&self) -> PathBuf {
        self.root.join(REPOSITORY_CATALOG_FILE)
    }

    /// List the ids of every item that has a directory on disk.
    pub fn list_item_ids(&self) -> std::io::Result<Vec<ItemId>> {
        let items_dir = self.items_dir();
        if !items_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(items_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(ItemId::new(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
