//! Temp data roots and item builders.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use tempfile::TempDir;

use convoy_ledger::{EventBus, ItemLedger};
use convoy_types::{
    DataLayout, Item, ItemId, LinkMode, RepositoryConfig, RepositorySource,
};

/// A temp data root wired like production: layout, bus, ledger.
pub struct TestBed {
    _tempdir: TempDir,
    pub layout: DataLayout,
    pub bus: EventBus,
    pub ledger: ItemLedger,
}

impl TestBed {
    pub fn new() -> Self {
        let tempdir = TempDir::new().expect("temp data root");
        let layout = DataLayout::new(tempdir.path());
        let bus = EventBus::new();
        let ledger = ItemLedger::new(layout.clone(), bus.clone());
        Self {
            _tempdir: tempdir,
            layout,
            bus,
            ledger,
        }
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Persist an item config the way the item manager would.
    pub fn persist_item(&self, item: &Item) {
        let path = self.layout.item_config(&item.id);
        std::fs::create_dir_all(path.parent().unwrap()).expect("item dir");
        std::fs::write(path, serde_yaml::to_string(item).expect("item serializes"))
            .expect("item.yaml");
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for items over local placeholder repositories.
pub struct ItemBuilder {
    id: ItemId,
    name: String,
    description: String,
    repositories: Vec<RepositoryConfig>,
}

impl ItemBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            id: ItemId::generate(),
            name: name.to_string(),
            description: String::new(),
            repositories: Vec::new(),
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = ItemId::new(id);
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Add a local repository staged by copy.
    pub fn local_repo(mut self, directory_name: &str, role: &str, source: &Path) -> Self {
        self.repositories.push(RepositoryConfig {
            directory_name: directory_name.to_string(),
            role: role.to_string(),
            source: RepositorySource::Local {
                path: source.to_path_buf(),
                link_mode: LinkMode::Copy,
            },
        });
        self
    }

    pub fn build(self) -> Item {
        Item {
            id: self.id,
            name: self.name,
            description: self.description,
            design_doc: None,
            repositories: self.repositories,
            created_at: Utc::now(),
        }
    }
}

/// Initialize a git repository with one commit on the given branch.
pub fn init_git_repo(dir: &Path, branch: &str) -> PathBuf {
    std::fs::create_dir_all(dir).expect("repo dir");
    git(dir, &["init", &format!("--initial-branch={branch}")]);
    git(dir, &["config", "user.email", "dev@example.com"]);
    git(dir, &["config", "user.name", "Dev"]);
    std::fs::write(dir.join("README.md"), "# fixture\n").expect("readme");
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "initial commit"]);
    dir.to_path_buf()
}

/// Create and check out a branch in an existing fixture repository.
pub fn git_checkout_new_branch(dir: &Path, branch: &str) {
    git(dir, &["checkout", "-b", branch]);
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        status.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&status.stderr)
    );
}
