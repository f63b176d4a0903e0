//! Items and their repository configurations.
//!
//! An item is a work unit covering one or more repositories. Its identity
//! and repository list are fixed at creation; only the human-facing fields
//! (name, description, design doc) may change afterwards.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ItemId;

/// How a local repository is staged into the item workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Directory symlink, atomically replacing any prior entry.
    Symlink,
    /// Recursive copy.
    Copy,
}

/// Where a repository comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepositorySource {
    Remote {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_branch: Option<String>,
        #[serde(default)]
        submodules: bool,
        /// Branch the agents work on. Defaulted at item creation from the
        /// item id and directory name when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        work_branch: Option<String>,
    },
    Local {
        path: PathBuf,
        link_mode: LinkMode,
    },
}

/// One repository of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Directory name inside the item workspace; unique within the item.
    pub directory_name: String,
    /// Free-form developer-role label (`front`, `back`, `docs`, ...).
    pub role: String,
    #[serde(flatten)]
    pub source: RepositorySource,
}

impl RepositoryConfig {
    /// The deterministic default work branch for a remote repository.
    pub fn default_work_branch(item_id: &ItemId, directory_name: &str) -> String {
        format!(
            "convoy/{}/{directory_name}",
            item_id.as_str().to_lowercase()
        )
    }

    /// The effective work branch, if this is a remote repository.
    pub fn work_branch(&self, item_id: &ItemId) -> Option<String> {
        match &self.source {
            RepositorySource::Remote { work_branch, .. } => Some(
                work_branch
                    .clone()
                    .unwrap_or_else(|| Self::default_work_branch(item_id, &self.directory_name)),
            ),
            RepositorySource::Local { .. } => None,
        }
    }
}

/// A development work unit covering one or more repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design_doc: Option<String>,
    pub repositories: Vec<RepositoryConfig>,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Look up a repository by directory name.
    pub fn repository(&self, directory_name: &str) -> Option<&RepositoryConfig> {
        self.repositories
            .iter()
            .find(|r| r.directory_name == directory_name)
    }

    /// The set of role labels carried by the item's repositories.
    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.repositories.iter().map(|r| r.role.as_str()).collect();
        roles.sort_unstable();
        roles.dedup();
        roles
    }
}

/// A saved repository in the catalog, reusable across items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedRepository {
    /// Display name shown when picking from the catalog.
    pub name: String,
    #[serde(flatten)]
    pub config: RepositoryConfig,
}

/// The catalog persisted at `$DATA/repositories.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryCatalog {
    #[serde(default)]
    pub repositories: Vec<SavedRepository>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(name: &str, role: &str) -> RepositoryConfig {
        RepositoryConfig {
            directory_name: name.into(),
            role: role.into(),
            source: RepositorySource::Remote {
                url: format!("https://example.com/{name}.git"),
                base_branch: None,
                submodules: false,
                work_branch: None,
            },
        }
    }

    #[test]
    fn default_work_branch_is_deterministic() {
        let item_id = ItemId::new("ITEM-DEADBEEF");
        let repo = remote("frontend", "front");
        assert_eq!(
            repo.work_branch(&item_id),
            Some("convoy/item-deadbeef/frontend".to_string())
        );
    }

    #[test]
    fn explicit_work_branch_wins() {
        let item_id = ItemId::new("ITEM-DEADBEEF");
        let repo = RepositoryConfig {
            directory_name: "frontend".into(),
            role: "front".into(),
            source: RepositorySource::Remote {
                url: "https://example.com/frontend.git".into(),
                base_branch: Some("develop".into()),
                submodules: false,
                work_branch: Some("feature/login".into()),
            },
        };
        assert_eq!(repo.work_branch(&item_id), Some("feature/login".into()));
    }

    #[test]
    fn local_repo_has_no_work_branch() {
        let repo = RepositoryConfig {
            directory_name: "docs".into(),
            role: "docs".into(),
            source: RepositorySource::Local {
                path: PathBuf::from("/srv/docs"),
                link_mode: LinkMode::Symlink,
            },
        };
        assert_eq!(repo.work_branch(&ItemId::new("ITEM-00000000")), None);
    }

    #[test]
    fn item_yaml_round_trip() {
        let item = Item {
            id: ItemId::new("ITEM-CAFEBABE"),
            name: "checkout revamp".into(),
            description: "new checkout flow".into(),
            design_doc: Some("# Design\n...".into()),
            repositories: vec![remote("frontend", "front"), remote("backend", "back")],
            created_at: Utc::now(),
        };

        let yaml = serde_yaml::to_string(&item).unwrap();
        let back: Item = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.id, item.id);
        assert_eq!(back.repositories.len(), 2);
        assert_eq!(back.repositories[0].directory_name, "frontend");
    }

    #[test]
    fn roles_are_deduplicated() {
        let item = Item {
            id: ItemId::new("ITEM-00000001"),
            name: "x".into(),
            description: String::new(),
            design_doc: None,
            repositories: vec![
                remote("a", "front"),
                remote("b", "front"),
                remote("c", "back"),
            ],
            created_at: Utc::now(),
        };
        assert_eq!(item.roles(), vec!["back", "front"]);
    }

    #[test]
    fn repository_lookup() {
        let item = Item {
            id: ItemId::new("ITEM-00000002"),
            name: "x".into(),
            description: String::new(),
            design_doc: None,
            repositories: vec![remote("frontend", "front")],
            created_at: Utc::now(),
        };
        assert!(item.repository("frontend").is_some());
        assert!(item.repository("nope").is_none());
    }
}
