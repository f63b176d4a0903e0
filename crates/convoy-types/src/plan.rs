//! Task plans produced by planner agents.
//!
//! A plan is the declarative work list for one item: a version tag, the
//! owning item id, a summary, and an ordered list of tasks. Planner and
//! review-receiver agents write it to `plan.yaml` in the item workspace; the
//! worker controller consumes it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ConvoyError, Result};
use crate::ids::ItemId;
use crate::item::Item;
use crate::REVIEW_ROLE;

pub const PLAN_VERSION: &str = "1.0";

/// One task of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Role label of the agent that should execute this task.
    #[serde(default)]
    pub agent: String,
    /// Directory name of the target repository.
    #[serde(default)]
    pub repository: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// A validated work list for an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub version: String,
    pub item_id: ItemId,
    #[serde(default)]
    pub summary: String,
    pub tasks: Vec<PlanTask>,
}

impl Plan {
    /// Validate this plan against the item it claims to belong to.
    ///
    /// Every failure is a [`ConvoyError::Validation`]: missing version, item
    /// id mismatch, duplicate task ids, missing title or agent, an agent
    /// role outside the item's role set plus `review`, a repository outside
    /// the item's repository set, or a dependency pointing outside the plan.
    pub fn validate(&self, item: &Item) -> Result<()> {
        if self.version.is_empty() {
            return Err(ConvoyError::Validation("plan is missing a version".into()));
        }
        if self.item_id != item.id {
            return Err(ConvoyError::Validation(format!(
                "plan belongs to {} but item is {}",
                self.item_id, item.id
            )));
        }

        let roles: HashSet<&str> = item
            .roles()
            .into_iter()
            .chain(std::iter::once(REVIEW_ROLE))
            .collect();
        let repos: HashSet<&str> = item
            .repositories
            .iter()
            .map(|r| r.directory_name.as_str())
            .collect();
        let task_ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();

        if task_ids.len() != self.tasks.len() {
            return Err(ConvoyError::Validation("plan has duplicate task ids".into()));
        }

        for task in &self.tasks {
            if task.title.is_empty() {
                return Err(ConvoyError::Validation(format!(
                    "task {} is missing a title",
                    task.id
                )));
            }
            if task.agent.is_empty() {
                return Err(ConvoyError::Validation(format!(
                    "task {} is missing an agent role",
                    task.id
                )));
            }
            if !roles.contains(task.agent.as_str()) {
                return Err(ConvoyError::Validation(format!(
                    "task {} names unknown agent role '{}'",
                    task.id, task.agent
                )));
            }
            if !repos.contains(task.repository.as_str()) {
                return Err(ConvoyError::Validation(format!(
                    "task {} names unknown repository '{}'",
                    task.id, task.repository
                )));
            }
            for dep in &task.dependencies {
                if !task_ids.contains(dep.as_str()) {
                    return Err(ConvoyError::Validation(format!(
                        "task {} depends on unknown task '{dep}'",
                        task.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Tasks targeting the given repository.
    pub fn tasks_for_repository<'a>(
        &'a self,
        directory_name: &'a str,
    ) -> impl Iterator<Item = &'a PlanTask> {
        self.tasks
            .iter()
            .filter(move |t| t.repository == directory_name)
    }
}
