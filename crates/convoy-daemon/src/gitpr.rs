//! Per-repository push and draft-PR creation.
//!
//! The executor refuses to push protected branches (`main`, `master`, or
//! the remote's discovered default), reports repositories with nothing new
//! as `repo_no_changes`, and otherwise pushes the work branch and opens a
//! draft pull request with a templated title and body.

use std::path::Path;

use tracing::{info, warn};

use convoy_ledger::ItemLedger;
use convoy_types::paths::REVIEW_FINDINGS_FILE;
use convoy_types::{
    ConvoyError, EventKind, EventRecord, Item, RepositoryConfig, RepositorySource, Result,
};

use crate::gitcmd::{remove_entry, run_gh, run_git};

/// Branches never pushed regardless of what the remote says.
const PROTECTED_BRANCHES: [&str; 2] = ["main", "master"];

pub struct GitPrExecutor {
    ledger: ItemLedger,
}

impl GitPrExecutor {
    pub fn new(ledger: ItemLedger) -> Self {
        Self { ledger }
    }

    /// Run the executor for every repository in sequence. Failures become
    /// `error` events; the remaining repositories still get their turn.
    pub fn create_prs_for_item(&self, item: &Item) {
        for repo in &item.repositories {
            if let Err(e) = self.execute(item, repo) {
                warn!(item = %item.id, repo = repo.directory_name, error = %e, "pr creation failed");
                let event = EventRecord::item(
                    &item.id,
                    EventKind::Error {
                        message: format!("{}: {e}", repo.directory_name),
                    },
                );
                if let Err(record_err) = self.ledger.record(&event) {
                    warn!(item = %item.id, error = %record_err, "could not record pr failure");
                }
            }
        }
    }

    /// Push one repository's work branch and open a draft PR.
    pub fn execute(&self, item: &Item, repo: &RepositoryConfig) -> Result<()> {
        let dir = self
            .ledger
            .layout()
            .repo_workspace(&item.id, &repo.directory_name);
        if !dir.exists() {
            return Err(ConvoyError::Git(format!(
                "repository {} is not staged",
                repo.directory_name
            )));
        }

        let branch = run_git(&dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let default_branch = discover_default_branch(&dir);
        if PROTECTED_BRANCHES.contains(&branch.as_str())
            || default_branch.as_deref() == Some(branch.as_str())
        {
            return Err(ConvoyError::Git(format!(
                "refusing to push protected branch '{branch}'"
            )));
        }

        // Transient engine artifacts never belong in a PR.
        remove_entry(&dir.join(REVIEW_FINDINGS_FILE))?;

        let commit = run_git(&dir, &["rev-parse", "HEAD"])?;
        let base = base_branch(repo, default_branch.as_deref());

        if !self.has_changes(&dir, &base)? {
            info!(item = %item.id, repo = repo.directory_name, "no changes, skipping PR");
            self.ledger.record(&EventRecord::item(
                &item.id,
                EventKind::RepoNoChanges {
                    repo: repo.directory_name.clone(),
                },
            ))?;
            return Ok(());
        }

        run_git(&dir, &["push", "-u", "origin", &branch])?;

        let title = item.name.clone();
        let body = pr_body(item);
        let url = run_gh(
            &dir,
            &[
                "pr", "create", "--draft", "--title", &title, "--body", &body, "--base", &base,
            ],
        )?;
        let url = url
            .lines()
            .rev()
            .find(|l| l.contains("/pull/"))
            .unwrap_or(&url)
            .trim()
            .to_string();
        let number = parse_pr_number(&url).ok_or_else(|| {
            ConvoyError::Git(format!("could not parse PR number from '{url}'"))
        })?;

        self.ledger.record(&EventRecord::item(
            &item.id,
            EventKind::PrCreated {
                repo: repo.directory_name.clone(),
                pr_url: url.clone(),
                pr_number: number,
                branch: branch.clone(),
                commit,
            },
        ))?;
        info!(item = %item.id, repo = repo.directory_name, pr = number, branch, "draft PR created");
        Ok(())
    }

    /// Anything ahead of the base, or a dirty working tree, counts as
    /// changes worth a PR.
    fn has_changes(&self, dir: &Path, base: &str) -> Result<bool> {
        let dirty = !run_git(dir, &["status", "--porcelain"])?.is_empty();
        if dirty {
            return Ok(true);
        }

        // Prefer the remote-tracking base; fall back to the local ref for
        // repositories that have never fetched.
        let ahead = run_git(
            dir,
            &["rev-list", "--count", &format!("origin/{base}..HEAD")],
        )
        .or_else(|_| run_git(dir, &["rev-list", "--count", &format!("{base}..HEAD")]));
        match ahead {
            Ok(count) => Ok(count.trim() != "0"),
            // No usable base ref at all: treat local commits as changes.
            Err(_) => {
                let count = run_git(dir, &["rev-list", "--count", "HEAD"])?;
                Ok(count.trim() != "0")
            }
        }
    }
}

/// The remote's default branch: `origin/HEAD` first, then the host API.
fn discover_default_branch(dir: &Path) -> Option<String> {
    if let Ok(head) = run_git(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        return head
            .rsplit('/')
            .next()
            .map(str::to_string)
            .filter(|s| !s.is_empty());
    }
    run_gh(
        dir,
        &[
            "repo",
            "view",
            "--json",
            "defaultBranchRef",
            "--jq",
            ".defaultBranchRef.name",
        ],
    )
    .ok()
    .filter(|s| !s.is_empty())
}

fn base_branch(repo: &RepositoryConfig, discovered: Option<&str>) -> String {
    match &repo.source {
        RepositorySource::Remote {
            base_branch: Some(base),
            ..
        } => base.clone(),
        _ => discovered.unwrap_or("main").to_string(),
    }
}

fn pr_body(item: &Item) -> String {
    let mut sections = Vec::new();
    if !item.description.is_empty() {
        sections.push(item.description.clone());
    }
    if let Some(doc) = item.design_doc.as_deref().filter(|d| !d.is_empty()) {
        sections.push(format!("## Design\n\n{doc}"));
    }
    sections.push("---\nOpened automatically by Convoy.".to_string());
    sections.join("\n\n")
}

fn parse_pr_number(url: &str) -> Option<u64> {
    let tail = url.rsplit("/pull/").next()?;
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_ledger::{derive_item_status, EventBus};
    use convoy_types::{DataLayout, ItemId, ItemStatus, LinkMode};

    fn git_repo_on(dir: &Path, branch: &str) {
        std::fs::create_dir_all(dir).unwrap();
        run_git(dir, &["init", &format!("--initial-branch={branch}")]).unwrap();
        run_git(dir, &["config", "user.email", "dev@example.com"]).unwrap();
        run_git(dir, &["config", "user.name", "Dev"]).unwrap();
        std::fs::write(dir.join("f.txt"), "1").unwrap();
        run_git(dir, &["add", "."]).unwrap();
        run_git(dir, &["commit", "-m", "init"]).unwrap();
    }

    fn local_item(id: &str, repo_name: &str) -> Item {
        Item {
            id: ItemId::new(id),
            name: "push test".into(),
            description: "a change".into(),
            design_doc: None,
            repositories: vec![RepositoryConfig {
                directory_name: repo_name.into(),
                role: "dev".into(),
                source: RepositorySource::Local {
                    path: "/tmp".into(),
                    link_mode: LinkMode::Symlink,
                },
            }],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn protected_branch_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ItemLedger::new(DataLayout::new(tmp.path()), EventBus::new());
        let executor = GitPrExecutor::new(ledger.clone());
        let item = local_item("ITEM-0CCC0001", "repo");

        git_repo_on(&ledger.layout().repo_workspace(&item.id, "repo"), "main");

        let err = executor.execute(&item, &item.repositories[0]).unwrap_err();
        assert!(err.to_string().contains("protected branch 'main'"));

        // Through the batch path the refusal lands in the log and the item
        // derives as error with no pr_created.
        executor.create_prs_for_item(&item);
        let events = ledger.read_item(&item.id).unwrap();
        assert!(events.iter().any(|e| matches!(e.kind, EventKind::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e.kind, EventKind::PrCreated { .. })));
        assert_eq!(derive_item_status(&events), ItemStatus::Error);
    }

    #[test]
    fn master_is_also_protected() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ItemLedger::new(DataLayout::new(tmp.path()), EventBus::new());
        let executor = GitPrExecutor::new(ledger.clone());
        let item = local_item("ITEM-0CCC0002", "repo");

        git_repo_on(&ledger.layout().repo_workspace(&item.id, "repo"), "master");

        let err = executor.execute(&item, &item.repositories[0]).unwrap_err();
        assert!(err.to_string().contains("protected branch 'master'"));
    }

    #[test]
    fn clean_branch_with_no_new_commits_is_no_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ItemLedger::new(DataLayout::new(tmp.path()), EventBus::new());
        let executor = GitPrExecutor::new(ledger.clone());
        let item = local_item("ITEM-0CCC0003", "repo");

        let dir = ledger.layout().repo_workspace(&item.id, "repo");
        git_repo_on(&dir, "main");
        // Work branch at the same commit as main, clean tree.
        run_git(&dir, &["checkout", "-b", "convoy/item-0ccc0003/repo"]).unwrap();

        executor.execute(&item, &item.repositories[0]).unwrap();

        let events = ledger.read_item(&item.id).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::RepoNoChanges { repo } if repo == "repo")));
        assert!(!events.iter().any(|e| matches!(e.kind, EventKind::PrCreated { .. })));
    }

    #[test]
    fn review_findings_are_deleted_before_the_check() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ItemLedger::new(DataLayout::new(tmp.path()), EventBus::new());
        let executor = GitPrExecutor::new(ledger.clone());
        let item = local_item("ITEM-0CCC0004", "repo");

        let dir = ledger.layout().repo_workspace(&item.id, "repo");
        git_repo_on(&dir, "main");
        run_git(&dir, &["checkout", "-b", "convoy/item-0ccc0004/repo"]).unwrap();
        // An untracked findings file would otherwise read as a dirty tree.
        std::fs::write(dir.join(REVIEW_FINDINGS_FILE), "{}").unwrap();

        executor.execute(&item, &item.repositories[0]).unwrap();

        assert!(!dir.join(REVIEW_FINDINGS_FILE).exists());
        let events = ledger.read_item(&item.id).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, EventKind::RepoNoChanges { .. })));
    }

    #[test]
    fn unstaged_repository_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ItemLedger::new(DataLayout::new(tmp.path()), EventBus::new());
        let executor = GitPrExecutor::new(ledger);
        let item = local_item("ITEM-0CCC0005", "missing");

        let err = executor.execute(&item, &item.repositories[0]).unwrap_err();
        assert!(err.to_string().contains("not staged"));
    }

    #[test]
    fn pr_number_parsing() {
        assert_eq!(
            parse_pr_number("https://github.com/acme/app/pull/1234"),
            Some(1234)
        );
        assert_eq!(
            parse_pr_number("https://github.com/acme/app/pull/7#issuecomment-1"),
            Some(7)
        );
        assert_eq!(parse_pr_number("https://github.com/acme/app"), None);
    }

    #[test]
    fn pr_body_sections() {
        let mut item = local_item("ITEM-0CCC0006", "repo");
        item.design_doc = Some("use the new API".into());
        let body = pr_body(&item);
        assert!(body.contains("a change"));
        assert!(body.contains("## Design"));
        assert!(body.contains("Opened automatically by Convoy."));
    }
}
