//! Periodic git snapshots of item workspaces.
//!
//! While dev agents are working, a per-item ticker records the branch, head
//! commit, and dirty-file count of every repository every 20 seconds. Each
//! snapshot is best-effort: a failure becomes a `git_snapshot_error` event
//! and the ticker keeps going. Stopping an item stops its ticker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use convoy_ledger::ItemLedger;
use convoy_types::{EventKind, EventRecord, Item, ItemId};

use crate::gitcmd::run_git;

/// Interval between snapshot rounds.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(20);

/// Process-scoped registry of per-item snapshot tickers.
pub struct GitSnapshots {
    ledger: ItemLedger,
    running: Mutex<HashMap<ItemId, Arc<AtomicBool>>>,
    interval: Duration,
}

impl GitSnapshots {
    pub fn new(ledger: ItemLedger) -> Arc<Self> {
        Self::with_interval(ledger, SNAPSHOT_INTERVAL)
    }

    pub fn with_interval(ledger: ItemLedger, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            running: Mutex::new(HashMap::new()),
            interval,
        })
    }

    /// Start the ticker for an item; a second start is a no-op.
    pub fn start(self: &Arc<Self>, item: &Item) {
        let flag = Arc::new(AtomicBool::new(true));
        {
            let mut running = self.running.lock().expect("snapshot registry poisoned");
            if running.contains_key(&item.id) {
                debug!(item = %item.id, "snapshot ticker already running");
                return;
            }
            running.insert(item.id.clone(), Arc::clone(&flag));
        }

        let snapshots = Arc::clone(self);
        let item = item.clone();
        std::thread::Builder::new()
            .name(format!("git-snap-{}", item.id))
            .spawn(move || snapshots.tick_loop(item, flag))
            .map(|_| ())
            .unwrap_or_else(|e| warn!(error = %e, "failed to spawn snapshot thread"));
        info!("git snapshot ticker started");
    }

    /// Stop the ticker for an item.
    pub fn stop(&self, item_id: &ItemId) {
        let mut running = self.running.lock().expect("snapshot registry poisoned");
        if let Some(flag) = running.remove(item_id) {
            flag.store(false, Ordering::Release);
            info!(item = %item_id, "git snapshot ticker stopped");
        }
    }

    pub fn is_running(&self, item_id: &ItemId) -> bool {
        self.running
            .lock()
            .expect("snapshot registry poisoned")
            .contains_key(item_id)
    }

    fn tick_loop(self: Arc<Self>, item: Item, flag: Arc<AtomicBool>) {
        loop {
            self.snapshot_round(&item);

            // Sleep in slices so stop() takes effect quickly.
            let mut remaining = self.interval;
            while !remaining.is_zero() {
                if !flag.load(Ordering::Acquire) {
                    return;
                }
                let slice = remaining.min(Duration::from_millis(250));
                std::thread::sleep(slice);
                remaining -= slice;
            }
            if !flag.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// One round: the workspace root (when it is itself a repository) plus
    /// every staged repository.
    fn snapshot_round(&self, item: &Item) {
        let layout = self.ledger.layout();
        let workspace = layout.workspace_root(&item.id);

        if workspace.join(".git").exists() {
            self.snapshot_one(&item.id, &workspace, None);
        }
        for repo in &item.repositories {
            let dir = layout.repo_workspace(&item.id, &repo.directory_name);
            self.snapshot_one(&item.id, &dir, Some(repo.directory_name.as_str()));
        }
    }

    fn snapshot_one(&self, item_id: &ItemId, dir: &Path, repo: Option<&str>) {
        let event = match take_snapshot(dir) {
            Ok((branch, commit, dirty_files)) => EventRecord::item(
                item_id,
                EventKind::GitSnapshot {
                    repo: repo.map(str::to_string),
                    branch,
                    commit,
                    dirty_files,
                },
            ),
            Err(e) => EventRecord::item(
                item_id,
                EventKind::GitSnapshotError {
                    repo: repo.map(str::to_string),
                    message: e.to_string(),
                },
            ),
        };
        if let Err(e) = self.ledger.record(&event) {
            warn!(item = %item_id, error = %e, "failed to record git snapshot");
        }
    }
}

fn take_snapshot(
    dir: &Path,
) -> convoy_types::Result<(Option<String>, Option<String>, usize)> {
    let branch = run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).ok();
    // A repo with no commits yet has a branch but no HEAD commit.
    let commit = run_git(dir, &["rev-parse", "HEAD"]).ok();
    let status = run_git(dir, &["status", "--porcelain"])?;
    let dirty_files = status.lines().filter(|l| !l.trim().is_empty()).count();
    Ok((branch, commit, dirty_files))
}
