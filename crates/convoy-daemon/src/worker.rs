//! The worker phase controller.
//!
//! Given a planned item, drives three phases:
//!
//! 1. **Dev** — one agent per repository with dev tasks, in parallel, plus
//!    the periodic git snapshots; waits for every dev agent to finish or
//!    report `TASKS_COMPLETED`.
//! 2. **Review** — per repository with review tasks, up to three rounds of
//!    review-then-fix between a review agent and the repository's dev agent.
//! 3. **Finalize** — stop whatever is still running and hand every
//!    repository to the PR executor in sequence.
//!
//! Every computed working directory must resolve inside the item workspace;
//! anything else aborts the phase.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use convoy_ledger::ItemLedger;
use convoy_types::paths::REVIEW_FINDINGS_FILE;
use convoy_types::{
    is_worker_role, AgentId, AgentStatus, ConvoyError, EventKind, EventRecord, Item, ItemId,
    Plan, PlanTask, ReviewFindings, Result, Severity, REVIEW_ROLE,
};

use crate::gitcmd::remove_entry;
use crate::gitpr::GitPrExecutor;
use crate::manager::AgentManager;
use crate::prompts;
use crate::snapshot::GitSnapshots;

/// Maximum review-then-fix rounds per repository.
pub const MAX_REVIEW_ITERATIONS: u32 = 3;

/// How often agent statuses are re-checked while waiting.
const WAIT_POLL: Duration = Duration::from_millis(250);

pub struct WorkerController {
    ledger: ItemLedger,
    agents: Arc<AgentManager>,
    snapshots: Arc<GitSnapshots>,
    gitpr: GitPrExecutor,
    /// Current dev agent per (item, repository). Mutated only here.
    active_dev: Mutex<HashMap<(ItemId, String), AgentId>>,
}

impl WorkerController {
    pub fn new(
        ledger: ItemLedger,
        agents: Arc<AgentManager>,
        snapshots: Arc<GitSnapshots>,
    ) -> Arc<Self> {
        let gitpr = GitPrExecutor::new(ledger.clone());
        Arc::new(Self {
            ledger,
            agents,
            snapshots,
            gitpr,
            active_dev: Mutex::new(HashMap::new()),
        })
    }

    /// The current dev agent for a repository, if one is recorded.
    pub fn active_dev_agent(&self, item_id: &ItemId, repo: &str) -> Option<AgentId> {
        self.active_dev
            .lock()
            .expect("active dev table poisoned")
            .get(&(item_id.clone(), repo.to_string()))
            .cloned()
    }

    /// Run all three phases for an item. Blocks until finalize completes.
    pub fn run_item(self: &Arc<Self>, item: &Item) -> Result<()> {
        let plan = self.load_plan(item)?;
        info!(item = %item.id, tasks = plan.tasks.len(), "worker phases starting");

        self.phase_dev(item, &plan)?;
        self.phase_review(item, &plan)?;
        self.phase_finalize(item);

        info!(item = %item.id, "worker phases finished");
        Ok(())
    }

    fn load_plan(&self, item: &Item) -> Result<Plan> {
        let path = self.ledger.layout().plan_file(&item.id);
        if !path.exists() {
            return Err(ConvoyError::Validation(format!(
                "item {} has no plan yet",
                item.id
            )));
        }
        let plan: Plan = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;
        plan.validate(item)?;
        Ok(plan)
    }

    /// Phase 1: one dev agent per repository with dev tasks, in parallel.
    fn phase_dev(self: &Arc<Self>, item: &Item, plan: &Plan) -> Result<()> {
        let by_repo = group_dev_tasks(plan);
        if by_repo.is_empty() {
            info!(item = %item.id, "no dev tasks, skipping dev phase");
            return Ok(());
        }

        self.snapshots.start(item);

        let workspace = self.ledger.layout().workspace_root(&item.id);
        let mut started: Vec<AgentId> = Vec::new();
        for (repo_name, tasks) in &by_repo {
            let repo = item.repository(repo_name).ok_or_else(|| {
                ConvoyError::Validation(format!("plan names unknown repository {repo_name}"))
            })?;
            let working_dir = self
                .ledger
                .layout()
                .repo_workspace(&item.id, repo_name);
            guard_workdir(&workspace, &working_dir)?;

            let prompt = prompts::dev_prompt(item, repo_name, tasks);
            let agent_id = self.agents.start_agent(
                item,
                &repo.role,
                Some(repo_name),
                &working_dir,
                &prompt,
            )?;
            self.active_dev
                .lock()
                .expect("active dev table poisoned")
                .insert((item.id.clone(), repo_name.clone()), agent_id.clone());
            started.push(agent_id);
        }

        info!(item = %item.id, agents = started.len(), "dev phase running");
        for agent_id in &started {
            self.wait_for_settled(agent_id);
        }
        Ok(())
    }

    /// Phase 2: bounded review loop per repository with review tasks.
    fn phase_review(self: &Arc<Self>, item: &Item, plan: &Plan) -> Result<()> {
        let workspace = self.ledger.layout().workspace_root(&item.id);

        for repo in &item.repositories {
            let repo_name = repo.directory_name.as_str();
            let review_tasks: Vec<&PlanTask> = plan
                .tasks_for_repository(repo_name)
                .filter(|t| t.agent == REVIEW_ROLE)
                .collect();
            if review_tasks.is_empty() {
                continue;
            }

            let repo_dir = self.ledger.layout().repo_workspace(&item.id, repo_name);
            guard_workdir(&workspace, &repo_dir)?;
            let findings_path = repo_dir.join(REVIEW_FINDINGS_FILE);

            for iteration in 1..=MAX_REVIEW_ITERATIONS {
                remove_entry(&findings_path)?;

                let prompt = prompts::review_prompt(item, repo_name, &review_tasks);
                let reviewer = self.agents.start_agent(
                    item,
                    REVIEW_ROLE,
                    Some(repo_name),
                    &repo_dir,
                    &prompt,
                )?;
                self.wait_for_terminal(&reviewer);

                let findings = match read_findings(&findings_path) {
                    Some(findings) => findings,
                    None => {
                        info!(item = %item.id, repo = repo_name, iteration, "no findings file, review done");
                        self.stop_quietly(&reviewer);
                        break;
                    }
                };

                self.ledger.record(&EventRecord::item(
                    &item.id,
                    EventKind::ReviewFindingsExtracted {
                        repo: repo_name.to_string(),
                        iteration,
                        critical_count: findings.count_by_severity(Severity::Critical),
                        major_count: findings.count_by_severity(Severity::Major),
                        minor_count: findings.count_by_severity(Severity::Minor),
                        overall_assessment: findings.overall_assessment,
                        findings: findings.findings.clone(),
                    },
                ))?;

                self.stop_quietly(&reviewer);

                if findings.is_pass() {
                    info!(item = %item.id, repo = repo_name, iteration, "review passed");
                    break;
                }
                if iteration == MAX_REVIEW_ITERATIONS {
                    warn!(item = %item.id, repo = repo_name, "review rounds exhausted, moving on");
                    break;
                }

                self.send_feedback(item, repo_name, &findings);
            }
        }
        Ok(())
    }

    /// Route findings to the repository's dev agent and wait for the fix
    /// round to settle.
    fn send_feedback(&self, item: &Item, repo_name: &str, findings: &ReviewFindings) {
        let Some(dev_agent) = self.active_dev_agent(&item.id, repo_name) else {
            warn!(item = %item.id, repo = repo_name, "no dev agent recorded for feedback");
            return;
        };
        let alive = self.agents.is_live(&dev_agent)
            && matches!(
                self.agents.agent_status(&dev_agent),
                Some(AgentStatus::Running | AgentStatus::WaitingOrchestrator)
            );
        if !alive {
            warn!(item = %item.id, repo = repo_name, agent = %dev_agent, "dev agent not available for feedback");
            return;
        }

        // The status flips to running before the message goes out; the fix
        // round's completion must not be able to land first.
        if let Err(e) = self
            .agents
            .set_status(&item.id, &dev_agent, AgentStatus::Running)
        {
            warn!(agent = %dev_agent, error = %e, "could not mark dev agent running");
        }
        let message = prompts::findings_feedback(findings);
        if let Err(e) = self.agents.send_input(&dev_agent, &message) {
            warn!(agent = %dev_agent, error = %e, "feedback delivery failed");
            return;
        }
        self.wait_for_settled(&dev_agent);
    }

    /// Phase 3: stop stragglers, clear the dev table, open PRs in sequence.
    fn phase_finalize(self: &Arc<Self>, item: &Item) {
        let stopped = self.agents.stop_item_agents(&item.id);
        if stopped > 0 {
            info!(item = %item.id, stopped, "stopped remaining agents before finalize");
        }

        self.active_dev
            .lock()
            .expect("active dev table poisoned")
            .retain(|(id, _), _| id != &item.id);

        self.gitpr.create_prs_for_item(item);
        self.snapshots.stop(&item.id);
    }

    /// Wait until an agent is terminal or parked at waiting_orchestrator.
    fn wait_for_settled(&self, agent_id: &AgentId) {
        loop {
            match self.agents.agent_status(agent_id) {
                None => return,
                Some(status)
                    if status.is_terminal() || status == AgentStatus::WaitingOrchestrator =>
                {
                    return;
                }
                Some(_) => std::thread::sleep(WAIT_POLL),
            }
        }
    }

    /// Wait until an agent reaches a terminal state.
    fn wait_for_terminal(&self, agent_id: &AgentId) {
        loop {
            match self.agents.agent_status(agent_id) {
                None => return,
                Some(status) if status.is_terminal() => return,
                Some(_) => std::thread::sleep(WAIT_POLL),
            }
        }
    }

    fn stop_quietly(&self, agent_id: &AgentId) {
        if self.agents.is_live(agent_id) {
            if let Err(e) = self.agents.stop_agent(agent_id) {
                warn!(agent = %agent_id, error = %e, "reviewer stop failed");
            }
        }
    }
}

/// Dev tasks grouped by repository, in first-appearance order.
fn group_dev_tasks(plan: &Plan) -> Vec<(String, Vec<&PlanTask>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&PlanTask>> = HashMap::new();
    for task in &plan.tasks {
        if !is_worker_role(&task.agent) {
            continue;
        }
        if !groups.contains_key(&task.repository) {
            order.push(task.repository.clone());
        }
        groups.entry(task.repository.clone()).or_default().push(task);
    }
    order
        .into_iter()
        .map(|repo| {
            let tasks = groups.remove(&repo).unwrap_or_default();
            (repo, tasks)
        })
        .collect()
}

/// Reject any working directory that does not resolve to a subpath of the
/// workspace root. Pure lexical normalization; the directory may not exist
/// when the check runs.
fn guard_workdir(workspace: &Path, working_dir: &Path) -> Result<()> {
    let normalized = normalize(working_dir);
    if normalized.starts_with(normalize(workspace)) && normalized != normalize(workspace) {
        Ok(())
    } else {
        Err(ConvoyError::Validation(format!(
            "working directory {} escapes the workspace",
            working_dir.display()
        )))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn read_findings(path: &Path) -> Option<ReviewFindings> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(findings) => Some(findings),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable review findings, treating as absent");
            None
        }
    }
}
