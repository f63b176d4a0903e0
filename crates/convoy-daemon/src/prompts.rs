//! Prompt composition for every agent role.
//!
//! Prompts are markdown sections assembled from item data. The contracts the
//! engine depends on are spelled out to the agent verbatim: the plan file
//! location and schema for planners, the `TASKS_COMPLETED` marker for dev
//! agents, and the `review_findings.json` schema for reviewers.

use std::collections::BTreeMap;

use convoy_types::{Finding, Item, PlanTask, ReviewFindings};

/// Prompt for the planner agent: read the design doc, write `plan.yaml`.
pub fn planner_prompt(item: &Item) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "# Planning: {}\n\
         You are the planning agent for this work item. Study the design \
         document and the repositories below, then write a task plan.",
        item.name
    ));

    if !item.description.is_empty() {
        sections.push(format!("## Description\n{}", item.description));
    }
    if let Some(doc) = item.design_doc.as_deref().filter(|d| !d.is_empty()) {
        sections.push(format!("## Design Document\n{doc}"));
    }

    sections.push(format!("## Repositories\n{}", repository_table(item)));

    sections.push(format!(
        "## Output\n\
         Write the plan to `plan.yaml` in the current directory, then stop. \
         Schema:\n\
         ```yaml\n\
         version: \"1.0\"\n\
         itemId: {}\n\
         summary: <one-line summary>\n\
         tasks:\n\
           - id: <unique id>\n\
             title: <short title>\n\
             description: <what to do>\n\
             agent: <one of the roles above, or `review`>\n\
             repository: <one of the directory names above>\n\
             dependencies: []   # optional task ids\n\
             files: []          # optional path hints\n\
         ```\n\
         Every repository that needs code changes should get at least one \
         dev task and one `review` task.",
        item.id
    ));

    sections.join("\n\n")
}

/// Prompt for a dev agent working one repository's tasks.
pub fn dev_prompt(item: &Item, repo: &str, tasks: &[&PlanTask]) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "# {}: tasks for `{repo}`\n\
         You are the development agent for the `{repo}` repository of this \
         work item. The current directory is the repository checkout.",
        item.name
    ));
    if !item.description.is_empty() {
        sections.push(format!("## Context\n{}", item.description));
    }

    sections.push(format!("## Tasks\n{}", task_list(tasks)));

    sections.push(
        "## Completion\n\
         Commit your work with clear messages as you go. When every task \
         above is done and committed, print a line containing exactly\n\
         `TASKS_COMPLETED`\n\
         and nothing else on it, then wait for further instructions. Do not \
         exit."
            .to_string(),
    );

    sections.join("\n\n")
}

/// Prompt for a review agent checking one repository.
pub fn review_prompt(item: &Item, repo: &str, tasks: &[&PlanTask]) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "# Review: `{repo}` for {}\n\
         You are the review agent. Inspect the work committed in the current \
         directory against the tasks below. Be specific; only report issues \
         a developer should act on.",
        item.name
    ));

    sections.push(format!("## Tasks under review\n{}", task_list(tasks)));

    sections.push(
        "## Output\n\
         Write your verdict to `review_findings.json` in the current \
         directory, then exit. Schema:\n\
         ```json\n\
         {\n\
           \"findings\": [\n\
             {\"severity\": \"critical\"|\"major\"|\"minor\",\n\
              \"file\": \"<path>\", \"line\": <int or omit>,\n\
              \"description\": \"<what is wrong>\",\n\
              \"suggestedFix\": \"<how to fix it>\",\n\
              \"targetAgent\": \"<role of the dev agent>\"}\n\
           ],\n\
           \"overallAssessment\": \"pass\" | \"needs_fixes\",\n\
           \"summary\": \"<one line>\"\n\
         }\n\
         ```\n\
         Use `pass` when nothing needs fixing."
            .to_string(),
    );

    sections.join("\n\n")
}

/// Prompt for the review-receive agent turning PR feedback into a new plan.
pub fn review_receive_prompt(
    item: &Item,
    repo: Option<&str>,
    pr_number: Option<u64>,
    pr_url: Option<&str>,
) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "# Review feedback: {}\n\
         A pull request for this work item received review comments. Read \
         them, decide what needs to change, and produce a fresh task plan.",
        item.name
    ));

    let mut pr_lines = Vec::new();
    if let Some(repo) = repo {
        pr_lines.push(format!("- Repository: `{repo}`"));
    }
    if let Some(number) = pr_number {
        pr_lines.push(format!("- PR number: #{number}"));
    }
    if let Some(url) = pr_url {
        pr_lines.push(format!("- PR URL: {url}"));
    }
    if !pr_lines.is_empty() {
        sections.push(format!("## Pull request\n{}", pr_lines.join("\n")));
    }

    sections.push(format!("## Repositories\n{}", repository_table(item)));

    sections.push(format!(
        "## Output\n\
         Use `gh pr view --comments` to read the feedback, then write a new \
         `plan.yaml` in the current directory (same schema as the original \
         plan, itemId {}) covering only the follow-up work, then stop.",
        item.id
    ));

    sections.join("\n\n")
}

/// Turn review findings into the feedback message typed at a dev agent.
pub fn findings_feedback(findings: &ReviewFindings) -> String {
    let mut by_file: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for finding in &findings.findings {
        by_file.entry(finding.file.as_str()).or_default().push(finding);
    }

    let mut lines = vec![
        "Code review found issues that need fixing before this repository is done:".to_string(),
    ];
    for (file, group) in by_file {
        lines.push(format!("\n{file}:"));
        for finding in group {
            let location = finding
                .line
                .map(|l| format!("{file}:{l}"))
                .unwrap_or_else(|| file.to_string());
            lines.push(format!(
                "- [{:?}] {} ({location})",
                finding.severity, finding.description
            ));
            if !finding.suggested_fix.is_empty() {
                lines.push(format!("  Suggested fix: {}", finding.suggested_fix));
            }
        }
    }
    lines.push(
        "\nAddress every finding, commit the fixes, then print TASKS_COMPLETED again."
            .to_string(),
    );
    lines.join("\n")
}

fn repository_table(item: &Item) -> String {
    item.repositories
        .iter()
        .map(|r| format!("- `{}` (role: {})", r.directory_name, r.role))
        .collect::<Vec<_>>()
        .join("\n")
}

fn task_list(tasks: &[&PlanTask]) -> String {
    tasks
        .iter()
        .map(|t| {
            let mut entry = format!("- **{}** ({}): {}", t.title, t.id, t.description);
            if !t.files.is_empty() {
                entry.push_str(&format!("\n  Files: {}", t.files.join(", ")));
            }
            entry
        })
        .collect::<Vec<_>>()
        .join("\n")
}
