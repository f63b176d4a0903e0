//! Scripted stand-in for the assistant binary.
//!
//! One dispatcher script is installed per test process and exported through
//! `CONVOY_AGENT_BIN` exactly once. At spawn time the dispatcher inspects
//! its prompt argument to decide which role it is playing, then executes the
//! matching behavior script from its working directory:
//!
//! | role            | behavior file                |
//! |-----------------|------------------------------|
//! | planner         | `.convoy-mock-planner.sh`    |
//! | review          | `.convoy-mock-review.sh`     |
//! | review-receiver | `.convoy-mock-receiver.sh`   |
//! | anything else   | `.convoy-mock-dev.sh`        |
//!
//! The dispatcher waits up to five seconds for the behavior file to appear,
//! which lets tests drop scripts into workspaces the engine is still
//! creating. Missing behavior is an exit-1, visible in the event log.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// The role a behavior script plays in a test scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRole {
    Planner,
    Dev,
    Review,
    ReviewReceiver,
}

impl MockRole {
    pub fn behavior_file(self) -> &'static str {
        match self {
            MockRole::Planner => ".convoy-mock-planner.sh",
            MockRole::Dev => ".convoy-mock-dev.sh",
            MockRole::Review => ".convoy-mock-review.sh",
            MockRole::ReviewReceiver => ".convoy-mock-receiver.sh",
        }
    }
}

const DISPATCHER: &str = r##"#!/bin/sh
# Mock assistant binary for Convoy tests.
# argv: --permission-mode acceptEdits <prompt>
prompt="$3"

case "$prompt" in
  *"# Planning:"*)        behavior=".convoy-mock-planner.sh" ;;
  *"# Review feedback:"*) behavior=".convoy-mock-receiver.sh" ;;
  *"# Review:"*)          behavior=".convoy-mock-review.sh" ;;
  *)                      behavior=".convoy-mock-dev.sh" ;;
esac

tries=0
while [ ! -f "./$behavior" ] && [ "$tries" -lt 50 ]; do
  sleep 0.1
  tries=$((tries + 1))
done

if [ -f "./$behavior" ]; then
  exec /bin/sh "./$behavior"
fi

echo "mock agent: no $behavior in $(pwd)" >&2
exit 1
"##;

/// Install the dispatcher and export `CONVOY_AGENT_BIN`. Idempotent per
/// process; returns the dispatcher path.
pub fn install_mock_agent() -> PathBuf {
    static INSTALLED: OnceLock<PathBuf> = OnceLock::new();
    INSTALLED
        .get_or_init(|| {
            let path = std::env::temp_dir().join(format!(
                "convoy-mock-agent-{}.sh",
                std::process::id()
            ));
            std::fs::write(&path, DISPATCHER).expect("write dispatcher");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod dispatcher");
            std::env::set_var(convoy_types::config::ENV_AGENT_BIN, &path);
            path
        })
        .clone()
}

/// Drop a behavior script into the directory an agent will run in.
///
/// When the directory is a git checkout, the harness artifacts are added to
/// `.git/info/exclude` so they never show up as working-tree changes.
pub fn write_behavior(dir: &Path, role: MockRole, body: &str) {
    std::fs::create_dir_all(dir).expect("behavior dir");
    let path = dir.join(role.behavior_file());
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write behavior");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod behavior");

    let info_dir = dir.join(".git/info");
    if dir.join(".git").exists() {
        std::fs::create_dir_all(&info_dir).expect("git info dir");
        std::fs::write(
            info_dir.join("exclude"),
            ".convoy-mock-*.sh\n.review_ran\n",
        )
        .expect("write git exclude");
    }
}

/// Behavior body: write a valid plan with one dev and one review task per
/// repository, then exit.
pub fn plan_writing_behavior(item_id: &str, repos: &[(&str, &str)]) -> String {
    let mut tasks = String::new();
    for (index, (repo, role)) in repos.iter().enumerate() {
        tasks.push_str(&format!(
            "  - id: dev-{index}\n    title: implement {repo}\n    description: do the work\n    agent: {role}\n    repository: {repo}\n"
        ));
        tasks.push_str(&format!(
            "  - id: review-{index}\n    title: review {repo}\n    description: check the work\n    agent: review\n    repository: {repo}\n"
        ));
    }
    format!(
        "cat > plan.yaml <<'EOF'\nversion: \"1.0\"\nitemId: {item_id}\nsummary: scripted plan\ntasks:\n{tasks}EOF\nsleep 60\n"
    )
}

/// Behavior body: announce completion, then stay alive answering feedback
/// until killed. Each received feedback round re-announces completion.
pub fn dev_behavior() -> String {
    "echo TASKS_COMPLETED\n\
     while read line; do\n\
       case \"$line\" in\n\
         *\"TASKS_COMPLETED again\"*) echo TASKS_COMPLETED ;;\n\
       esac\n\
     done\n\
     sleep 300\n"
        .to_string()
}

/// Behavior body: write a passing review and exit.
pub fn passing_review_behavior() -> String {
    r#"cat > review_findings.json <<'EOF'
{"findings": [], "overallAssessment": "pass", "summary": "clean"}
EOF
exit 0"#
        .to_string()
}

/// Behavior body: one `needs_fixes` round with a single major finding, then
/// `pass` on every later run. State lives in `.review_ran`.
pub fn one_fix_review_behavior(target_agent: &str) -> String {
    format!(
        r#"if [ -f .review_ran ]; then
  cat > review_findings.json <<'EOF'
{{"findings": [], "overallAssessment": "pass", "summary": "fixed"}}
EOF
else
  touch .review_ran
  cat > review_findings.json <<'EOF'
{{"findings": [{{"severity": "major", "file": "src/main.rs", "line": 3,
  "description": "missing null check", "suggestedFix": "add a guard",
  "targetAgent": "{target_agent}"}}],
 "overallAssessment": "needs_fixes", "summary": "one major issue"}}
EOF
fi
exit 0"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent_and_executable() {
        let first = install_mock_agent();
        let second = install_mock_agent();
        assert_eq!(first, second);
        assert!(first.is_file());

        let mode = std::fs::metadata(&first).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "dispatcher must be executable");
        assert_eq!(
            std::env::var(convoy_types::config::ENV_AGENT_BIN).unwrap(),
            first.display().to_string()
        );
    }

    #[test]
    fn dispatcher_routes_by_prompt() {
        install_mock_agent();
        let tmp = tempfile::tempdir().unwrap();
        write_behavior(tmp.path(), MockRole::Planner, "echo planner-ran");

        let out = std::process::Command::new(install_mock_agent())
            .args(["--permission-mode", "acceptEdits", "# Planning: x"])
            .current_dir(tmp.path())
            .output()
            .unwrap();
        assert!(out.status.success());
        assert!(String::from_utf8_lossy(&out.stdout).contains("planner-ran"));
    }

    #[test]
    fn dispatcher_fails_without_behavior() {
        install_mock_agent();
        let tmp = tempfile::tempdir().unwrap();

        // Dev fallback with no script: waits briefly, then exits 1.
        let out = std::process::Command::new(install_mock_agent())
            .args(["--permission-mode", "acceptEdits", "just work"])
            .current_dir(tmp.path())
            .output()
            .unwrap();
        assert!(!out.status.success());
    }

    #[test]
    fn plan_writing_behavior_emits_valid_yaml() {
        let body = plan_writing_behavior("ITEM-12345678", &[("frontend", "front")]);
        assert!(body.contains("itemId: ITEM-12345678"));
        assert!(body.contains("agent: front"));
        assert!(body.contains("agent: review"));
    }
}
