//! Assistant-binary discovery and launch arguments.
//!
//! Resolution order: the `CONVOY_AGENT_BIN` environment override, a fixed
//! list of well-known install locations, then a `PATH` search. The binary is
//! always launched in accept-edits permission mode with the initial prompt
//! as a command-line argument.

use std::path::{Path, PathBuf};

use convoy_types::config::ENV_AGENT_BIN;
use convoy_types::{ConvoyError, Result};

/// Name of the assistant binary when resolved via `PATH`.
const AGENT_BIN_NAME: &str = "claude";

/// Well-known absolute install locations, probed in order.
const CANDIDATE_PATHS: [&str; 4] = [
    "/usr/local/bin/claude",
    "/opt/homebrew/bin/claude",
    "/usr/bin/claude",
    "/opt/claude/bin/claude",
];

/// Locate the AI-assistant binary.
pub fn locate_agent_binary() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var(ENV_AGENT_BIN) {
        if !explicit.is_empty() {
            let path = PathBuf::from(&explicit);
            if path.is_file() {
                return Ok(path);
            }
            return Err(ConvoyError::Config(format!(
                "{ENV_AGENT_BIN} points at '{explicit}' which is not a file"
            )));
        }
    }

    for candidate in CANDIDATE_PATHS {
        let path = Path::new(candidate);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
    }

    if let Some(found) = search_path(AGENT_BIN_NAME) {
        return Ok(found);
    }

    Err(ConvoyError::Config(format!(
        "assistant binary '{AGENT_BIN_NAME}' not found; set {ENV_AGENT_BIN}"
    )))
}

/// Arguments for a supervised launch: accept-edits permission mode plus the
/// initial prompt.
pub fn launch_args(prompt: &str) -> Vec<String> {
    vec![
        "--permission-mode".to_string(),
        "acceptEdits".to_string(),
        prompt.to_string(),
    ]
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
