//! Risk annotation for approval requests.
//!
//! Flags never decide anything on their own; they travel with the
//! `approval_requested` event so a human (or a dashboard) can triage
//! requests without re-reading the terminal.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use convoy_types::RiskFlags;

struct FlagPatterns {
    absolute_path: Regex,
    destructive: Regex,
    secrets: Regex,
    network: Regex,
    system_dirs: Vec<&'static str>,
    secret_dirs: Vec<&'static str>,
}

fn flag_patterns() -> &'static FlagPatterns {
    static PATTERNS: OnceLock<FlagPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |s: &str| Regex::new(s).expect("static pattern");
        FlagPatterns {
            absolute_path: re(r"(?:^|[\s='\x22])(/[\w@.~+-]+(?:/[\w@.~+-]*)*)"),
            destructive: re(
                r"(?i)\brm\b\s+-[a-z]*[rf]|\bgit\b.*\breset\b\s+--hard|\bdrop\s+(table|database)|\btruncate\s+table|\bdelete\s+from\b|\bmkfs\b|\bdd\b.*\bof=",
            ),
            secrets: re(
                r"(?i)(id_rsa|id_ed25519|\.pem\b|\.p12\b|\.env\b|credentials|secret|token|\.netrc|\.npmrc|\.pgpass|password)",
            ),
            network: re(r"\b(curl|wget|ssh|scp|rsync|nc|netcat|ftp|telnet)\b|https?://"),
            system_dirs: vec!["/etc", "/usr", "/var", "/boot", "/root", "/sys", "/proc"],
            secret_dirs: vec![".ssh", ".aws", ".gnupg", ".kube", ".docker"],
        }
    })
}

/// Compute the risk flags for a proposed command relative to the agent's
/// workspace directory.
pub fn compute_flags(command: Option<&str>, workspace: &Path) -> RiskFlags {
    let Some(command) = command else {
        return RiskFlags::default();
    };
    let p = flag_patterns();

    let mut flags = RiskFlags {
        is_destructive: p.destructive.is_match(command),
        involves_secrets: p.secrets.is_match(command),
        involves_network: p.network.is_match(command),
        is_outside_workspace: false,
    };

    for caps in p.absolute_path.captures_iter(command) {
        let raw = &caps[1];
        if path_escapes_workspace(raw, workspace) {
            flags.is_outside_workspace = true;
        }
        if p.secret_dirs.iter().any(|d| raw.contains(d)) {
            flags.involves_secrets = true;
        }
    }
    // Relative paths that climb out of the workspace count too.
    if command.contains("../") && climbs_out(command, workspace) {
        flags.is_outside_workspace = true;
    }

    flags
}

/// Whether an absolute path lies outside the workspace or inside a system
/// directory. Pure string logic; the path may not exist yet.
fn path_escapes_workspace(raw: &str, workspace: &Path) -> bool {
    let p = flag_patterns();
    let normalized = normalize(Path::new(raw));
    if p.system_dirs
        .iter()
        .any(|d| normalized.starts_with(d))
    {
        return true;
    }
    !normalized.starts_with(normalize(workspace))
}

/// Whether any `..`-bearing relative path in the command climbs above the
/// workspace root.
fn climbs_out(command: &str, workspace: &Path) -> bool {
    let depth = workspace.components().count();
    command
        .split_whitespace()
        .filter(|tok| tok.contains("../"))
        .any(|tok| {
            let ups = tok.matches("..").count();
            ups >= depth || normalize(&workspace.join(tok)).as_os_str().is_empty()
        })
}

/// Logical path normalization without touching the filesystem.
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
