//! Thin wrappers around the `git` and `gh` binaries.
//!
//! The engine shells out rather than linking a git library: workspaces are
//! ordinary checkouts the user may also touch, and `gh` handles host-service
//! authentication.

use std::path::Path;
use std::process::Command;

use convoy_types::{ConvoyError, Result};

/// Run `git` with the given args in `dir`, returning trimmed stdout.
pub(crate) fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    run_tool("git", dir, args)
}

/// Run `gh` with the given args in `dir`, returning trimmed stdout.
pub(crate) fn run_gh(dir: &Path, args: &[&str]) -> Result<String> {
    run_tool("gh", dir, args)
}

fn run_tool(tool: &str, dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(tool)
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| ConvoyError::Git(format!("failed to run {tool}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ConvoyError::Git(format!(
            "{tool} {} failed ({}): {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Recursively copy a directory tree.
pub(crate) fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove whatever sits at `path`: directory trees recursively, files and
/// symlinks by unlink. Missing paths are fine.
pub(crate) fn remove_entry(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
