//! Shell-command classification.
//!
//! The blocklist is checked first: commands that can take the machine down
//! are denied without asking anyone. Everything else either requires a human
//! (or standing) approval, or is auto-approved.

use std::sync::OnceLock;

use regex::Regex;

/// The three-way verdict for a proposed shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Destructive at the machine level; auto-denied.
    Blocklist,
    /// Needs an approval decision before it runs.
    ApprovalRequired,
    /// Safe to wave through.
    AutoApprove,
}

struct Patterns {
    blocklist: Vec<Regex>,
    approval: Vec<Regex>,
    rm_recursive: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |s: &str| Regex::new(s).expect("static pattern");
        Patterns {
            blocklist: vec![
                // Writes to the system account databases.
                re(r"(>>?|\btee\b).*/etc/(passwd|shadow)"),
                re(r"\b(rm|mv|cp|chattr)\b.*/etc/(passwd|shadow)"),
                // dd onto a raw device.
                re(r"\bdd\b.*\bof=/dev/(sd[a-z]|nvme\d+n\d+|disk\d+|hd[a-z])"),
                // The classic fork bomb literal.
                re(r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:"),
                // World-writable root.
                re(r"\bchmod\b\s+(-[a-zA-Z]+\s+)*777\s+/\s*$"),
                re(r"\bchmod\b\s+(-[a-zA-Z]+\s+)*777\s+/\s"),
                // Cryptominer signatures.
                re(r"(?i)\b(xmrig|minerd|cpuminer|cgminer|ethminer)\b"),
                re(r"(?i)stratum\+tcp://"),
            ],
            approval: vec![
                // Deletion.
                re(r"(^|[;&|]\s*|\s)\b(rm|rmdir)\b"),
                // Remote git and history rewrites.
                re(r"\bgit\b.*\bpush\b"),
                re(r"\bgit\b.*\breset\b\s+--hard"),
                // Container lifecycle.
                re(r"\b(docker|podman|docker-compose|nerdctl)\b"),
                // Network fetchers and remote shells.
                re(r"(^|[;&|]\s*|\s)\b(curl|wget|ssh|scp|rsync|nc|netcat)\b"),
                // Package installers.
                re(r"\b(npm|pnpm|yarn|bun)\b.*\b(install|add|i)\b"),
                re(r"\b(pip3?|pipx|uv)\b.*\binstall\b"),
                re(r"\bcargo\b\s+(install|add)\b"),
                re(r"\b(apt|apt-get|dnf|yum|pacman|brew|gem)\b\s+(-\S+\s+)*(install|add|remove|purge)\b"),
                // Process signals.
                re(r"(^|[;&|]\s*|\s)\b(kill|killall|pkill)\b"),
                // Privilege elevation.
                re(r"(^|[;&|]\s*|\s)\b(sudo|doas)\b"),
                re(r"(^|[;&|]\s*|\s)\bsu\b(\s|$)"),
                // Permission and ownership changes.
                re(r"\b(chmod|chown|chgrp)\b"),
                // Destructive SQL.
                re(r"(?i)\b(drop\s+(table|database|schema)|truncate\s+table|delete\s+from)\b"),
                // Environment mutation and shell indirection.
                re(r"(^|[;&|]\s*)\s*export\s+\w+="),
                re(r"(^|[;&|]\s*|\s)\b(eval|exec)\b"),
            ],
            rm_recursive: re(
                r"\brm\b\s+(-[a-zA-Z]*[rR][a-zA-Z]*\s+|-[a-zA-Z]*f[a-zA-Z]*\s+|--recursive\s+|--force\s+)+(?P<target>\S+)",
            ),
        }
    })
}

/// Classify a proposed shell command.
///
/// Blocklist patterns are checked first; a hit short-circuits everything
/// else. Patterns are case-insensitive only where the matched language is
/// (SQL, miner binaries); Unix command names match exactly.
pub fn classify_command(command: &str) -> CommandClass {
    let p = patterns();

    if p.blocklist.iter().any(|re| re.is_match(command)) {
        return CommandClass::Blocklist;
    }
    // Recursive deletion that resolves to the filesystem root is blocklisted
    // even when spelled through `..` hops.
    if let Some(caps) = p.rm_recursive.captures(command) {
        if resolves_to_root(&caps["target"]) {
            return CommandClass::Blocklist;
        }
    }

    if p.approval.iter().any(|re| re.is_match(command)) {
        return CommandClass::ApprovalRequired;
    }

    CommandClass::AutoApprove
}

/// Logically normalize a path string and report whether it lands on `/`.
///
/// Pure string normalization: `.` segments drop, `..` pops, no filesystem
/// access. `rm -rf /tmp/../` resolves to `/` and must be caught.
fn resolves_to_root(target: &str) -> bool {
    if !target.starts_with('/') {
        return false;
    }
    let mut stack: Vec<&str> = Vec::new();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            // A trailing glob still nukes everything under the resolved dir.
            "*" => {}
            other => stack.push(other),
        }
    }
    stack.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_commands_auto_approve() {
        for cmd in [
            "ls -la",
            "cat src/main.rs",
            "grep -rn TODO src/",
            "cargo build",
            "git status",
            "git diff HEAD~1",
            "echo hello",
        ] {
            assert_eq!(classify_command(cmd), CommandClass::AutoApprove, "{cmd}");
        }
    }

    #[test]
    fn deletion_requires_approval() {
        assert_eq!(
            classify_command("rm target/debug/app"),
            CommandClass::ApprovalRequired
        );
        assert_eq!(
            classify_command("rmdir build"),
            CommandClass::ApprovalRequired
        );
    }

    #[test]
    fn remote_git_requires_approval() {
        assert_eq!(
            classify_command("git push origin feature"),
            CommandClass::ApprovalRequired
        );
        assert_eq!(
            classify_command("git reset --hard HEAD~3"),
            CommandClass::ApprovalRequired
        );
        assert_eq!(classify_command("git fetch"), CommandClass::AutoApprove);
    }

    #[test]
    fn network_fetchers_require_approval() {
        for cmd in [
            "curl https://example.com/install.sh",
            "wget https://example.com/pkg.tar.gz",
            "ssh deploy@prod",
            "scp build.tar deploy@prod:/srv",
            "rsync -av dist/ remote:/var/www",
        ] {
            assert_eq!(classify_command(cmd), CommandClass::ApprovalRequired, "{cmd}");
        }
    }

    #[test]
    fn installers_signals_and_privilege() {
        for cmd in [
            "npm install left-pad",
            "pip install requests",
            "cargo install ripgrep",
            "apt-get install -y jq",
            "kill -9 4242",
            "pkill node",
            "sudo systemctl restart nginx",
            "chmod +x script.sh",
            "chown deploy:deploy /srv/app",
        ] {
            assert_eq!(classify_command(cmd), CommandClass::ApprovalRequired, "{cmd}");
        }
    }

    #[test]
    fn sql_and_shell_indirection() {
        assert_eq!(
            classify_command("psql -c 'DROP TABLE users'"),
            CommandClass::ApprovalRequired
        );
        assert_eq!(
            classify_command("mysql -e 'delete from orders'"),
            CommandClass::ApprovalRequired
        );
        assert_eq!(
            classify_command("export AWS_PROFILE=prod"),
            CommandClass::ApprovalRequired
        );
        assert_eq!(
            classify_command("eval $(ssh-agent)"),
            CommandClass::ApprovalRequired
        );
    }

    #[test]
    fn rm_rf_root_is_blocklisted() {
        for cmd in [
            "rm -rf /",
            "rm -fr /",
            "rm -rf /*",
            "rm -rf /tmp/../",
            "rm -r -f /var/..",
        ] {
            assert_eq!(classify_command(cmd), CommandClass::Blocklist, "{cmd}");
        }
    }

    #[test]
    fn rm_rf_below_root_is_only_approval() {
        assert_eq!(
            classify_command("rm -rf /tmp/build"),
            CommandClass::ApprovalRequired
        );
        assert_eq!(
            classify_command("rm -rf target/"),
            CommandClass::ApprovalRequired
        );
    }

    #[test]
    fn system_file_writes_are_blocklisted() {
        assert_eq!(
            classify_command("echo 'evil::0:0::/:/bin/sh' >> /etc/passwd"),
            CommandClass::Blocklist
        );
        assert_eq!(
            classify_command("cat creds | tee /etc/shadow"),
            CommandClass::Blocklist
        );
    }

    #[test]
    fn raw_device_dd_and_fork_bomb() {
        assert_eq!(
            classify_command("dd if=/dev/zero of=/dev/sda bs=1M"),
            CommandClass::Blocklist
        );
        assert_eq!(
            classify_command(":(){ :|:& };:"),
            CommandClass::Blocklist
        );
    }

    #[test]
    fn chmod_777_root_is_blocklisted() {
        assert_eq!(classify_command("chmod 777 /"), CommandClass::Blocklist);
        assert_eq!(
            classify_command("chmod -R 777 / "),
            CommandClass::Blocklist
        );
        // 777 on a project dir is merely approval-required.
        assert_eq!(
            classify_command("chmod 777 ./scripts"),
            CommandClass::ApprovalRequired
        );
    }

    #[test]
    fn miner_signatures_are_blocklisted() {
        assert_eq!(
            classify_command("./xmrig -o pool.example.com:3333"),
            CommandClass::Blocklist
        );
        assert_eq!(
            classify_command("miner --url stratum+tcp://pool:3333"),
            CommandClass::Blocklist
        );
    }

    #[test]
    fn blocklist_wins_over_approval_patterns() {
        // `rm` alone is approval-required, but the root target escalates.
        assert_eq!(classify_command("sudo rm -rf /"), CommandClass::Blocklist);
    }

    #[test]
    fn path_normalization() {
        assert!(resolves_to_root("/"));
        assert!(resolves_to_root("/tmp/.."));
        assert!(resolves_to_root("/tmp/../"));
        assert!(resolves_to_root("/a/b/../../"));
        assert!(resolves_to_root("/*"));
        assert!(!resolves_to_root("/tmp"));
        assert!(!resolves_to_root("/tmp/../var"));
        assert!(!resolves_to_root("relative/path"));
    }
}
