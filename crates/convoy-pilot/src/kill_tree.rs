//! Process-tree termination with signal escalation.
//!
//! Stopping an agent must also stop whatever it spawned (shells, build
//! tools, dev servers). The tree is walked from the agent's PID, SIGTERM is
//! delivered leaves-first, and survivors get SIGKILL after a grace period.
//!
//! Safety rails: PID 0/1 are never targeted, and only processes owned by
//! the current user are signaled.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use convoy_types::{ConvoyError, Result};

/// Grace period between SIGTERM and SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct ProcEntry {
    pid: i32,
    ppid: i32,
    uid: u32,
}

/// Terminate the process tree rooted at `root_pid`.
///
/// Descendants are signaled before the root. Already-dead processes and
/// permission errors are skipped, not fatal.
pub fn kill_tree(root_pid: i32) -> Result<()> {
    if root_pid <= 1 {
        return Err(ConvoyError::Pilot(format!(
            "refusing to kill protected pid {root_pid}"
        )));
    }

    let table = read_process_table()?;
    let my_uid = unsafe { libc::getuid() };

    if !owned_by(&table, root_pid, my_uid) {
        if !alive(root_pid) {
            debug!(root_pid, "process already gone");
            return Ok(());
        }
        return Err(ConvoyError::Pilot(format!(
            "pid {root_pid} is not owned by uid {my_uid}"
        )));
    }

    let mut targets = descendants(&table, root_pid);
    targets.retain(|&pid| pid > 1 && owned_by(&table, pid, my_uid));
    targets.push(root_pid);

    info!(root_pid, targets = targets.len(), "terminating process tree");
    for &pid in &targets {
        deliver(pid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + GRACE_PERIOD;
    loop {
        let survivors: Vec<i32> = targets.iter().copied().filter(|&p| alive(p)).collect();
        if survivors.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(
                root_pid,
                survivors = survivors.len(),
                "grace period expired, escalating to SIGKILL"
            );
            for &pid in &survivors {
                deliver(pid, Signal::SIGKILL);
            }
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn deliver(pid: i32, sig: Signal) {
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) => debug!(pid, signal = ?sig, "signal sent"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = ?sig, error = %e, "signal failed"),
    }
}

fn alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

fn owned_by(table: &[ProcEntry], pid: i32, uid: u32) -> bool {
    table.iter().find(|p| p.pid == pid).is_some_and(|p| p.uid == uid)
}

/// Descendants of `root`, deepest first.
fn descendants(table: &[ProcEntry], root: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for entry in table {
        children.entry(entry.ppid).or_default().push(entry.pid);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    found.reverse();
    found
}

/// Enumerate processes by scanning `/proc`.
#[cfg(target_os = "linux")]
fn read_process_table() -> Result<Vec<ProcEntry>> {
    let mut table = Vec::new();
    for entry in std::fs::read_dir("/proc")
        .map_err(|e| ConvoyError::Pilot(format!("cannot read /proc: {e}")))?
    {
        let Ok(entry) = entry else { continue };
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
            continue;
        };

        let mut ppid = 0;
        let mut uid = u32::MAX;
        for line in status.lines() {
            if let Some(value) = line.strip_prefix("PPid:\t") {
                ppid = value.trim().parse().unwrap_or(0);
            } else if let Some(value) = line.strip_prefix("Uid:\t") {
                uid = value
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(u32::MAX);
            }
        }
        table.push(ProcEntry { pid, ppid, uid });
    }
    Ok(table)
}

/// Enumerate processes via libproc.
#[cfg(target_os = "macos")]
fn read_process_table() -> Result<Vec<ProcEntry>> {
    use std::mem;

    const PROC_ALL_PIDS: u32 = 1;

    let bytes = unsafe { libc::proc_listpids(PROC_ALL_PIDS, 0, std::ptr::null_mut(), 0) };
    if bytes <= 0 {
        return Err(ConvoyError::Pilot(format!(
            "proc_listpids size query failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let capacity = (bytes as usize / mem::size_of::<libc::pid_t>()) + 64;
    let mut pids: Vec<libc::pid_t> = vec![0; capacity];
    let filled = unsafe {
        libc::proc_listpids(
            PROC_ALL_PIDS,
            0,
            pids.as_mut_ptr().cast(),
            (capacity * mem::size_of::<libc::pid_t>()) as libc::c_int,
        )
    };
    if filled <= 0 {
        return Err(ConvoyError::Pilot(format!(
            "proc_listpids failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    pids.truncate(filled as usize / mem::size_of::<libc::pid_t>());

    let mut table = Vec::with_capacity(pids.len());
    for &pid in pids.iter().filter(|&&p| p > 0) {
        let mut info: libc::proc_bsdinfo = unsafe { mem::zeroed() };
        let rc = unsafe {
            libc::proc_pidinfo(
                pid,
                libc::PROC_PIDTBSDINFO,
                0,
                (&mut info as *mut libc::proc_bsdinfo).cast(),
                mem::size_of::<libc::proc_bsdinfo>() as libc::c_int,
            )
        };
        if rc <= 0 {
            continue;
        }
        table.push(ProcEntry {
            pid,
            ppid: info.pbi_ppid as i32,
            uid: info.pbi_uid,
        });
    }
    Ok(table)
}
