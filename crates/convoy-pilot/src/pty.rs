//! Pseudo-terminal sessions.
//!
//! Spawns the AI-assistant binary in a PTY so the supervisor can intercept
//! all terminal I/O: the master end serves reads of agent output, keystroke
//! injection, and window resizes.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use convoy_types::{ConvoyError, Result};

/// Terminal dimensions of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 120, rows: 40 }
    }
}

impl From<PtySize> for Winsize {
    fn from(size: PtySize) -> Self {
        Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// A child process attached to a pseudo-terminal.
pub struct PtySession {
    master: std::os::fd::OwnedFd,
    child_pid: Pid,
}

impl PtySession {
    /// Spawn a command in a fresh PTY of the given size.
    ///
    /// The child becomes a session leader with the slave as its controlling
    /// terminal; stdio is redirected onto the slave. The master is set
    /// non-blocking for `poll()` integration.
    pub fn spawn(
        command: &Path,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
        size: PtySize,
    ) -> Result<Self> {
        let winsize: Winsize = size.into();
        let pty = openpty(Some(&winsize), None)
            .map_err(|e| ConvoyError::Pilot(format!("openpty failed: {e}")))?;

        // Safety: fork is the standard Unix path into a PTY child; the child
        // branch only calls async-signal-safe operations before exec.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(pty.master);
                let err = exec_child(pty.slave, command, args, working_dir, env);
                // Only reachable when exec failed.
                eprintln!("convoy-pilot: exec failed: {err}");
                std::process::exit(127);
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);

                let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| ConvoyError::Pilot(format!("fcntl F_GETFL: {e}")))?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    pty.master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )
                .map_err(|e| ConvoyError::Pilot(format!("fcntl F_SETFL: {e}")))?;

                Ok(Self {
                    master: pty.master,
                    child_pid: child,
                })
            }
            Err(e) => Err(ConvoyError::Pilot(format!("fork failed: {e}"))),
        }
    }

    /// Non-blocking read from the master.
    ///
    /// `Ok(0)` means no data right now (EAGAIN) or the child closed its end
    /// (EIO after exit); callers distinguish via [`PtySession::is_alive`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match unistd::read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(nix::errno::Errno::EIO) => Ok(0),
            Err(e) => Err(ConvoyError::Pilot(format!("pty read: {e}"))),
        }
    }

    /// Write all bytes into the child's terminal input.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            match unistd::write(&self.master, &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(ConvoyError::Pilot(format!("pty write: {e}"))),
            }
        }
        Ok(())
    }

    /// Send a line of text (appends a newline).
    pub fn send_line(&self, text: &str) -> Result<()> {
        let mut data = text.as_bytes().to_vec();
        data.push(b'\n');
        self.write_all(&data)
    }

    /// Change the terminal dimensions and notify the child via SIGWINCH.
    pub fn resize(&self, size: PtySize) -> Result<()> {
        let winsize: Winsize = size.into();
        // Safety: TIOCSWINSZ with a valid winsize on an open master fd.
        let rc = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ,
                &winsize as *const Winsize,
            )
        };
        if rc != 0 {
            return Err(ConvoyError::Pilot(format!(
                "TIOCSWINSZ: {}",
                std::io::Error::last_os_error()
            )));
        }
        let _ = signal::kill(self.child_pid, Signal::SIGWINCH);
        Ok(())
    }

    /// Whether the child has not yet been reaped.
    pub fn is_alive(&self) -> bool {
        matches!(
            waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)),
            Ok(WaitStatus::StillAlive)
        )
    }

    /// Reap the child and return `(exit_code, signal)`.
    pub fn wait(&self) -> Result<(Option<i32>, Option<i32>)> {
        loop {
            match waitpid(self.child_pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok((Some(code), None)),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok((None, Some(sig as i32))),
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => return Ok((Some(0), None)),
                Err(e) => return Err(ConvoyError::Pilot(format!("waitpid: {e}"))),
            }
        }
    }

    /// Poll the master for readability.
    pub fn poll_readable(&self, timeout_ms: u16) -> Result<bool> {
        let borrowed = self.master.as_fd();
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match nix::poll::poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                Ok(revents.contains(PollFlags::POLLIN) || revents.contains(PollFlags::POLLHUP))
            }
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(ConvoyError::Pilot(format!("poll: {e}"))),
        }
    }

    /// Send SIGTERM to the child.
    pub fn terminate(&self) -> Result<()> {
        signal::kill(self.child_pid, Signal::SIGTERM)
            .map_err(|e| ConvoyError::Pilot(format!("kill SIGTERM: {e}")))
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }
}

/// Child-side setup: controlling terminal, stdio redirect, cwd, env, exec.
/// Never returns on success.
fn exec_child(
    slave: std::os::fd::OwnedFd,
    command: &Path,
    args: &[String],
    working_dir: &Path,
    env: &[(String, String)],
) -> String {
    if let Err(e) = unistd::setsid() {
        return format!("setsid: {e}");
    }
    // Safety: TIOCSCTTY on the slave we just received from openpty.
    unsafe {
        if libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) < 0 {
            return format!("TIOCSCTTY: {}", std::io::Error::last_os_error());
        }
    }
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if let Err(e) = unistd::dup2(slave.as_raw_fd(), fd) {
            return format!("dup2 fd {fd}: {e}");
        }
    }
    drop(slave);

    if let Err(e) = unistd::chdir(working_dir) {
        return format!("chdir {}: {e}", working_dir.display());
    }
    for (key, value) in env {
        std::env::set_var(key, value);
    }

    let program = match CString::new(command.to_string_lossy().into_owned()) {
        Ok(c) => c,
        Err(e) => return format!("invalid command: {e}"),
    };
    let mut argv = vec![program.clone()];
    for arg in args {
        match CString::new(arg.as_str()) {
            Ok(c) => argv.push(c),
            Err(e) => return format!("invalid arg: {e}"),
        }
    }

    match unistd::execvp(&program, &argv) {
        Ok(infallible) => match infallible {},
        Err(e) => format!("execvp: {e}"),
    }
}
