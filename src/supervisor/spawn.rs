//! Child process creation
//!
//! A module is started with its stdin connected to a fresh pipe; the
//! supervisor keeps the write end and closing it is the stop signal. Any other
//! module's write end that leaked into the new child would keep that module's
//! stdin open forever, so the child closes all of them before exec. The pipes
//! std creates are close-on-exec as well.

use super::module::ModuleProcess;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// Split a command line on whitespace into program and arguments
pub fn tokenize(call: &str) -> Option<(&str, Vec<&str>)> {
    let mut tokens = call.split_whitespace();
    let program = tokens.next()?;
    Some((program, tokens.collect()))
}

/// Start `call` with a piped stdin, closing `foreign_fds` in the child.
pub(crate) fn spawn_module(call: &str, foreign_fds: &[RawFd]) -> io::Result<ModuleProcess> {
    let (program, args) = tokenize(call)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::piped());

    // Never touch the child's own stdio
    let fds: Vec<RawFd> = foreign_fds
        .iter()
        .copied()
        .filter(|&fd| fd > libc::STDERR_FILENO)
        .collect();

    // SAFETY: the hook runs in the forked child before exec. It only calls
    // close(2), which is async-signal-safe, and does not allocate.
    unsafe {
        command.pre_exec(move || {
            for &fd in &fds {
                libc::close(fd);
            }
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let Some(stdin) = child.stdin.take() else {
        // Unreachable with Stdio::piped(); reap the child rather than leak it
        let _ = child.kill();
        let _ = child.wait();
        return Err(io::Error::other("child stdin was not captured"));
    };

    log::debug!("Spawned {} (pid {})", program, child.id());
    Ok(ModuleProcess { child, stdin })
}

/// Whether a spawn error is about the module's program rather than the OS.
///
/// Missing or non-executable programs and empty command lines fail the module;
/// everything else (fork, pipe, resource limits) is a supervisor fault.
pub(crate) fn is_launch_failure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput
    ) || err.raw_os_error() == Some(libc::ENOEXEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_whitespace() {
        let (program, args) = tokenize("  ./wheels   8003\t500 ").unwrap();
        assert_eq!(program, "./wheels");
        assert_eq!(args, vec!["8003", "500"]);
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("").is_none());
        assert!(tokenize(" \t ").is_none());
    }

    #[test]
    fn test_launch_failure_classification() {
        assert!(is_launch_failure(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(is_launch_failure(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(is_launch_failure(&io::Error::from_raw_os_error(libc::ENOEXEC)));
        assert!(!is_launch_failure(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(!is_launch_failure(&io::Error::from_raw_os_error(libc::ENOMEM)));
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = spawn_module("/nonexistent/sutradhar-module", &[]).unwrap_err();
        assert!(is_launch_failure(&err));
    }

    #[test]
    fn test_spawn_and_close_stdin() {
        let process = spawn_module("cat", &[]).unwrap();
        let ModuleProcess { mut child, stdin } = process;
        drop(stdin);
        let status = child.wait().unwrap();
        assert!(status.success());
    }

    /// Whether process `pid` holds a descriptor for the same open file as `target`
    fn holds_file(pid: u32, target: &std::path::Path) -> bool {
        std::fs::read_dir(format!("/proc/{}/fd", pid))
            .unwrap()
            .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
            .any(|link| link == target)
    }

    /// Start `cat` with `foreign_fds`, report whether it inherited `target`
    fn child_holds(foreign_fds: &[RawFd], target: &std::path::Path) -> bool {
        let ModuleProcess { mut child, stdin } = spawn_module("cat", foreign_fds).unwrap();
        // cat blocks on stdin, so the descriptor table is stable after exec
        std::thread::sleep(std::time::Duration::from_millis(100));
        let held = holds_file(child.id(), target);
        drop(stdin);
        child.wait().unwrap();
        held
    }

    #[test]
    fn test_foreign_fds_closed_in_child() {
        if !std::path::Path::new("/proc/self/fd").exists() {
            return;
        }

        // pipe(2) without O_CLOEXEC: inherited across exec unless closed
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;
        unsafe { libc::close(read_fd) };
        let target = std::fs::read_link(format!("/proc/self/fd/{}", write_fd)).unwrap();

        assert!(child_holds(&[], &target));
        assert!(!child_holds(&[write_fd], &target));

        unsafe { libc::close(write_fd) };
    }
}
