//! Module table entries

use crate::error::{Error, Result};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ExitStatus};

/// Return value recorded when a process did not exit normally (killed by a
/// signal, or never started)
pub const ABNORMAL_EXIT: i32 = -1;

/// Module lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModuleState {
    /// Not running (initial, or stopped on request)
    #[default]
    Disabled,
    /// Process running
    Enabled,
    /// Process terminated while it should have been running
    Failed,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Disabled => "disabled",
            ModuleState::Enabled => "enabled",
            ModuleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Running child process and the write end of its stdin pipe
#[derive(Debug)]
pub(crate) struct ModuleProcess {
    pub child: Child,
    pub stdin: ChildStdin,
}

impl ModuleProcess {
    /// Descriptor of the supervisor's end of the stdin pipe
    #[inline]
    pub fn stdin_fd(&self) -> RawFd {
        self.stdin.as_raw_fd()
    }
}

/// Newly observed module failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedModule {
    /// Module name
    pub name: String,
    /// Exit code, or [`ABNORMAL_EXIT`]
    pub return_value: i32,
}

/// One supervised module
///
/// `process` is `Some` exactly while `state` is [`ModuleState::Enabled`].
#[derive(Debug)]
pub struct Module {
    pub(crate) name: String,
    pub(crate) call: String,
    pub(crate) creation_delay_ms: u16,
    pub(crate) state: ModuleState,
    pub(crate) process: Option<ModuleProcess>,
    pub(crate) return_value: i32,
}

impl Module {
    pub(crate) fn new(name: &str, call: &str, creation_delay_ms: u16) -> Self {
        Self {
            name: name.to_string(),
            call: call.to_string(),
            creation_delay_ms,
            state: ModuleState::Disabled,
            process: None,
            return_value: 0,
        }
    }

    /// Unique name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Command line of the last launch
    pub fn call(&self) -> &str {
        &self.call
    }

    /// Startup grace period in milliseconds
    pub fn creation_delay_ms(&self) -> u16 {
        self.creation_delay_ms
    }

    /// State as of the last transition or poll
    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Exit code of the last terminated process
    pub fn return_value(&self) -> i32 {
        self.return_value
    }

    /// OS process id while enabled
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.child.id())
    }

    /// Non-blocking reap of the child process.
    ///
    /// Returns `true` if the process was found terminated during this call, in
    /// which case the stdin pipe is closed and the module moves to `Failed`.
    pub(crate) fn reap(&mut self) -> Result<bool> {
        let Some(process) = self.process.as_mut() else {
            return Ok(false);
        };

        match process.child.try_wait() {
            Ok(None) => Ok(false),
            Ok(Some(status)) => {
                // Dropping the process closes our end of the pipe
                self.process = None;
                self.state = ModuleState::Failed;
                self.return_value = exit_code(status);
                log::warn!(
                    "Module {} terminated, should be running (return value {})",
                    self.name,
                    self.return_value
                );
                Ok(true)
            }
            Err(source) => Err(Error::Wait {
                name: self.name.clone(),
                source,
            }),
        }
    }
}

/// Numeric exit code, or [`ABNORMAL_EXIT`] when there is none
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(ABNORMAL_EXIT)
}
