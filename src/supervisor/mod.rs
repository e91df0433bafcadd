//! Module supervisor
//!
//! Owns the table of named modules and enforces their lifecycle:
//!
//! ```text
//!              enable                     process exits
//!  Disabled ───────────────▶ Enabled ────────────────────▶ Failed
//!     ▲                       │  ▲                           │
//!     └──────── disable ──────┘  └────────── enable ─────────┘
//! ```
//!
//! Modules are created on their first `enable` and never removed. Processes
//! are only inspected at poll points ([`Supervisor::poll_liveness`],
//! [`Supervisor::poll_all_liveness`]); nothing interrupts the caller when a
//! child dies.
//!
//! # Failure Model
//!
//! Unknown names and invalid transitions return recoverable errors and leave
//! the table unchanged. Failures of the process primitives themselves
//! ([`Error::Spawn`], [`Error::Wait`]) are fatal for the whole supervisor; see
//! [`Error::is_fatal`].

mod module;
mod spawn;

pub use module::{ABNORMAL_EXIT, FailedModule, Module, ModuleState};
pub use spawn::tokenize;

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::thread;
use std::time::Duration;

/// Table of supervised modules, keyed by unique name
#[derive(Debug, Default)]
pub struct Supervisor {
    modules: BTreeMap<String, Module>,
}

impl Supervisor {
    /// Create an empty supervisor
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a module by name
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// All modules in table order
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Start a module.
    ///
    /// Creates the module on first use. Each call updates the stored command
    /// line and creation delay. Fails with [`Error::AlreadyEnabled`] if the
    /// module's process is confirmed running by a fresh liveness check.
    ///
    /// After a successful spawn the calling thread sleeps for
    /// `creation_delay_ms` to give the module time to start up. A program
    /// that cannot be launched (missing, not executable, empty command line)
    /// leaves the module `Failed` with [`ABNORMAL_EXIT`] and returns
    /// `Ok(ModuleState::Failed)`. The control session answers that outcome
    /// with `FAILED(name, -1)` instead of `ENABLED`, so a client that
    /// expects an `ENABLED` reply to every ENABLE must also accept `FAILED`.
    pub fn enable(&mut self, name: &str, call: &str, creation_delay_ms: u16) -> Result<ModuleState> {
        self.modules
            .entry(name.to_string())
            .or_insert_with(|| Module::new(name, call, creation_delay_ms));

        if self.poll_liveness(name)? == ModuleState::Enabled {
            return Err(Error::AlreadyEnabled(name.to_string()));
        }

        // Write ends of every running module; the new child must not hold them
        let foreign_fds: Vec<RawFd> = self
            .modules
            .values()
            .filter_map(|m| m.process.as_ref())
            .map(|p| p.stdin_fd())
            .collect();

        let module = self
            .modules
            .get_mut(name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))?;
        module.call = call.to_string();
        module.creation_delay_ms = creation_delay_ms;

        match spawn::spawn_module(call, &foreign_fds) {
            Ok(process) => {
                log::info!(
                    "Enabled module {} (pid {}): {}",
                    name,
                    process.child.id(),
                    call
                );
                module.process = Some(process);
                module.state = ModuleState::Enabled;
                module.return_value = 0;
            }
            Err(e) if spawn::is_launch_failure(&e) => {
                log::warn!("Module {} could not be launched ({}): {}", name, call, e);
                module.state = ModuleState::Failed;
                module.return_value = ABNORMAL_EXIT;
                return Ok(ModuleState::Failed);
            }
            Err(source) => {
                return Err(Error::Spawn {
                    name: name.to_string(),
                    source,
                });
            }
        }

        if creation_delay_ms > 0 {
            thread::sleep(Duration::from_millis(u64::from(creation_delay_ms)));
        }
        Ok(ModuleState::Enabled)
    }

    /// Stop an enabled module.
    ///
    /// Closes the module's stdin and waits for the process to exit. The wait
    /// has no timeout: a module that ignores end-of-input blocks the caller.
    /// Returns the exit code of the stopped process.
    pub fn disable(&mut self, name: &str) -> Result<i32> {
        let module = self
            .modules
            .get_mut(name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))?;

        let Some(process) = module.process.take() else {
            return Err(Error::NotEnabled {
                name: name.to_string(),
                state: module.state,
            });
        };

        let module::ModuleProcess { mut child, stdin } = process;
        drop(stdin);

        let status = child.wait();
        module.state = ModuleState::Disabled;
        let status = status.map_err(|source| Error::Wait {
            name: name.to_string(),
            source,
        })?;

        module.return_value = module::exit_code(status);
        log::info!(
            "Disabled module {} (return value {})",
            name,
            module.return_value
        );
        Ok(module.return_value)
    }

    /// Stop every enabled module, returning their names in table order
    pub fn disable_all(&mut self) -> Result<Vec<String>> {
        let enabled: Vec<String> = self
            .modules
            .values()
            .filter(|m| m.state == ModuleState::Enabled)
            .map(|m| m.name.clone())
            .collect();

        for name in &enabled {
            self.disable(name)?;
        }
        Ok(enabled)
    }

    /// Current state of a module, reaping its process if it has exited
    pub fn poll_liveness(&mut self, name: &str) -> Result<ModuleState> {
        let module = self
            .modules
            .get_mut(name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))?;
        module.reap()?;
        Ok(module.state)
    }

    /// Reap all enabled modules, returning those that failed since the last poll
    pub fn poll_all_liveness(&mut self) -> Result<Vec<FailedModule>> {
        let mut failed = Vec::new();
        for module in self.modules.values_mut() {
            if module.reap()? {
                failed.push(FailedModule {
                    name: module.name.clone(),
                    return_value: module.return_value,
                });
            }
        }
        Ok(failed)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        match self.disable_all() {
            Ok(names) if !names.is_empty() => {
                log::info!("Disabled {} module(s) on teardown", names.len());
            }
            Ok(_) => {}
            Err(e) => log::error!("Failed to disable modules on teardown: {}", e),
        }
    }
}
