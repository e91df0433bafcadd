//! Cooperative shutdown token
//!
//! The server checks the token between accept waits and between session
//! reads. Nothing in flight (an ENABLE grace sleep, a DISABLE wait) is
//! interrupted.

use crate::error::{Error, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop request flag
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this token to stop
    pub fn request(&self) {
        self.requested.store(true, Ordering::Relaxed);
    }

    /// Whether a stop has been requested
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Request shutdown on SIGINT or SIGTERM.
    ///
    /// Spawns a listener thread that lives until the first signal arrives.
    pub fn register_signals(&self) -> Result<()> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|e| Error::Signal(e.to_string()))?;
        let shutdown = self.clone();

        std::thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    log::info!("Received signal {}, initiating shutdown...", sig);
                    shutdown.request();
                }
            })
            .map_err(|e| Error::Signal(format!("failed to spawn signal thread: {}", e)))?;

        Ok(())
    }
}
