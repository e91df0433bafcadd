//! Error types for Sutradhar

use crate::protocol::ProtocolError;
use crate::supervisor::ModuleState;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Sutradhar error types
///
/// Variants fall into two groups. Failures of OS primitives the supervisor
/// cannot work without (process creation, waiting on children, the listening
/// socket, signal registration) are fatal, see [`Error::is_fatal`]. Everything
/// else is local to one module or one message and is absorbed by the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control message could not be encoded or failed validation
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No module with this name has ever been enabled
    #[error("No such module: {0}")]
    UnknownModule(String),

    /// Module is enabled and its process is still running
    #[error("Module {0} is already enabled")]
    AlreadyEnabled(String),

    /// Operation requires an enabled module
    #[error("Module {name} is not enabled (state: {state})")]
    NotEnabled {
        /// Module name
        name: String,
        /// State the module was found in
        state: ModuleState,
    },

    /// Process creation primitive failed (pipe, fork)
    #[error("Failed to spawn module {name}: {source}")]
    Spawn {
        /// Module name
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Waiting on a child process failed
    #[error("Failed to wait for module {name}: {source}")]
    Wait {
        /// Module name
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Control socket could not be set up
    #[error("Failed to listen on {address}: {source}")]
    Listen {
        /// Requested bind address
        address: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Signal handler registration failed
    #[error("Failed to register signal handler: {0}")]
    Signal(String),
}

impl Error {
    /// Whether this error must terminate the hosting process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Spawn { .. } | Error::Wait { .. } | Error::Listen { .. } | Error::Signal(_)
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
