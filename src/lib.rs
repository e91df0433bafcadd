//! Sutradhar - Module supervisor for robot control
//!
//! Starts, stops and health-monitors named worker processes ("modules") on
//! behalf of a single remote operator connected over TCP.
//!
//! ## Components
//!
//! - [`protocol`]: binary TLV control protocol (encoder and validating parser)
//! - [`supervisor`]: module table and process lifecycle state machine
//! - [`server`]: single-client control server with idle health push
//! - [`client`]: blocking client for operator tooling

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod supervisor;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use server::ControlServer;
pub use shutdown::Shutdown;
pub use supervisor::{ModuleState, Supervisor};
