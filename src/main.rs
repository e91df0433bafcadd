//! Sutradhar - Module supervisor daemon
//!
//! Listens for a single control client and starts, stops and monitors the
//! modules it asks for. All modules are stopped on SIGINT/SIGTERM.

use std::env;
use std::path::Path;
use sutradhar::config::Config;
use sutradhar::error::{Error, Result};
use sutradhar::{ControlServer, Shutdown};

/// Used when no `--config` is given and the file exists
const DEFAULT_CONFIG_PATH: &str = "/etc/sutradhar.toml";

const USAGE: &str = "usage: sutradhar [<port> <timeout_ms>] [--config <path>]";

/// Command line options
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config_path: Option<String>,
    port: Option<u16>,
    timeout_ms: Option<u64>,
}

/// Parse command line arguments.
///
/// Supports:
/// - `sutradhar <port> <timeout_ms>` (positional, overrides the config file)
/// - `sutradhar --config <path>` (flag-based)
/// - `sutradhar -c <path>` (short flag)
fn parse_args(args: &[String]) -> Result<Args> {
    let mut parsed = Args::default();
    let mut positional = Vec::new();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter
                    .next()
                    .ok_or_else(|| Error::Config(format!("{} requires a path\n{}", arg, USAGE)))?;
                parsed.config_path = Some(path.clone());
            }
            flag if flag.starts_with('-') => {
                return Err(Error::Config(format!("unknown option {}\n{}", flag, USAGE)));
            }
            value => positional.push(value),
        }
    }

    match positional.as_slice() {
        [] => {}
        [port, timeout_ms] => {
            parsed.port = Some(
                port.parse()
                    .map_err(|_| Error::Config(format!("invalid port: {}", port)))?,
            );
            parsed.timeout_ms = Some(
                timeout_ms
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid timeout: {}", timeout_ms)))?,
            );
        }
        _ => return Err(Error::Config(USAGE.to_string())),
    }

    Ok(parsed)
}

/// Load the config file (if any) and apply command line overrides
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)?,
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.server.timeout_ms = timeout_ms;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let args = parse_args(&args)?;
    let config = load_config(&args)?;

    // Initialize logger (RUST_LOG overrides the configured level)
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    log::info!("Sutradhar v{} starting...", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &args.config_path {
        log::info!("Using config: {}", path);
    }
    log::info!(
        "Listening on {} (timeout {} ms)",
        config.server.listen_address(),
        config.server.timeout_ms
    );

    let shutdown = Shutdown::new();
    shutdown.register_signals()?;

    let server = ControlServer::from_config(&config.server, shutdown)?;
    log::info!("Sutradhar running. Press Ctrl-C to stop.");

    if let Err(e) = server.run() {
        log::error!("Fatal error: {}", e);
        return Err(e);
    }

    log::info!("Sutradhar stopped");
    Ok(())
}
