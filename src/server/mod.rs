//! Control server
//!
//! Accepts one client at a time and hands it to a [`Session`]. The accept
//! wait is bounded by the configured timeout so the shutdown token is seen
//! between waits. When shutdown is requested, the current session finishes,
//! every enabled module is disabled and the listening socket is released.

mod session;

pub use session::Session;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use crate::supervisor::Supervisor;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

/// Poll interval of the nonblocking accept loop
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Single-client control server owning the module supervisor
pub struct ControlServer {
    listener: TcpListener,
    timeout: Duration,
    supervisor: Supervisor,
    shutdown: Shutdown,
}

impl ControlServer {
    /// Bind the listening socket.
    ///
    /// `timeout` bounds each accept wait and becomes the receive timeout
    /// (health-push interval) of accepted connections.
    pub fn bind(address: &str, timeout: Duration, shutdown: Shutdown) -> Result<Self> {
        let listen_error = |source| Error::Listen {
            address: address.to_string(),
            source,
        };
        let listener = TcpListener::bind(address).map_err(listen_error)?;
        listener.set_nonblocking(true).map_err(listen_error)?;

        log::info!("Control server listening on {}", address);
        Ok(Self {
            listener,
            timeout,
            supervisor: Supervisor::new(),
            shutdown,
        })
    }

    /// Bind using the `[server]` configuration section
    pub fn from_config(config: &ServerConfig, shutdown: Shutdown) -> Result<Self> {
        Self::bind(&config.listen_address(), config.timeout(), shutdown)
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Module table
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Wait up to the configured timeout for a client.
    ///
    /// Returns `None` on timeout, on shutdown, or if the connection could not
    /// be prepared. An accept error is logged and the rest of the wait is
    /// slept out, so the caller never retries faster than once per timeout.
    pub fn wait_for_client(&self) -> Option<(TcpStream, SocketAddr)> {
        let deadline = Instant::now() + self.timeout;

        loop {
            if self.shutdown.is_requested() {
                return None;
            }

            match self.listener.accept() {
                Ok((stream, addr)) => {
                    return match self.prepare(&stream) {
                        Ok(()) => Some((stream, addr)),
                        Err(e) => {
                            log::error!("Failed to configure connection from {}: {}", addr, e);
                            None
                        }
                    };
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    self.sleep_until(deadline);
                    return None;
                }
            }
        }
    }

    /// Sleep in poll-interval steps until `deadline` or shutdown
    fn sleep_until(&self, deadline: Instant) {
        while !self.shutdown.is_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(ACCEPT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Blocking reads with the health-push interval as timeout
    fn prepare(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)
    }

    /// Serve clients until shutdown is requested or a fatal error occurs.
    ///
    /// All modules are disabled before returning, in both cases.
    pub fn run(mut self) -> Result<()> {
        log::info!("Waiting for control client");

        let result = self.serve();

        log::info!("Shutting down, disabling all modules...");
        match self.supervisor.disable_all() {
            Ok(names) => {
                for name in &names {
                    log::info!("Disabled {}", name);
                }
            }
            Err(e) => log::error!("Failed to disable modules: {}", e),
        }

        result
    }

    fn serve(&mut self) -> Result<()> {
        while !self.shutdown.is_requested() {
            let Some((mut stream, addr)) = self.wait_for_client() else {
                continue;
            };

            log::info!("Client connected: {}", addr);
            Session::new(&mut self.supervisor, &self.shutdown).run(&mut stream)?;
        }
        Ok(())
    }
}
