//! Control session with one connected client
//!
//! # Receive Loop
//!
//! ```text
//! ┌──────────────┐  timeout, nothing read   ┌─────────────┐
//! │ read header  │─────────────────────────▶│ health push │──┐
//! └──────┬───────┘                          └─────────────┘  │
//!        │ 12 bytes                              ▲           │
//!        ▼                                       │ KEEPALIVE │
//! ┌──────────────┐      ┌───────────────┐        │           │
//! │ read payload │─────▶│ parse/dispatch│────────┘           │
//! └──────────────┘      └───────────────┘                    │
//!        ▲                                                   │
//!        └───────────────────────────────────────────────────┘
//! ```
//!
//! The stream's read timeout doubles as the health-push interval: every time
//! it expires with no header bytes received, the client is sent one `FAILED`
//! per module that died since the last poll, or a single `KEEPALIVE`.
//!
//! # Error Handling
//!
//! - Malformed and unsupported messages are logged and dropped, no reply.
//! - Read/write errors and disconnects end the session; modules keep running.
//! - Fatal supervisor errors are returned to the server.

use crate::error::{Error, Result};
use crate::protocol::{
    CONTROL_BUFFER_BYTES, CONTROL_HEADER_BYTES, CONTROL_MAX_PAYLOAD_BYTES,
    CONTROL_PROTOCOL_VERSION, Command, ControlHeader, ProtocolError, TxMessage, decode_header,
    parse_message,
};
use crate::shutdown::Shutdown;
use crate::supervisor::{ABNORMAL_EXIT, ModuleState, Supervisor};
use std::io::{self, Read};
use std::net::TcpStream;
use std::ops::Range;
use std::sync::Once;

/// Version mismatches are reported once per process
static VERSION_MISMATCH: Once = Once::new();

/// Result of waiting for a span of the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// All requested bytes received
    Complete,
    /// Read timed out before the first byte
    Idle,
    /// Peer closed the connection, or shutdown was requested mid-read
    Closed,
}

/// Decoded client request with owned attribute values
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Keepalive,
    Enable {
        name: String,
        call: String,
        creation_delay_ms: u16,
    },
    Disable {
        name: String,
    },
    DisableAll,
}

impl Request {
    fn parse(header: &ControlHeader, payload: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let command = header
            .command()
            .filter(|c| c.is_request())
            .ok_or(ProtocolError::UnexpectedCommand(header.command))?;
        let attrs = parse_message(header, payload, command.schema())?;

        let request = match command {
            Command::Keepalive => Request::Keepalive,
            Command::Enable => Request::Enable {
                name: attrs[0].as_str()?.to_string(),
                call: attrs[1].as_str()?.to_string(),
                creation_delay_ms: attrs[2].as_u16()?,
            },
            Command::Disable => Request::Disable {
                name: attrs[0].as_str()?.to_string(),
            },
            Command::DisableAll => Request::DisableAll,
            Command::Enabled | Command::Disabled | Command::Failed => {
                return Err(ProtocolError::UnexpectedCommand(header.command));
            }
        };
        Ok(request)
    }
}

/// Serves requests from one client against the supervisor
pub struct Session<'a> {
    supervisor: &'a mut Supervisor,
    shutdown: &'a Shutdown,
    /// Receive buffer for one message (header + payload)
    buffer: [u8; CONTROL_BUFFER_BYTES],
}

impl<'a> Session<'a> {
    pub fn new(supervisor: &'a mut Supervisor, shutdown: &'a Shutdown) -> Self {
        Self {
            supervisor,
            shutdown,
            buffer: [0u8; CONTROL_BUFFER_BYTES],
        }
    }

    /// Serve the client until it disconnects or shutdown is requested.
    ///
    /// The stream's read timeout must be set; it paces the health push.
    /// Only fatal errors are returned.
    pub fn run(&mut self, stream: &mut TcpStream) -> Result<()> {
        let result = self.serve(stream);
        let _ = stream.shutdown(std::net::Shutdown::Both);

        match result {
            Ok(()) => {
                log::info!("Client disconnected");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(Error::Io(ref e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::BrokenPipe
                ) =>
            {
                log::info!("Client disconnected ({})", e.kind());
                Ok(())
            }
            Err(e) => {
                log::warn!("Session ended: {}", e);
                Ok(())
            }
        }
    }

    fn serve(&mut self, stream: &mut TcpStream) -> Result<()> {
        loop {
            if self.shutdown.is_requested() {
                log::debug!("Shutdown requested, closing session");
                return Ok(());
            }

            match self.fill(stream, 0..CONTROL_HEADER_BYTES, true)? {
                Fill::Idle => self.health_push(stream)?,
                Fill::Closed => return Ok(()),
                Fill::Complete => match self.receive_message(stream) {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(e) if e.is_fatal() || matches!(e, Error::Io(_)) => return Err(e),
                    Err(e) => log::warn!("Request failed: {}", e),
                },
            }
        }
    }

    /// Read the payload following a received header and act on it.
    ///
    /// Returns `false` if the connection closed mid-message.
    fn receive_message(&mut self, stream: &mut TcpStream) -> Result<bool> {
        let header = decode_header(&self.buffer)?;
        let payload_len = header.payload_len();

        if payload_len > CONTROL_MAX_PAYLOAD_BYTES {
            log::warn!(
                "Dropping message with {} byte payload (max {})",
                payload_len,
                CONTROL_MAX_PAYLOAD_BYTES
            );
            return self.drain(stream, payload_len);
        }

        let end = CONTROL_HEADER_BYTES + payload_len;
        if self.fill(stream, CONTROL_HEADER_BYTES..end, false)? == Fill::Closed {
            return Ok(false);
        }

        if header.protocol_version != CONTROL_PROTOCOL_VERSION {
            VERSION_MISMATCH.call_once(|| {
                log::warn!(
                    "Client speaks protocol version {}, expected {}",
                    header.protocol_version,
                    CONTROL_PROTOCOL_VERSION
                );
            });
        }

        let request = match Request::parse(&header, &self.buffer[CONTROL_HEADER_BYTES..end]) {
            Ok(request) => request,
            Err(ProtocolError::UnexpectedCommand(code)) => {
                log::warn!("Ignoring unsupported command {}", code);
                return Ok(true);
            }
            Err(e) => {
                log::warn!("Dropping malformed message (command {}): {}", header.command, e);
                return Ok(true);
            }
        };

        log::debug!("Received {:?}", request);
        self.dispatch(stream, request)?;
        Ok(true)
    }

    fn dispatch(&mut self, stream: &mut TcpStream, request: Request) -> Result<()> {
        match request {
            Request::Keepalive => self.health_push(stream),
            Request::Enable {
                name,
                call,
                creation_delay_ms,
            } => self.handle_enable(stream, &name, &call, creation_delay_ms),
            Request::Disable { name } => self.handle_disable(stream, &name),
            Request::DisableAll => {
                for name in self.supervisor.disable_all()? {
                    send(stream, &TxMessage::disabled(&name)?)?;
                }
                Ok(())
            }
        }
    }

    fn handle_enable(
        &mut self,
        stream: &mut TcpStream,
        name: &str,
        call: &str,
        creation_delay_ms: u16,
    ) -> Result<()> {
        let reply = match self.supervisor.enable(name, call, creation_delay_ms) {
            // Program could not be launched
            Ok(ModuleState::Failed) => TxMessage::failed(name, self.return_value(name))?,
            Ok(_) => TxMessage::enabled(name)?,
            Err(Error::AlreadyEnabled(_)) => {
                log::debug!("Module {} already running", name);
                TxMessage::enabled(name)?
            }
            Err(e) => return Err(e),
        };
        send(stream, &reply)
    }

    fn handle_disable(&mut self, stream: &mut TcpStream, name: &str) -> Result<()> {
        let state = match self.supervisor.poll_liveness(name) {
            Ok(state) => state,
            Err(Error::UnknownModule(_)) => {
                log::warn!("DISABLE for unknown module {}", name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let reply = match state {
            ModuleState::Enabled => {
                self.supervisor.disable(name)?;
                TxMessage::disabled(name)?
            }
            ModuleState::Disabled => TxMessage::disabled(name)?,
            ModuleState::Failed => TxMessage::failed(name, self.return_value(name))?,
        };
        send(stream, &reply)
    }

    /// Report newly failed modules, or a keepalive if there are none
    fn health_push(&mut self, stream: &mut TcpStream) -> Result<()> {
        let failed = self.supervisor.poll_all_liveness()?;
        if failed.is_empty() {
            return send(stream, &TxMessage::keepalive());
        }
        for module in &failed {
            send(stream, &TxMessage::failed(&module.name, module.return_value)?)?;
        }
        Ok(())
    }

    fn return_value(&self, name: &str) -> i32 {
        self.supervisor
            .module(name)
            .map(|m| m.return_value())
            .unwrap_or(ABNORMAL_EXIT)
    }

    /// Read `range` of the receive buffer in full.
    ///
    /// Timeouts before the first byte report `Idle` when `idle_allowed`; once
    /// a message has started, timeouts keep waiting unless shutdown is
    /// requested.
    fn fill(
        &mut self,
        stream: &mut TcpStream,
        range: Range<usize>,
        idle_allowed: bool,
    ) -> Result<Fill> {
        let Range { start, end } = range;
        let mut filled = start;

        while filled < end {
            match stream.read(&mut self.buffer[filled..end]) {
                Ok(0) if filled == start => return Ok(Fill::Closed),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    if filled == start && idle_allowed {
                        return Ok(Fill::Idle);
                    }
                    if self.shutdown.is_requested() {
                        return Ok(Fill::Closed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Fill::Complete)
    }

    /// Discard `remaining` payload bytes of an oversized message
    fn drain(&mut self, stream: &mut TcpStream, mut remaining: usize) -> Result<bool> {
        while remaining > 0 {
            let chunk = remaining.min(CONTROL_MAX_PAYLOAD_BYTES);
            let span = CONTROL_HEADER_BYTES..CONTROL_HEADER_BYTES + chunk;
            if self.fill(stream, span, false)? == Fill::Closed {
                return Ok(false);
            }
            remaining -= chunk;
        }
        Ok(true)
    }
}

fn send(stream: &mut TcpStream, message: &TxMessage) -> Result<()> {
    log::trace!("Sending {:?}", message);
    message.send_to(stream)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ControlClient, Notification};
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Run a session on a loopback connection while `f` drives the client side
    fn with_session<F>(supervisor: &mut Supervisor, idle: Duration, f: F)
    where
        F: FnOnce(&mut ControlClient),
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let shutdown = &shutdown;

        thread::scope(|s| {
            let server = s.spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                stream.set_read_timeout(Some(idle)).unwrap();
                Session::new(supervisor, shutdown).run(&mut stream)
            });

            let mut client = ControlClient::connect(addr).unwrap();
            client.set_timeout(Some(Duration::from_secs(5))).unwrap();
            f(&mut client);
            drop(client);

            server.join().unwrap().unwrap();
        });
    }

    fn recv(client: &mut ControlClient) -> Notification {
        client.recv().unwrap().expect("no notification before timeout")
    }

    #[test]
    fn test_keepalive_reply() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_secs(10), |client| {
            client.keepalive().unwrap();
            assert_eq!(recv(client), Notification::Keepalive);
        });
    }

    #[test]
    fn test_idle_health_push() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_millis(50), |client| {
            let start = Instant::now();
            assert_eq!(recv(client), Notification::Keepalive);
            assert_eq!(recv(client), Notification::Keepalive);
            assert!(start.elapsed() >= Duration::from_millis(50));
        });
    }

    #[test]
    fn test_enable_then_disable() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_secs(10), |client| {
            client.enable("reader", "cat", 0).unwrap();
            assert_eq!(recv(client), Notification::Enabled("reader".to_string()));

            // Running module is acknowledged again without a second spawn
            client.enable("reader", "cat", 0).unwrap();
            assert_eq!(recv(client), Notification::Enabled("reader".to_string()));

            client.disable("reader").unwrap();
            assert_eq!(recv(client), Notification::Disabled("reader".to_string()));

            // Already disabled: informative ack
            client.disable("reader").unwrap();
            assert_eq!(recv(client), Notification::Disabled("reader".to_string()));
        });
        assert_eq!(
            supervisor.module("reader").unwrap().state(),
            ModuleState::Disabled
        );
    }

    #[test]
    fn test_launch_failure_answers_failed() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_secs(10), |client| {
            client
                .enable("ghost", "/nonexistent/sutradhar-module", 0)
                .unwrap();
            assert_eq!(
                recv(client),
                Notification::Failed {
                    name: "ghost".to_string(),
                    return_value: ABNORMAL_EXIT
                }
            );
        });
    }

    #[test]
    fn test_failure_pushed_once() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_millis(50), |client| {
            client.enable("short", "true", 0).unwrap();
            assert_eq!(recv(client), Notification::Enabled("short".to_string()));

            let deadline = Instant::now() + Duration::from_secs(3);
            loop {
                match recv(client) {
                    Notification::Failed { name, return_value } => {
                        assert_eq!(name, "short");
                        assert_eq!(return_value, 0);
                        break;
                    }
                    Notification::Keepalive if Instant::now() < deadline => {}
                    other => panic!("unexpected {:?}", other),
                }
            }
            assert_eq!(recv(client), Notification::Keepalive);

            // DISABLE on a failed module reports the failure again
            client.disable("short").unwrap();
            let reply = loop {
                match recv(client) {
                    Notification::Keepalive => {}
                    other => break other,
                }
            };
            assert_eq!(
                reply,
                Notification::Failed {
                    name: "short".to_string(),
                    return_value: 0
                }
            );
        });
    }

    #[test]
    fn test_unknown_disable_has_no_reply() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_secs(10), |client| {
            client.disable("nobody").unwrap();
            client.keepalive().unwrap();
            assert_eq!(recv(client), Notification::Keepalive);
        });
        assert!(supervisor.module("nobody").is_none());
    }

    #[test]
    fn test_malformed_message_dropped() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_secs(10), |client| {
            // DISABLE with an unterminated name
            let mut bytes = TxMessage::new(Command::Disable).as_bytes().to_vec();
            bytes[11] = 5;
            bytes.extend_from_slice(&[0, 3, b'a', b'b', b'c']);
            client.send_raw(&bytes).unwrap();

            // Response command sent as a request
            client.send(&TxMessage::enabled("x").unwrap()).unwrap();

            client.keepalive().unwrap();
            assert_eq!(recv(client), Notification::Keepalive);
        });
        assert!(supervisor.module("abc").is_none());
    }

    #[test]
    fn test_oversized_payload_drained() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_secs(10), |client| {
            let mut bytes = TxMessage::new(Command::Keepalive).as_bytes().to_vec();
            bytes[10..12].copy_from_slice(&1000u16.to_be_bytes());
            bytes.extend(std::iter::repeat_n(0xAA, 1000));
            client.send_raw(&bytes).unwrap();

            client.keepalive().unwrap();
            assert_eq!(recv(client), Notification::Keepalive);
        });
    }

    #[test]
    fn test_version_mismatch_still_processed() {
        let foreign_version = |msg: &TxMessage| {
            let mut bytes = msg.as_bytes().to_vec();
            bytes[crate::protocol::HEADER_VERSION_OFFSET] = CONTROL_PROTOCOL_VERSION + 1;
            bytes
        };

        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_secs(10), |client| {
            client
                .send_raw(&foreign_version(&TxMessage::keepalive()))
                .unwrap();
            assert_eq!(recv(client), Notification::Keepalive);

            // Warned once, still answered
            let enable = TxMessage::enable("reader", "cat", 0).unwrap();
            client.send_raw(&foreign_version(&enable)).unwrap();
            assert_eq!(recv(client), Notification::Enabled("reader".to_string()));

            client.send_raw(&foreign_version(&enable)).unwrap();
            assert_eq!(recv(client), Notification::Enabled("reader".to_string()));
        });
        assert_eq!(
            supervisor.module("reader").unwrap().state(),
            ModuleState::Enabled
        );
    }

    #[test]
    fn test_split_header_reassembled() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_millis(30), |client| {
            let msg = TxMessage::keepalive();
            let (first, rest) = msg.as_bytes().split_at(5);
            client.send_raw(first).unwrap();
            thread::sleep(Duration::from_millis(100));
            client.send_raw(rest).unwrap();
            assert_eq!(recv(client), Notification::Keepalive);
        });
    }

    #[test]
    fn test_disable_all_reports_each_module() {
        let mut supervisor = Supervisor::new();
        with_session(&mut supervisor, Duration::from_secs(10), |client| {
            for name in ["a", "b"] {
                client.enable(name, "cat", 0).unwrap();
                assert_eq!(recv(client), Notification::Enabled(name.to_string()));
            }
            client.disable_all().unwrap();
            assert_eq!(recv(client), Notification::Disabled("a".to_string()));
            assert_eq!(recv(client), Notification::Disabled("b".to_string()));
        });
    }

    #[test]
    fn test_request_parse_rejects_notifications() {
        let msg = TxMessage::disabled("m").unwrap();
        let header = decode_header(msg.as_bytes()).unwrap();
        assert_eq!(
            Request::parse(&header, &msg.as_bytes()[CONTROL_HEADER_BYTES..]),
            Err(ProtocolError::UnexpectedCommand(-2))
        );
    }

    #[test]
    fn test_client_disconnect_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        // Half a header, then hang up
        client.write_all(&[0u8; 6]).unwrap();
        drop(client);

        let mut supervisor = Supervisor::new();
        let shutdown = Shutdown::new();
        assert!(Session::new(&mut supervisor, &shutdown).run(&mut stream).is_ok());
    }
}
