//! Blocking client for the module control protocol.
//!
//! Used by operator tooling and by the integration tests. Requests are
//! fire-and-forget; replies and health pushes are read with [`ControlClient::recv`].
//!
//! ```no_run
//! use sutradhar::client::{ControlClient, Notification};
//!
//! let mut client = ControlClient::connect("127.0.0.1:8004")?;
//! client.enable("drive", "./wheels 8003 500", 100)?;
//! if let Some(Notification::Enabled(name)) = client.recv()? {
//!     println!("{} is up", name);
//! }
//! # Ok::<(), sutradhar::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::protocol::{
    CONTROL_BUFFER_BYTES, CONTROL_HEADER_BYTES, CONTROL_MAX_PAYLOAD_BYTES, Command,
    ControlHeader, ProtocolError, TxMessage, decode_header, parse_message,
};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Message received from the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// No failures since the last health push
    Keepalive,
    /// Module is running
    Enabled(String),
    /// Module is stopped
    Disabled(String),
    /// Module process terminated
    Failed { name: String, return_value: i32 },
}

impl Notification {
    /// Decode a supervisor-to-client message
    pub fn parse(header: &ControlHeader, payload: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let command = header
            .command()
            .filter(|c| !c.is_request() || *c == Command::Keepalive)
            .ok_or(ProtocolError::UnexpectedCommand(header.command))?;
        let attrs = parse_message(header, payload, command.schema())?;

        let notification = match command {
            Command::Keepalive => Notification::Keepalive,
            Command::Enabled => Notification::Enabled(attrs[0].as_str()?.to_string()),
            Command::Disabled => Notification::Disabled(attrs[0].as_str()?.to_string()),
            Command::Failed => Notification::Failed {
                name: attrs[0].as_str()?.to_string(),
                return_value: attrs[1].as_i32()?,
            },
            Command::Enable | Command::Disable | Command::DisableAll => {
                return Err(ProtocolError::UnexpectedCommand(header.command));
            }
        };
        Ok(notification)
    }
}

/// TCP client for a Sutradhar supervisor
pub struct ControlClient {
    stream: TcpStream,
    buffer: [u8; CONTROL_BUFFER_BYTES],
    /// Bytes of the current message received so far
    filled: usize,
}

impl ControlClient {
    /// Connect to a supervisor
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Ok(Self::from_stream(TcpStream::connect(addr)?))
    }

    /// Connect with timeout
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> Result<Self> {
        Ok(Self::from_stream(TcpStream::connect_timeout(addr, timeout)?))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: [0u8; CONTROL_BUFFER_BYTES],
            filled: 0,
        }
    }

    /// Read timeout for [`recv`](Self::recv); `None` blocks indefinitely
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Request a health report
    pub fn keepalive(&mut self) -> Result<()> {
        self.send(&TxMessage::keepalive())
    }

    /// Request a module start
    pub fn enable(&mut self, name: &str, call: &str, creation_delay_ms: u16) -> Result<()> {
        self.send(&TxMessage::enable(name, call, creation_delay_ms)?)
    }

    /// Request a module stop
    pub fn disable(&mut self, name: &str) -> Result<()> {
        self.send(&TxMessage::disable(name)?)
    }

    /// Request all modules stop
    pub fn disable_all(&mut self) -> Result<()> {
        self.send(&TxMessage::disable_all())
    }

    /// Send an encoded message
    pub fn send(&mut self, message: &TxMessage) -> Result<()> {
        message.send_to(&mut self.stream)?;
        Ok(())
    }

    /// Send raw bytes, bypassing the encoder
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Receive the next notification.
    ///
    /// Returns `Ok(None)` if the read timeout expires before the message is
    /// complete. Bytes received so far are kept and the next call resumes
    /// the same message.
    pub fn recv(&mut self) -> Result<Option<Notification>> {
        if !self.fill_to(CONTROL_HEADER_BYTES)? {
            return Ok(None);
        }

        let header = decode_header(&self.buffer)?;
        let payload_len = header.payload_len();
        if payload_len > CONTROL_MAX_PAYLOAD_BYTES {
            self.filled = 0;
            return Err(ProtocolError::PayloadTooLarge(payload_len).into());
        }

        let end = CONTROL_HEADER_BYTES + payload_len;
        if !self.fill_to(end)? {
            return Ok(None);
        }
        self.filled = 0;

        let notification = Notification::parse(&header, &self.buffer[CONTROL_HEADER_BYTES..end])?;
        log::trace!("Received {:?}", notification);
        Ok(Some(notification))
    }

    /// Read until `end` bytes of the message are buffered.
    ///
    /// Returns `false` on read timeout.
    fn fill_to(&mut self, end: usize) -> Result<bool> {
        while self.filled < end {
            match self.stream.read(&mut self.buffer[self.filled..end]) {
                Ok(0) => return Err(Error::Io(ErrorKind::UnexpectedEof.into())),
                Ok(n) => self.filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(false);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(true)
    }
}
