//! Module control protocol
//!
//! Binary request/response protocol spoken between the operator (client) and
//! the supervisor over a single TCP stream.
//!
//! # Framing
//!
//! ```text
//! ┌────────────────────┬─────────┬─────────┬────────────────┬────────────────────┐
//! │ timestamp_us (u64) │ version │ command │ payload_length │ attributes ...     │
//! │ big-endian         │ u8      │ i8      │ u16 big-endian │ payload_length     │
//! └────────────────────┴─────────┴─────────┴────────────────┴────────────────────┘
//!  <-------------------------- 12 byte header ----------------------------------->
//! ```
//!
//! Each attribute is a TLV triple: `tag(u8) | length(u8) | data(length)`.
//! Multi-byte attribute values are big-endian, strings carry a trailing NUL
//! that is counted in `length`.
//!
//! # Positional Attributes
//!
//! Every command has a fixed attribute shape, see [`Command::schema`]. The
//! parser walks the payload in schema order and rejects the whole message on
//! the first missing, reordered, oversized or malformed attribute. There is no
//! lookahead and no partial acceptance.
//!
//! | Command | Code | Attributes |
//! |---------|------|------------|
//! | `KEEPALIVE` | 0 | none |
//! | `ENABLE` | 1 | `UNIQUE_NAME`, `CALL`, `CREATION_DELAY_MS` |
//! | `DISABLE` | 2 | `UNIQUE_NAME` |
//! | `DISABLE_ALL` | 3 | none |
//! | `ENABLED` | -1 | `UNIQUE_NAME` |
//! | `DISABLED` | -2 | `UNIQUE_NAME` |
//! | `FAILED` | -3 | `UNIQUE_NAME`, `RETURN_VALUE` |

pub mod constants;
pub mod packet;
pub mod parse;

pub use constants::*;
pub use packet::{
    TxMessage, append_attribute, append_attribute_i32, append_attribute_string,
    append_attribute_u16, encode_header, message_length,
};
pub use parse::{Attribute, ControlHeader, decode_header, parse_message};

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Command codes. Requests are non-negative, responses and notifications negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Command {
    /// Liveness check; answered with failures or a keepalive
    Keepalive = 0,
    /// Start a module
    Enable = 1,
    /// Stop a module
    Disable = 2,
    /// Stop every enabled module
    DisableAll = 3,
    /// Module is running
    Enabled = -1,
    /// Module was stopped on request
    Disabled = -2,
    /// Module process terminated on its own
    Failed = -3,
}

const NO_ATTRIBUTES: &[AttributeTag] = &[];
const ENABLE_ATTRIBUTES: &[AttributeTag] = &[
    AttributeTag::UniqueName,
    AttributeTag::Call,
    AttributeTag::CreationDelayMs,
];
const NAME_ATTRIBUTES: &[AttributeTag] = &[AttributeTag::UniqueName];
const FAILED_ATTRIBUTES: &[AttributeTag] = &[AttributeTag::UniqueName, AttributeTag::ReturnValue];

impl Command {
    /// Wire code of this command
    #[inline]
    pub fn code(self) -> i8 {
        self as i8
    }

    /// Look up a command by wire code
    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(Command::Keepalive),
            1 => Some(Command::Enable),
            2 => Some(Command::Disable),
            3 => Some(Command::DisableAll),
            -1 => Some(Command::Enabled),
            -2 => Some(Command::Disabled),
            -3 => Some(Command::Failed),
            _ => None,
        }
    }

    /// Whether a client may send this command to the supervisor
    pub fn is_request(self) -> bool {
        self.code() >= 0
    }

    /// Expected attributes, in wire order
    pub fn schema(self) -> &'static [AttributeTag] {
        match self {
            Command::Keepalive | Command::DisableAll => NO_ATTRIBUTES,
            Command::Enable => ENABLE_ATTRIBUTES,
            Command::Disable | Command::Enabled | Command::Disabled => NAME_ATTRIBUTES,
            Command::Failed => FAILED_ATTRIBUTES,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Keepalive => "KEEPALIVE",
            Command::Enable => "ENABLE",
            Command::Disable => "DISABLE",
            Command::DisableAll => "DISABLE_ALL",
            Command::Enabled => "ENABLED",
            Command::Disabled => "DISABLED",
            Command::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Attribute tags known to the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttributeTag {
    /// Module name (NUL-terminated string)
    UniqueName = 0,
    /// Module command line (NUL-terminated string)
    Call = 1,
    /// Startup grace period in milliseconds (u16)
    CreationDelayMs = 2,
    /// Process exit code (i32)
    ReturnValue = 3,
}

impl AttributeTag {
    /// Wire value of this tag
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a tag by wire value
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AttributeTag::UniqueName),
            1 => Some(AttributeTag::Call),
            2 => Some(AttributeTag::CreationDelayMs),
            3 => Some(AttributeTag::ReturnValue),
            _ => None,
        }
    }

    /// Required data length for fixed-size attributes
    pub fn fixed_length(self) -> Option<usize> {
        match self {
            AttributeTag::UniqueName | AttributeTag::Call => None,
            AttributeTag::CreationDelayMs => Some(size_of::<u16>()),
            AttributeTag::ReturnValue => Some(size_of::<i32>()),
        }
    }

    /// Whether the last data byte must be NUL
    pub fn zero_terminated(self) -> bool {
        matches!(self, AttributeTag::UniqueName | AttributeTag::Call)
    }
}

impl fmt::Display for AttributeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeTag::UniqueName => "UNIQUE_NAME",
            AttributeTag::Call => "CALL",
            AttributeTag::CreationDelayMs => "CREATION_DELAY_MS",
            AttributeTag::ReturnValue => "RETURN_VALUE",
        };
        f.write_str(name)
    }
}

/// Encoding and validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Destination buffer or message size limit exceeded
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Attribute data longer than the one-byte length field allows
    #[error("Attribute too large: {0} bytes (max 255)")]
    AttributeTooLarge(usize),

    /// String attribute contains a NUL before its end
    #[error("String attribute contains an interior NUL byte")]
    InteriorNul,

    /// Fewer bytes than a header
    #[error("Truncated header: need 12 bytes, have {0}")]
    TruncatedHeader(usize),

    /// Declared payload length differs from the bytes supplied
    #[error("Payload length mismatch: header declares {declared} bytes, got {actual}")]
    PayloadLengthMismatch {
        /// Length from the header
        declared: usize,
        /// Length of the supplied payload
        actual: usize,
    },

    /// Payload ended where an attribute header was expected
    #[error("Missing attribute {expected} at position {position}")]
    MissingAttribute {
        /// Index in the schema
        position: usize,
        /// Tag expected there
        expected: AttributeTag,
    },

    /// Attribute tag differs from the schema
    #[error("Unexpected attribute tag {found} at position {position}, expected {expected}")]
    UnexpectedAttribute {
        /// Index in the schema
        position: usize,
        /// Tag expected there
        expected: AttributeTag,
        /// Raw tag found on the wire
        found: u8,
    },

    /// Attribute data runs past the end of the payload
    #[error("Attribute {0} overruns payload")]
    AttributeOverrun(AttributeTag),

    /// Attribute with zero-length data
    #[error("Attribute {0} is empty")]
    EmptyAttribute(AttributeTag),

    /// Fixed-size attribute with the wrong length
    #[error("Attribute {tag} has length {actual}, expected {expected}")]
    InvalidLength {
        /// Attribute tag
        tag: AttributeTag,
        /// Required length
        expected: usize,
        /// Length found
        actual: usize,
    },

    /// NUL-terminated attribute without terminator
    #[error("Attribute {0} is not NUL-terminated")]
    NotTerminated(AttributeTag),

    /// String attribute is not valid UTF-8
    #[error("Attribute {0} is not valid UTF-8")]
    InvalidUtf8(AttributeTag),

    /// Bytes left over after the last expected attribute
    #[error("{0} trailing bytes after last attribute")]
    TrailingBytes(usize),

    /// Declared payload does not fit a message buffer
    #[error("Payload too large: {0} bytes (max 500)")]
    PayloadTooLarge(usize),

    /// Command code unknown, or not valid in this direction
    #[error("Unexpected command code {0}")]
    UnexpectedCommand(i8),
}

/// Microseconds since the Unix epoch
pub fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
