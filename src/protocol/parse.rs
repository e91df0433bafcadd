//! Incoming message decoding and validation

use super::constants::*;
use super::{AttributeTag, Command, ProtocolError};

/// Decoded fixed-size message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Producer timestamp in microseconds (advisory)
    pub timestamp_us: u64,
    /// Sender protocol version
    pub protocol_version: u8,
    /// Raw command code
    pub command: i8,
    /// Attribute bytes following the header
    pub payload_length: u16,
}

impl ControlHeader {
    /// Known command for this header, if any
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command)
    }

    /// Payload length as usize
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload_length as usize
    }
}

/// Parse the 12-byte header from the start of `buffer`
pub fn decode_header(buffer: &[u8]) -> Result<ControlHeader, ProtocolError> {
    let header: &[u8; CONTROL_HEADER_BYTES] = buffer
        .get(..CONTROL_HEADER_BYTES)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::TruncatedHeader(buffer.len()))?;

    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&header[HEADER_TIMESTAMP_OFFSET..HEADER_VERSION_OFFSET]);

    Ok(ControlHeader {
        timestamp_us: u64::from_be_bytes(timestamp),
        protocol_version: header[HEADER_VERSION_OFFSET],
        command: header[HEADER_COMMAND_OFFSET] as i8,
        payload_length: u16::from_be_bytes([
            header[HEADER_PAYLOAD_LENGTH_OFFSET],
            header[HEADER_PAYLOAD_LENGTH_OFFSET + 1],
        ]),
    })
}

/// Zero-copy view of one validated attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute<'a> {
    tag: AttributeTag,
    data: &'a [u8],
}

impl<'a> Attribute<'a> {
    /// Attribute tag
    #[inline]
    pub fn tag(&self) -> AttributeTag {
        self.tag
    }

    /// Raw attribute data, including the NUL terminator for strings
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// String value up to the first NUL
    pub fn as_str(&self) -> Result<&'a str, ProtocolError> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::NotTerminated(self.tag))?;
        std::str::from_utf8(&self.data[..end]).map_err(|_| ProtocolError::InvalidUtf8(self.tag))
    }

    /// Big-endian u16 value
    pub fn as_u16(&self) -> Result<u16, ProtocolError> {
        self.fixed::<2>().map(u16::from_be_bytes)
    }

    /// Big-endian i32 value
    pub fn as_i32(&self) -> Result<i32, ProtocolError> {
        self.fixed::<4>().map(i32::from_be_bytes)
    }

    fn fixed<const N: usize>(&self) -> Result<[u8; N], ProtocolError> {
        self.data
            .try_into()
            .map_err(|_| ProtocolError::InvalidLength {
                tag: self.tag,
                expected: N,
                actual: self.data.len(),
            })
    }
}

/// Validate `payload` against the attribute schema of a command.
///
/// The payload is walked strictly in `expected` order. For every position the
/// attribute header must fit, the tag must match, the data must fit, be
/// non-empty, match the tag's fixed length if it has one, and end in NUL if the
/// tag is a string. The payload must be exactly `header.payload_length` bytes
/// and be fully consumed by the schema. Any violation rejects the whole message.
pub fn parse_message<'a>(
    header: &ControlHeader,
    payload: &'a [u8],
    expected: &[AttributeTag],
) -> Result<Vec<Attribute<'a>>, ProtocolError> {
    let declared = header.payload_len();
    if payload.len() != declared {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    let mut attributes = Vec::with_capacity(expected.len());
    let mut offset = 0;

    for (position, &tag) in expected.iter().enumerate() {
        let remaining = &payload[offset..];

        if remaining.len() < ATTRIBUTE_HEADER_BYTES {
            return Err(ProtocolError::MissingAttribute {
                position,
                expected: tag,
            });
        }

        let found = remaining[ATTRIBUTE_TAG_OFFSET];
        let length = remaining[ATTRIBUTE_LENGTH_OFFSET] as usize;

        if found != tag.code() {
            return Err(ProtocolError::UnexpectedAttribute {
                position,
                expected: tag,
                found,
            });
        }

        let data = remaining
            .get(ATTRIBUTE_DATA_OFFSET..ATTRIBUTE_DATA_OFFSET + length)
            .ok_or(ProtocolError::AttributeOverrun(tag))?;

        if length == 0 {
            return Err(ProtocolError::EmptyAttribute(tag));
        }

        if let Some(required) = tag.fixed_length()
            && required != length
        {
            return Err(ProtocolError::InvalidLength {
                tag,
                expected: required,
                actual: length,
            });
        }

        if tag.zero_terminated() && data.last() != Some(&0) {
            return Err(ProtocolError::NotTerminated(tag));
        }

        attributes.push(Attribute { tag, data });
        offset += ATTRIBUTE_HEADER_BYTES + length;
    }

    if offset != payload.len() {
        return Err(ProtocolError::TrailingBytes(payload.len() - offset));
    }

    Ok(attributes)
}
