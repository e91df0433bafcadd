//! Outgoing message encoding
//!
//! The free functions work on any caller-supplied byte buffer and mirror the
//! order in which a message is built:
//!
//! ```ignore
//! let mut buf = [0u8; CONTROL_BUFFER_BYTES];
//! encode_header(&mut buf, timestamp_us(), Command::Enabled.code())?;
//! append_attribute_string(&mut buf, AttributeTag::UniqueName.code(), "drive")?;
//! stream.write_all(&buf[..message_length(&buf)?])?;
//! ```
//!
//! [`TxMessage`] wraps the same operations around an owned 512-byte buffer,
//! one per message, with constructors for every command the protocol knows.

use super::constants::*;
use super::{AttributeTag, Command, ProtocolError, timestamp_us};
use std::io::{self, Write};

/// Write the fixed header with an empty payload.
///
/// Returns the number of bytes written. Fails only if `buffer` cannot hold a header.
pub fn encode_header(
    buffer: &mut [u8],
    timestamp_us: u64,
    command: i8,
) -> Result<usize, ProtocolError> {
    if buffer.len() < CONTROL_HEADER_BYTES {
        return Err(ProtocolError::BufferTooSmall {
            needed: CONTROL_HEADER_BYTES,
            available: buffer.len(),
        });
    }
    write_header(buffer, timestamp_us, command);
    Ok(CONTROL_HEADER_BYTES)
}

/// Append a raw attribute after the ones already in `buffer`.
///
/// Returns the offset of the attribute data within `buffer`. On error the
/// buffer, including its declared payload length, is left untouched.
pub fn append_attribute(buffer: &mut [u8], tag: u8, data: &[u8]) -> Result<usize, ProtocolError> {
    let offset = reserve_attribute(buffer, tag, data.len())?;
    buffer[offset..offset + data.len()].copy_from_slice(data);
    Ok(offset)
}

/// Append a NUL-terminated string attribute. The terminator counts toward the length.
pub fn append_attribute_string(
    buffer: &mut [u8],
    tag: u8,
    value: &str,
) -> Result<usize, ProtocolError> {
    let bytes = value.as_bytes();
    if bytes.contains(&0) {
        return Err(ProtocolError::InteriorNul);
    }
    let offset = reserve_attribute(buffer, tag, bytes.len() + 1)?;
    buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
    buffer[offset + bytes.len()] = 0;
    Ok(offset)
}

/// Append a big-endian u16 attribute
pub fn append_attribute_u16(buffer: &mut [u8], tag: u8, value: u16) -> Result<usize, ProtocolError> {
    append_attribute(buffer, tag, &value.to_be_bytes())
}

/// Append a big-endian i32 attribute
pub fn append_attribute_i32(buffer: &mut [u8], tag: u8, value: i32) -> Result<usize, ProtocolError> {
    append_attribute(buffer, tag, &value.to_be_bytes())
}

/// Total message length (header + declared payload) of an encoded message
pub fn message_length(buffer: &[u8]) -> Result<usize, ProtocolError> {
    Ok(CONTROL_HEADER_BYTES + read_payload_length(buffer)?)
}

// ============================================================================
// Internal Helpers
// ============================================================================

#[inline]
fn write_header(buffer: &mut [u8], timestamp_us: u64, command: i8) {
    buffer[HEADER_TIMESTAMP_OFFSET..HEADER_VERSION_OFFSET]
        .copy_from_slice(&timestamp_us.to_be_bytes());
    buffer[HEADER_VERSION_OFFSET] = CONTROL_PROTOCOL_VERSION;
    buffer[HEADER_COMMAND_OFFSET] = command as u8;
    write_payload_length(buffer, 0);
}

#[inline]
fn write_payload_length(buffer: &mut [u8], length: u16) {
    buffer[HEADER_PAYLOAD_LENGTH_OFFSET..CONTROL_HEADER_BYTES].copy_from_slice(&length.to_be_bytes());
}

fn read_payload_length(buffer: &[u8]) -> Result<usize, ProtocolError> {
    match buffer.get(HEADER_PAYLOAD_LENGTH_OFFSET..CONTROL_HEADER_BYTES) {
        Some(&[hi, lo]) => Ok(u16::from_be_bytes([hi, lo]) as usize),
        _ => Err(ProtocolError::TruncatedHeader(buffer.len())),
    }
}

/// Write the attribute header, grow the declared payload, return the data offset.
fn reserve_attribute(buffer: &mut [u8], tag: u8, data_len: usize) -> Result<usize, ProtocolError> {
    if data_len > CONTROL_MAX_ATTRIBUTE_DATA_LENGTH {
        return Err(ProtocolError::AttributeTooLarge(data_len));
    }

    let payload_len = read_payload_length(buffer)?;
    let start = CONTROL_HEADER_BYTES + payload_len;
    let end = start + ATTRIBUTE_HEADER_BYTES + data_len;
    let limit = buffer.len().min(CONTROL_BUFFER_BYTES);
    if end > limit {
        return Err(ProtocolError::BufferTooSmall {
            needed: end,
            available: limit,
        });
    }

    buffer[start + ATTRIBUTE_TAG_OFFSET] = tag;
    buffer[start + ATTRIBUTE_LENGTH_OFFSET] = data_len as u8;
    // end <= CONTROL_BUFFER_BYTES, fits u16
    write_payload_length(buffer, (end - CONTROL_HEADER_BYTES) as u16);

    Ok(start + ATTRIBUTE_DATA_OFFSET)
}

// ============================================================================
// Owned Message Buffer
// ============================================================================

/// Single outgoing control message in a fixed 512-byte buffer
///
/// # Example
///
/// ```ignore
/// let msg = TxMessage::failed("lidar", 1)?;
/// msg.send_to(&mut stream)?;
/// ```
#[derive(Clone)]
pub struct TxMessage {
    data: [u8; CONTROL_BUFFER_BYTES],
}

impl TxMessage {
    /// Create a message stamped with the current time
    pub fn new(command: Command) -> Self {
        Self::with_timestamp(timestamp_us(), command)
    }

    /// Create a message with an explicit timestamp
    pub fn with_timestamp(timestamp_us: u64, command: Command) -> Self {
        let mut data = [0u8; CONTROL_BUFFER_BYTES];
        write_header(&mut data, timestamp_us, command.code());
        Self { data }
    }

    /// Append a NUL-terminated string attribute
    pub fn put_string(&mut self, tag: AttributeTag, value: &str) -> Result<(), ProtocolError> {
        append_attribute_string(&mut self.data, tag.code(), value).map(|_| ())
    }

    /// Append a u16 attribute
    pub fn put_u16(&mut self, tag: AttributeTag, value: u16) -> Result<(), ProtocolError> {
        append_attribute_u16(&mut self.data, tag.code(), value).map(|_| ())
    }

    /// Append an i32 attribute
    pub fn put_i32(&mut self, tag: AttributeTag, value: i32) -> Result<(), ProtocolError> {
        append_attribute_i32(&mut self.data, tag.code(), value).map(|_| ())
    }

    /// Encoded length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        let length = [
            self.data[HEADER_PAYLOAD_LENGTH_OFFSET],
            self.data[HEADER_PAYLOAD_LENGTH_OFFSET + 1],
        ];
        CONTROL_HEADER_BYTES + u16::from_be_bytes(length) as usize
    }

    /// Whether the message carries no attributes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == CONTROL_HEADER_BYTES
    }

    /// Encoded bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// Write the message to a stream
    #[inline]
    pub fn send_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.as_bytes())
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// `KEEPALIVE` (request or notification, no attributes)
    pub fn keepalive() -> Self {
        Self::new(Command::Keepalive)
    }

    /// `ENABLE [UNIQUE_NAME, CALL, CREATION_DELAY_MS]`
    pub fn enable(name: &str, call: &str, creation_delay_ms: u16) -> Result<Self, ProtocolError> {
        let mut msg = Self::new(Command::Enable);
        msg.put_string(AttributeTag::UniqueName, name)?;
        msg.put_string(AttributeTag::Call, call)?;
        msg.put_u16(AttributeTag::CreationDelayMs, creation_delay_ms)?;
        Ok(msg)
    }

    /// `DISABLE [UNIQUE_NAME]`
    pub fn disable(name: &str) -> Result<Self, ProtocolError> {
        Self::named(Command::Disable, name)
    }

    /// `DISABLE_ALL`
    pub fn disable_all() -> Self {
        Self::new(Command::DisableAll)
    }

    // ========================================================================
    // Responses and Notifications
    // ========================================================================

    /// `ENABLED [UNIQUE_NAME]`
    pub fn enabled(name: &str) -> Result<Self, ProtocolError> {
        Self::named(Command::Enabled, name)
    }

    /// `DISABLED [UNIQUE_NAME]`
    pub fn disabled(name: &str) -> Result<Self, ProtocolError> {
        Self::named(Command::Disabled, name)
    }

    /// `FAILED [UNIQUE_NAME, RETURN_VALUE]`
    pub fn failed(name: &str, return_value: i32) -> Result<Self, ProtocolError> {
        let mut msg = Self::named(Command::Failed, name)?;
        msg.put_i32(AttributeTag::ReturnValue, return_value)?;
        Ok(msg)
    }

    fn named(command: Command, name: &str) -> Result<Self, ProtocolError> {
        let mut msg = Self::new(command);
        msg.put_string(AttributeTag::UniqueName, name)?;
        Ok(msg)
    }
}

impl std::fmt::Debug for TxMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxMessage")
            .field("command", &(self.data[HEADER_COMMAND_OFFSET] as i8))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = [0xFFu8; 16];
        let written = encode_header(&mut buf, 0x0102_0304_0506_0708, Command::Disable.code()).unwrap();
        assert_eq!(written, 12);
        // Timestamp big-endian
        assert_eq!(&buf[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf[8], CONTROL_PROTOCOL_VERSION);
        assert_eq!(buf[9], 2);
        // Payload length reset to zero
        assert_eq!(&buf[10..12], &[0, 0]);
        assert_eq!(message_length(&buf).unwrap(), 12);
    }

    #[test]
    fn test_header_negative_command() {
        let mut buf = [0u8; 12];
        encode_header(&mut buf, 0, Command::Failed.code()).unwrap();
        assert_eq!(buf[9], 0xFD); // -3 as two's complement
    }

    #[test]
    fn test_header_buffer_too_small() {
        let mut buf = [0u8; 11];
        assert_eq!(
            encode_header(&mut buf, 0, 0),
            Err(ProtocolError::BufferTooSmall {
                needed: 12,
                available: 11
            })
        );
    }

    #[test]
    fn test_string_attribute_appends_nul() {
        let mut buf = [0u8; 64];
        encode_header(&mut buf, 0, Command::Disable.code()).unwrap();
        let offset = append_attribute_string(&mut buf, AttributeTag::UniqueName.code(), "odometry").unwrap();

        assert_eq!(offset, 14);
        assert_eq!(buf[12], AttributeTag::UniqueName.code());
        assert_eq!(buf[13], 9); // 8 chars + NUL
        assert_eq!(&buf[14..22], b"odometry");
        assert_eq!(buf[22], 0);
        assert_eq!(message_length(&buf).unwrap(), 12 + 2 + 9);
    }

    #[test]
    fn test_attributes_are_appended_in_order() {
        let mut buf = [0u8; 64];
        encode_header(&mut buf, 0, Command::Failed.code()).unwrap();
        append_attribute_string(&mut buf, AttributeTag::UniqueName.code(), "a").unwrap();
        let offset = append_attribute_i32(&mut buf, AttributeTag::ReturnValue.code(), -1).unwrap();

        assert_eq!(offset, 12 + 4 + 2);
        assert_eq!(buf[16], AttributeTag::ReturnValue.code());
        assert_eq!(buf[17], 4);
        assert_eq!(&buf[18..22], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(message_length(&buf).unwrap(), 22);
    }

    #[test]
    fn test_u16_attribute_big_endian() {
        let mut buf = [0u8; 32];
        encode_header(&mut buf, 0, Command::Enable.code()).unwrap();
        append_attribute_u16(&mut buf, AttributeTag::CreationDelayMs.code(), 500).unwrap();
        assert_eq!(&buf[12..16], &[2, 2, 0x01, 0xF4]);
    }

    #[test]
    fn test_attribute_too_large_leaves_length() {
        let mut buf = [0u8; CONTROL_BUFFER_BYTES];
        encode_header(&mut buf, 0, Command::Enable.code()).unwrap();
        append_attribute_string(&mut buf, AttributeTag::UniqueName.code(), "m").unwrap();
        let before = message_length(&buf).unwrap();

        let data = [b'x'; 256];
        assert_eq!(
            append_attribute(&mut buf, AttributeTag::Call.code(), &data),
            Err(ProtocolError::AttributeTooLarge(256))
        );
        assert_eq!(message_length(&buf).unwrap(), before);

        // 255 chars + NUL is one byte too many as well
        let long = "y".repeat(255);
        assert_eq!(
            append_attribute_string(&mut buf, AttributeTag::Call.code(), &long),
            Err(ProtocolError::AttributeTooLarge(256))
        );
        assert_eq!(message_length(&buf).unwrap(), before);
    }

    #[test]
    fn test_max_attribute_fits() {
        let mut buf = [0u8; CONTROL_BUFFER_BYTES];
        encode_header(&mut buf, 0, Command::Enable.code()).unwrap();
        let data = [b'z'; 255];
        append_attribute(&mut buf, AttributeTag::Call.code(), &data).unwrap();
        assert_eq!(message_length(&buf).unwrap(), 12 + 2 + 255);
    }

    #[test]
    fn test_buffer_too_small() {
        let mut buf = [0u8; 20];
        encode_header(&mut buf, 0, Command::Disable.code()).unwrap();
        assert_eq!(
            append_attribute_string(&mut buf, AttributeTag::UniqueName.code(), "toolong"),
            Err(ProtocolError::BufferTooSmall {
                needed: 22,
                available: 20
            })
        );
        assert_eq!(message_length(&buf).unwrap(), 12);
    }

    #[test]
    fn test_message_size_limit_applies_to_large_buffers() {
        let mut buf = vec![0u8; 2048];
        encode_header(&mut buf, 0, Command::Enable.code()).unwrap();
        let data = [b'a'; 255];
        append_attribute(&mut buf, AttributeTag::Call.code(), &data).unwrap();
        // 12 + 257 + 257 = 526 > 512
        assert!(matches!(
            append_attribute(&mut buf, AttributeTag::Call.code(), &data),
            Err(ProtocolError::BufferTooSmall { available: 512, .. })
        ));
    }

    #[test]
    fn test_interior_nul_rejected() {
        let mut buf = [0u8; 32];
        encode_header(&mut buf, 0, Command::Disable.code()).unwrap();
        assert_eq!(
            append_attribute_string(&mut buf, AttributeTag::UniqueName.code(), "a\0b"),
            Err(ProtocolError::InteriorNul)
        );
    }

    #[test]
    fn test_append_without_header() {
        let mut buf = [0u8; 4];
        assert_eq!(
            append_attribute(&mut buf, 0, b"x"),
            Err(ProtocolError::TruncatedHeader(4))
        );
    }

    #[test]
    fn test_tx_message_failed() {
        let msg = TxMessage::failed("lidar", 7).unwrap();
        let bytes = msg.as_bytes();
        assert_eq!(bytes.len(), 12 + (2 + 6) + (2 + 4));
        assert_eq!(bytes[9] as i8, Command::Failed.code());
        assert_eq!(&bytes[bytes.len() - 4..], &7i32.to_be_bytes());
        assert!(!msg.is_empty());
    }

    #[test]
    fn test_tx_message_keepalive_is_header_only() {
        let msg = TxMessage::keepalive();
        assert_eq!(msg.len(), CONTROL_HEADER_BYTES);
        assert!(msg.is_empty());

        let mut sink = Vec::new();
        msg.send_to(&mut sink).unwrap();
        assert_eq!(sink.len(), CONTROL_HEADER_BYTES);
    }
}
