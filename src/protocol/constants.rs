//! Constants for the module control protocol

/// Protocol version written into every outgoing header
pub const CONTROL_PROTOCOL_VERSION: u8 = 1;

/// Maximum size of a complete message (header + payload)
pub const CONTROL_BUFFER_BYTES: usize = 512;

/// Maximum attribute data length (length field is a single byte)
pub const CONTROL_MAX_ATTRIBUTE_DATA_LENGTH: usize = 255;

// Header layout: timestamp_us(8) | version(1) | command(1) | payload_length(2)
pub const CONTROL_HEADER_BYTES: usize = 12;
pub const HEADER_TIMESTAMP_OFFSET: usize = 0;
pub const HEADER_VERSION_OFFSET: usize = 8;
pub const HEADER_COMMAND_OFFSET: usize = 9;
pub const HEADER_PAYLOAD_LENGTH_OFFSET: usize = 10;

// Attribute layout: tag(1) | length(1) | data(length)
pub const ATTRIBUTE_HEADER_BYTES: usize = 2;
pub const ATTRIBUTE_TAG_OFFSET: usize = 0;
pub const ATTRIBUTE_LENGTH_OFFSET: usize = 1;
pub const ATTRIBUTE_DATA_OFFSET: usize = 2;

/// Largest payload that fits the message buffer
pub const CONTROL_MAX_PAYLOAD_BYTES: usize = CONTROL_BUFFER_BYTES - CONTROL_HEADER_BYTES;
