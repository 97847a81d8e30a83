//! Fixed-size message header.

use crate::error::CodecError;
use crate::message::MessageKind;
use crate::{wire_options, DEVICE_NAME_SIZE, HEADER_SIZE, TYPE_NAME_SIZE};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// The 58-byte header that precedes every message body.
///
/// Names are NUL padded to their field width. `body_size` counts every byte
/// after the header, including the metadata section of version 2 bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub version: u16,
    type_name: [u8; TYPE_NAME_SIZE],
    device_name: [u8; DEVICE_NAME_SIZE],
    /// 32.32 fixed-point seconds
    pub timestamp: u64,
    pub body_size: u64,
    pub crc: u64,
}

impl MessageHeader {
    pub fn new(
        version: u16,
        type_name: &str,
        device_name: &str,
        timestamp: u64,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            version,
            type_name: encode_name("type name", type_name)?,
            device_name: encode_name("device name", device_name)?,
            timestamp,
            body_size: 0,
            crc: 0,
        })
    }

    pub fn type_name(&self) -> String {
        decode_name(&self.type_name)
    }

    pub fn device_name(&self) -> String {
        decode_name(&self.device_name)
    }

    /// Decodes the type field; `None` for types this codec does not know.
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_type_name(&self.type_name())
    }

    pub fn timestamp_seconds(&self) -> f64 {
        crate::wire_timestamp_to_seconds(self.timestamp)
    }

    pub fn pack(&self) -> Result<Vec<u8>, CodecError> {
        Ok(wire_options().serialize(self)?)
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != HEADER_SIZE {
            return Err(CodecError::HeaderSize {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(wire_options().deserialize(bytes)?)
    }
}

fn encode_name<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N], CodecError> {
    let bytes = value.as_bytes();
    if bytes.len() > N {
        return Err(CodecError::NameTooLong {
            field,
            value: value.to_string(),
            max: N,
        });
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn decode_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
