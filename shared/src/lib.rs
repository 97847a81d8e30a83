//! Wire codec shared by the streaming server and its clients.
//!
//! Every message is a fixed-size [`MessageHeader`] followed by a body whose
//! length is declared in the header. The header names the message type, so a
//! reader can always skip a body it does not understand.

pub mod client_info;
pub mod command_name;
pub mod crc;
pub mod error;
pub mod header;
pub mod message;

pub use client_info::{ClientInfo, ImageStream, TransformName};
pub use error::CodecError;
pub use header::MessageHeader;
pub use message::{
    CommandBody, ImageBody, ImageData, ImageMetaBody, ImageMetaItem, Matrix4, Message,
    MessageBody, MessageKind, PolyDataBody, RtsBody, StartTrackingBody, StatusBody, StringBody,
    TrackingDataBody, TrackingDataElement, TransformBody,
};

/// Size in bytes of a packed [`MessageHeader`].
pub const HEADER_SIZE: usize = 58;

/// Header version without the metadata section.
pub const HEADER_VERSION_1: u16 = 1;
/// Header version whose bodies carry a key/value metadata section.
pub const HEADER_VERSION_2: u16 = 2;
/// Highest header version this codec speaks.
pub const MAX_HEADER_VERSION: u16 = HEADER_VERSION_2;

pub const TYPE_NAME_SIZE: usize = 12;
pub const DEVICE_NAME_SIZE: usize = 20;

/// Bodies larger than this are never buffered in memory.
pub const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

pub(crate) fn wire_options() -> impl bincode::Options {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Converts seconds to the 32.32 fixed-point timestamp used on the wire.
pub fn seconds_to_wire_timestamp(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    let whole = seconds.trunc();
    let frac = seconds - whole;
    ((whole as u64) << 32) | ((frac * 4_294_967_296.0) as u64 & 0xFFFF_FFFF)
}

/// Converts a 32.32 fixed-point wire timestamp back to seconds.
pub fn wire_timestamp_to_seconds(stamp: u64) -> f64 {
    (stamp >> 32) as f64 + (stamp & 0xFFFF_FFFF) as f64 / 4_294_967_296.0
}
