//! Message kinds, typed bodies and whole-message pack/unpack.

use crate::client_info::ClientInfo;
use crate::crc::crc64;
use crate::error::CodecError;
use crate::header::MessageHeader;
use crate::{wire_options, HEADER_SIZE, HEADER_VERSION_1, HEADER_VERSION_2};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Row-major homogeneous 4x4 transform.
pub type Matrix4 = [[f64; 4]; 4];

pub const IDENTITY: Matrix4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Message type carried in the header's type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ClientInfo,
    GetStatus,
    Status,
    String,
    Command,
    RtsCommand,
    StartTrackingData,
    StopTrackingData,
    RtsTrackingData,
    TrackingData,
    Transform,
    Image,
    ImageMeta,
    GetPolyData,
    PolyData,
    RtsPolyData,
}

impl MessageKind {
    pub const ALL: [MessageKind; 16] = [
        MessageKind::ClientInfo,
        MessageKind::GetStatus,
        MessageKind::Status,
        MessageKind::String,
        MessageKind::Command,
        MessageKind::RtsCommand,
        MessageKind::StartTrackingData,
        MessageKind::StopTrackingData,
        MessageKind::RtsTrackingData,
        MessageKind::TrackingData,
        MessageKind::Transform,
        MessageKind::Image,
        MessageKind::ImageMeta,
        MessageKind::GetPolyData,
        MessageKind::PolyData,
        MessageKind::RtsPolyData,
    ];

    pub fn type_name(self) -> &'static str {
        match self {
            MessageKind::ClientInfo => "CLIENTINFO",
            MessageKind::GetStatus => "GET_STATUS",
            MessageKind::Status => "STATUS",
            MessageKind::String => "STRING",
            MessageKind::Command => "COMMAND",
            MessageKind::RtsCommand => "RTS_COMMAND",
            MessageKind::StartTrackingData => "STT_TDATA",
            MessageKind::StopTrackingData => "STP_TDATA",
            MessageKind::RtsTrackingData => "RTS_TDATA",
            MessageKind::TrackingData => "TDATA",
            MessageKind::Transform => "TRANSFORM",
            MessageKind::Image => "IMAGE",
            MessageKind::ImageMeta => "IMGMETA",
            MessageKind::GetPolyData => "GET_POLYDATA",
            MessageKind::PolyData => "POLYDATA",
            MessageKind::RtsPolyData => "RTS_POLYDATA",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusBody {
    pub code: u16,
    pub sub_code: i64,
    pub error_name: String,
    pub status_string: String,
}

impl StatusBody {
    pub const OK: u16 = 1;

    pub fn ok() -> Self {
        Self {
            code: Self::OK,
            sub_code: 0,
            error_name: String::new(),
            status_string: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringBody {
    /// IANA MIBenum of the character set, 3 is US-ASCII
    pub encoding: u16,
    pub value: String,
}

impl StringBody {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            encoding: 3,
            value: value.into(),
        }
    }
}

/// Structured command request and its `RTS_COMMAND` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandBody {
    pub command_id: u32,
    pub command_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTrackingBody {
    pub resolution_ms: u32,
    pub coordinate_name: String,
}

/// Generic "ready to send" acknowledgement; zero means failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtsBody {
    pub status: u8,
}

/// Upper 3x4 of a transform, rotation columns then translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformBody {
    pub matrix: [f32; 12],
}

impl TransformBody {
    pub fn from_matrix(m: &Matrix4) -> Self {
        Self {
            matrix: pack_matrix(m),
        }
    }

    pub fn to_matrix(&self) -> Matrix4 {
        unpack_matrix(&self.matrix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingDataElement {
    pub name: String,
    pub instrument_type: u8,
    pub matrix: [f32; 12],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingDataBody {
    pub elements: Vec<TrackingDataElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    pub dimensions: [u32; 3],
    pub scalar_type: u8,
    pub components: u8,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBody {
    pub image: ImageData,
    pub matrix: [f32; 12],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetaItem {
    pub id: String,
    pub name: String,
    pub modality: String,
    pub patient_name: String,
    pub patient_id: String,
    pub timestamp: f64,
    pub size: [u16; 3],
    pub scalar_type: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetaBody {
    pub items: Vec<ImageMetaItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolyDataBody {
    pub data: Vec<u8>,
}

/// Decoded body, one variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    ClientInfo(ClientInfo),
    GetStatus,
    Status(StatusBody),
    String(StringBody),
    Command(CommandBody),
    RtsCommand(CommandBody),
    StartTrackingData(StartTrackingBody),
    StopTrackingData,
    RtsTrackingData(RtsBody),
    TrackingData(TrackingDataBody),
    Transform(TransformBody),
    Image(ImageBody),
    ImageMeta(ImageMetaBody),
    GetPolyData,
    PolyData(PolyDataBody),
    RtsPolyData(RtsBody),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::ClientInfo(_) => MessageKind::ClientInfo,
            MessageBody::GetStatus => MessageKind::GetStatus,
            MessageBody::Status(_) => MessageKind::Status,
            MessageBody::String(_) => MessageKind::String,
            MessageBody::Command(_) => MessageKind::Command,
            MessageBody::RtsCommand(_) => MessageKind::RtsCommand,
            MessageBody::StartTrackingData(_) => MessageKind::StartTrackingData,
            MessageBody::StopTrackingData => MessageKind::StopTrackingData,
            MessageBody::RtsTrackingData(_) => MessageKind::RtsTrackingData,
            MessageBody::TrackingData(_) => MessageKind::TrackingData,
            MessageBody::Transform(_) => MessageKind::Transform,
            MessageBody::Image(_) => MessageKind::Image,
            MessageBody::ImageMeta(_) => MessageKind::ImageMeta,
            MessageBody::GetPolyData => MessageKind::GetPolyData,
            MessageBody::PolyData(_) => MessageKind::PolyData,
            MessageBody::RtsPolyData(_) => MessageKind::RtsPolyData,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let options = wire_options();
        let bytes = match self {
            MessageBody::GetStatus | MessageBody::StopTrackingData | MessageBody::GetPolyData => {
                Vec::new()
            }
            MessageBody::ClientInfo(info) => options.serialize(info)?,
            MessageBody::Status(body) => options.serialize(body)?,
            MessageBody::String(body) => options.serialize(body)?,
            MessageBody::Command(body) | MessageBody::RtsCommand(body) => options.serialize(body)?,
            MessageBody::StartTrackingData(body) => options.serialize(body)?,
            MessageBody::RtsTrackingData(body) | MessageBody::RtsPolyData(body) => {
                options.serialize(body)?
            }
            MessageBody::TrackingData(body) => options.serialize(body)?,
            MessageBody::Transform(body) => options.serialize(body)?,
            MessageBody::Image(body) => options.serialize(body)?,
            MessageBody::ImageMeta(body) => options.serialize(body)?,
            MessageBody::PolyData(body) => options.serialize(body)?,
        };
        Ok(bytes)
    }

    fn decode(kind: MessageKind, cursor: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(match kind {
            MessageKind::ClientInfo => MessageBody::ClientInfo(read(cursor)?),
            MessageKind::GetStatus => MessageBody::GetStatus,
            MessageKind::Status => MessageBody::Status(read(cursor)?),
            MessageKind::String => MessageBody::String(read(cursor)?),
            MessageKind::Command => MessageBody::Command(read(cursor)?),
            MessageKind::RtsCommand => MessageBody::RtsCommand(read(cursor)?),
            MessageKind::StartTrackingData => MessageBody::StartTrackingData(read(cursor)?),
            MessageKind::StopTrackingData => MessageBody::StopTrackingData,
            MessageKind::RtsTrackingData => MessageBody::RtsTrackingData(read(cursor)?),
            MessageKind::TrackingData => MessageBody::TrackingData(read(cursor)?),
            MessageKind::Transform => MessageBody::Transform(read(cursor)?),
            MessageKind::Image => MessageBody::Image(read(cursor)?),
            MessageKind::ImageMeta => MessageBody::ImageMeta(read(cursor)?),
            MessageKind::GetPolyData => MessageBody::GetPolyData,
            MessageKind::PolyData => MessageBody::PolyData(read(cursor)?),
            MessageKind::RtsPolyData => MessageBody::RtsPolyData(read(cursor)?),
        })
    }
}

fn read<T: DeserializeOwned>(cursor: &mut &[u8]) -> Result<T, CodecError> {
    Ok(wire_options().deserialize_from(cursor)?)
}

/// A complete message: routing fields from the header plus its body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub device_name: String,
    pub version: u16,
    /// Seconds
    pub timestamp: f64,
    pub body: MessageBody,
    /// Only carried on the wire by version 2 headers.
    pub metadata: Vec<(String, String)>,
}

impl Message {
    pub fn new(device_name: impl Into<String>, body: MessageBody) -> Self {
        Self {
            device_name: device_name.into(),
            version: HEADER_VERSION_1,
            timestamp: 0.0,
            body,
            metadata: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn with_timestamp(mut self, seconds: f64) -> Self {
        self.timestamp = seconds;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Serializes header and body into one buffer ready for the socket.
    pub fn pack(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = self.body.encode()?;
        if self.version >= HEADER_VERSION_2 {
            body.extend(wire_options().serialize(&self.metadata)?);
        }

        let mut header = MessageHeader::new(
            self.version,
            self.kind().type_name(),
            &self.device_name,
            crate::seconds_to_wire_timestamp(self.timestamp),
        )?;
        header.body_size = body.len() as u64;
        header.crc = crc64(&body);

        let mut out = header.pack()?;
        out.reserve(body.len());
        out.extend(body);
        Ok(out)
    }

    /// Decodes a body previously announced by `header`.
    pub fn unpack_body(
        header: &MessageHeader,
        body: &[u8],
        check_crc: bool,
    ) -> Result<Self, CodecError> {
        if body.len() as u64 != header.body_size {
            return Err(CodecError::BodySize {
                declared: header.body_size,
                actual: body.len(),
            });
        }
        if check_crc {
            let actual = crc64(body);
            if actual != header.crc {
                return Err(CodecError::CrcMismatch {
                    expected: header.crc,
                    actual,
                });
            }
        }
        let kind = header
            .kind()
            .ok_or_else(|| CodecError::UnknownType(header.type_name()))?;

        let mut cursor = body;
        let decoded = MessageBody::decode(kind, &mut cursor)?;
        let metadata = if header.version >= HEADER_VERSION_2 && !cursor.is_empty() {
            read(&mut cursor)?
        } else {
            Vec::new()
        };

        Ok(Self {
            device_name: header.device_name(),
            version: header.version,
            timestamp: header.timestamp_seconds(),
            body: decoded,
            metadata,
        })
    }

    /// Decodes one whole message (header followed by body) from `bytes`.
    pub fn unpack(bytes: &[u8], check_crc: bool) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::HeaderSize {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let header = MessageHeader::unpack(&bytes[..HEADER_SIZE])?;
        Self::unpack_body(&header, &bytes[HEADER_SIZE..], check_crc)
    }
}

fn pack_matrix(m: &Matrix4) -> [f32; 12] {
    let mut out = [0f32; 12];
    for col in 0..4 {
        for row in 0..3 {
            out[col * 3 + row] = m[row][col] as f32;
        }
    }
    out
}

fn unpack_matrix(packed: &[f32; 12]) -> Matrix4 {
    let mut m = IDENTITY;
    for col in 0..4 {
        for row in 0..3 {
            m[row][col] = packed[col * 3 + row] as f64;
        }
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransformName, HEADER_SIZE};
    use assert_approx_eq::assert_approx_eq;

    fn translation(x: f64, y: f64, z: f64) -> Matrix4 {
        let mut m = IDENTITY;
        m[0][3] = x;
        m[1][3] = y;
        m[2][3] = z;
        m
    }

    #[test]
    fn test_type_names_are_unique_and_fit_header() {
        for kind in MessageKind::ALL {
            assert!(kind.type_name().len() <= crate::TYPE_NAME_SIZE);
            assert_eq!(MessageKind::from_type_name(kind.type_name()), Some(kind));
        }
        assert_eq!(MessageKind::from_type_name("POSITION"), None);
    }

    #[test]
    fn test_transform_matrix_layout() {
        let body = TransformBody::from_matrix(&translation(10.0, 20.0, 30.0));

        assert_eq!(&body.matrix[9..12], &[10.0, 20.0, 30.0]);
        assert_eq!(body.matrix[0], 1.0);
        assert_eq!(body.matrix[4], 1.0);
        assert_eq!(body.matrix[8], 1.0);

        let back = body.to_matrix();
        assert_approx_eq!(back[1][3], 20.0, 1e-6);
        assert_approx_eq!(back[3][3], 1.0, 1e-9);
    }

    #[test]
    fn test_pack_sets_body_size_and_crc() {
        let message = Message::new("Tool", MessageBody::String(StringBody::new("hello")));
        let bytes = message.pack().unwrap();
        let header = MessageHeader::unpack(&bytes[..HEADER_SIZE]).unwrap();

        assert_eq!(header.body_size as usize, bytes.len() - HEADER_SIZE);
        assert_eq!(header.crc, crc64(&bytes[HEADER_SIZE..]));
        assert_eq!(header.kind(), Some(MessageKind::String));
    }

    #[test]
    fn test_empty_bodies_pack_to_header_only() {
        let bytes = Message::new("", MessageBody::GetStatus).pack().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let decoded = Message::unpack(&bytes, true).unwrap();
        assert_eq!(decoded.body, MessageBody::GetStatus);
    }

    #[test]
    fn test_metadata_only_travels_with_version_2() {
        let v1 = Message::new("Model", MessageBody::GetPolyData).with_metadata("filename", "a.vtk");
        let v2 = v1.clone().with_version(HEADER_VERSION_2);

        let decoded_v1 = Message::unpack(&v1.pack().unwrap(), true).unwrap();
        let decoded_v2 = Message::unpack(&v2.pack().unwrap(), true).unwrap();

        assert!(decoded_v1.metadata.is_empty());
        assert_eq!(decoded_v2.metadata_value("filename"), Some("a.vtk"));
    }

    #[test]
    fn test_crc_mismatch_is_detected_only_when_enabled() {
        let message = Message::new("CMD_7", MessageBody::String(StringBody::new("<Command/>")));
        let mut bytes = message.pack().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x20;

        assert!(matches!(
            Message::unpack(&bytes, true),
            Err(CodecError::CrcMismatch { .. })
        ));
        assert!(Message::unpack(&bytes, false).is_ok());
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let message = Message::new(
            "Reconstruct",
            MessageBody::Command(CommandBody {
                command_id: 42,
                command_name: "Reconstruct".to_string(),
                content: "<Command/>".to_string(),
            }),
        );
        let bytes = message.pack().unwrap();
        let result = Message::unpack(&bytes[..bytes.len() - 3], false);
        assert!(matches!(result, Err(CodecError::BodySize { .. })));
    }

    #[test]
    fn test_client_info_body_decodes() {
        let mut info = ClientInfo::default();
        info.transform_names
            .push(TransformName::parse("ToolToTracker").unwrap());
        info.resolution_ms = 50;

        let bytes = Message::new("Client", MessageBody::ClientInfo(info.clone()))
            .pack()
            .unwrap();
        match Message::unpack(&bytes, true).unwrap().body {
            MessageBody::ClientInfo(decoded) => assert_eq!(decoded, info),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_cannot_be_decoded() {
        let mut header = MessageHeader::new(1, "SENSOR", "Foot", 0).unwrap();
        header.body_size = 4;
        let result = Message::unpack_body(&header, &[1, 2, 3, 4], false);
        assert!(matches!(result, Err(CodecError::UnknownType(name)) if name == "SENSOR"));
    }
}
