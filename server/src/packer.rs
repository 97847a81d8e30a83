//! Turns a frame into the messages one client subscribed to.

use crate::frame::{FrameTransform, TrackedFrame};
use crate::session::SendTarget;
use shared::message::IDENTITY;
use shared::{
    ImageBody, Message, MessageBody, MessageKind, StringBody, TrackingDataBody,
    TrackingDataElement, TransformBody, TransformName, HEADER_VERSION_2,
};

/// TDATA instrument type for a full 6-DOF pose.
pub const TRACKING_ELEMENT_6D: u8 = 2;

pub const TRANSFORM_STATUS_KEY: &str = "TransformStatus";

/// Messages built for one client from one frame.
#[derive(Debug, Default)]
pub struct FramePacket {
    pub messages: Vec<Message>,
    pub includes_tracking_data: bool,
}

impl FramePacket {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Builds every message `target` should receive for `frame`.
///
/// Invalid transforms are left out when `valid_transforms_only` is set.
/// Tracking data is only included once the client's requested resolution has
/// elapsed since the last TDATA it received.
pub fn build_frame_messages(
    frame: &TrackedFrame,
    target: &SendTarget,
    valid_transforms_only: bool,
) -> FramePacket {
    let info = &target.client_info;
    let mut packet = FramePacket::default();
    let stamp = |message: Message| {
        message
            .with_version(target.header_version)
            .with_timestamp(frame.timestamp)
    };

    let resolved: Vec<(&TransformName, FrameTransform)> = info
        .transform_names
        .iter()
        .filter_map(|name| frame.resolve_transform(name).map(|t| (name, t)))
        .filter(|(_, t)| !valid_transforms_only || t.status.is_valid())
        .collect();

    if info.wants(MessageKind::Transform) {
        for (name, transform) in &resolved {
            let mut message = stamp(Message::new(
                name.to_string(),
                MessageBody::Transform(TransformBody::from_matrix(&transform.matrix)),
            ));
            if target.header_version >= HEADER_VERSION_2 {
                message = message.with_metadata(TRANSFORM_STATUS_KEY, transform.status.as_str());
            }
            packet.messages.push(message);
        }
    }

    if info.tdata_requested && tracking_due(frame.timestamp, target) {
        let elements: Vec<TrackingDataElement> = resolved
            .iter()
            .filter(|(_, t)| t.status.is_valid())
            .map(|(name, t)| TrackingDataElement {
                name: name.to_string(),
                instrument_type: TRACKING_ELEMENT_6D,
                matrix: TransformBody::from_matrix(&t.matrix).matrix,
            })
            .collect();
        if !elements.is_empty() {
            packet.messages.push(stamp(Message::new(
                "",
                MessageBody::TrackingData(TrackingDataBody { elements }),
            )));
            packet.includes_tracking_data = true;
        }
    }

    if info.wants(MessageKind::Image) {
        if let Some(image) = &frame.image {
            for stream in &info.image_streams {
                let embedded = TransformName::new(&stream.name, &stream.embedded_transform_to_frame);
                let matrix = frame
                    .resolve_transform(&embedded)
                    .map_or(IDENTITY, |t| t.matrix);
                packet.messages.push(stamp(Message::new(
                    stream.name.clone(),
                    MessageBody::Image(ImageBody {
                        image: image.clone(),
                        matrix: TransformBody::from_matrix(&matrix).matrix,
                    }),
                )));
            }
        }
    }

    if info.wants(MessageKind::String) {
        for name in &info.string_names {
            if let Some(value) = frame.fields.get(name) {
                packet.messages.push(stamp(Message::new(
                    name.clone(),
                    MessageBody::String(StringBody::new(value.clone())),
                )));
            }
        }
    }

    packet
}

fn tracking_due(timestamp: f64, target: &SendTarget) -> bool {
    let resolution_sec = f64::from(target.client_info.resolution_ms) / 1000.0;
    target.last_tracking_timestamp <= 0.0
        || timestamp - target.last_tracking_timestamp >= resolution_sec
}
