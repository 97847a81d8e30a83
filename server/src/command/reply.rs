//! Packaging of command results into protocol messages.

use super::{xml_escape, Attachment, CommandResponse, CommandStyle};
use shared::command_name::{reply_device_name, DEVICE_NAME_REPLY};
use shared::{
    CommandBody, ImageBody, Message, MessageBody, StringBody, TransformBody,
};

pub const MALFORMED_DEVICE_NAME: &str = "Malformed DeviceName. Expected CMD_cmdId (ex: CMD_001)";

/// Attachments first, then the reply itself, all at the client's `version`.
pub fn build_reply_messages(response: &CommandResponse, version: u16) -> Vec<Message> {
    let mut messages: Vec<Message> = response
        .result
        .attachments
        .iter()
        .map(attachment_message)
        .collect();

    messages.push(match response.request.style {
        CommandStyle::Legacy => legacy_reply(response),
        CommandStyle::Structured => structured_reply(response),
    });

    messages
        .into_iter()
        .map(|m| m.with_version(version))
        .collect()
}

/// Immediate answer to a `CMD_` message whose uid could not be parsed.
pub fn malformed_device_name_reply(version: u16) -> Message {
    Message::new(
        DEVICE_NAME_REPLY,
        MessageBody::String(StringBody::new(MALFORMED_DEVICE_NAME)),
    )
    .with_version(version)
}

fn legacy_reply(response: &CommandResponse) -> Message {
    let status = if response.result.success {
        "SUCCESS"
    } else {
        "FAIL"
    };
    let xml = format!(
        r#"<CommandReply Status="{}" Message="{}" />"#,
        status,
        xml_escape(&response.result.message)
    );
    Message::new(
        reply_device_name(response.request.uid),
        MessageBody::String(StringBody::new(xml)),
    )
}

fn structured_reply(response: &CommandResponse) -> Message {
    let result = &response.result;
    let mut xml = format!("<Command><Result>{}</Result>", result.success);
    if let Some(error) = &result.error {
        xml.push_str(&format!("<Error>{}</Error>", xml_escape(error)));
    }
    xml.push_str(&format!(
        "<Message>{}</Message></Command>",
        xml_escape(&result.message)
    ));

    let mut message = Message::new(
        response.request.device_name.clone(),
        MessageBody::RtsCommand(CommandBody {
            command_id: response.request.uid,
            command_name: response.request.name.clone(),
            content: xml,
        }),
    );
    for (key, value) in &result.parameters {
        message = message.with_metadata(key.clone(), value.clone());
    }
    message
}

fn attachment_message(attachment: &Attachment) -> Message {
    match attachment {
        Attachment::Image {
            device_name,
            image,
            matrix,
        } => Message::new(
            device_name.clone(),
            MessageBody::Image(ImageBody {
                image: image.clone(),
                matrix: TransformBody::from_matrix(matrix).matrix,
            }),
        ),
        Attachment::ImageMeta { device_name, body } => {
            Message::new(device_name.clone(), MessageBody::ImageMeta(body.clone()))
        }
        Attachment::Text { device_name, value } => Message::new(
            device_name.clone(),
            MessageBody::String(StringBody::new(value.clone())),
        ),
    }
}
