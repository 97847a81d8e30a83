//! Remote command queuing, execution and reply packaging.
//!
//! Commands arrive either as legacy `STRING` messages on a `CMD_<uid>` device
//! with an XML payload, or as structured `COMMAND` messages carrying their uid
//! and name in the body. Both are turned into a [`CommandRequest`], executed
//! by the [`CommandHandler`] registered under the command name, and answered
//! with a reply in the style they arrived in.

pub mod processor;
pub mod recent;
pub mod registry;
pub mod reply;

pub use processor::{CommandProcessor, CommandQueue};
pub use recent::RecentUids;
pub use registry::CommandRegistry;

use shared::{ImageData, ImageMetaBody, Matrix4};

/// How a command arrived, and so how it must be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStyle {
    /// `STRING` on `CMD_<uid>`, answered with `STRING` on `ACK_<uid>`
    Legacy,
    /// `COMMAND`, answered with `RTS_COMMAND`
    Structured,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub client_id: u32,
    pub uid: u32,
    pub name: String,
    /// Device name of the request message. Legacy requests carry only the
    /// prefix, `CMD` for `CMD_42`, since the uid has its own field.
    pub device_name: String,
    /// Raw XML payload
    pub content: String,
    pub style: CommandStyle,
}

impl CommandRequest {
    /// Value of a top-level attribute of the XML payload.
    pub fn attribute(&self, name: &str) -> Option<String> {
        xml_attribute(&self.content, name)
    }
}

/// Extra message delivered to the requesting client ahead of the reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    Image {
        device_name: String,
        image: ImageData,
        matrix: Matrix4,
    },
    ImageMeta {
        device_name: String,
        body: ImageMetaBody,
    },
    Text {
        device_name: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
    /// Sent back as metadata of structured replies
    pub parameters: Vec<(String, String)>,
    pub attachments: Vec<Attachment>,
}

impl CommandResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            parameters: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            error: Some(message.clone()),
            message,
            parameters: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// A finished command, consumed once by the broadcast loop.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub request: CommandRequest,
    pub result: CommandResult,
}

impl CommandResponse {
    pub fn client_id(&self) -> u32 {
        self.request.client_id
    }
}

/// Executes one named command. Runs on a blocking worker thread.
pub trait CommandHandler: Send + Sync {
    fn execute(&self, request: &CommandRequest) -> CommandResult;
}

impl<F> CommandHandler for F
where
    F: Fn(&CommandRequest) -> CommandResult + Send + Sync,
{
    fn execute(&self, request: &CommandRequest) -> CommandResult {
        self(request)
    }
}

/// Value of an attribute on the root element of `xml`. A declaration,
/// comments or processing instructions ahead of the root are fine; a payload
/// that is not well-formed XML has no attributes.
pub fn xml_attribute(xml: &str, name: &str) -> Option<String> {
    let document = roxmltree::Document::parse(xml).ok()?;
    document.root_element().attribute(name).map(str::to_string)
}

pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
