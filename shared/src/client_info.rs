//! Per-client subscription set.

use crate::error::CodecError;
use crate::message::MessageKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `<From>To<To>` coordinate frame pair, e.g. `ToolToTracker`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransformName {
    pub from: String,
    pub to: String,
}

impl TransformName {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Splits `name` at the single `To` that is followed by an upper-case
    /// letter. Names with zero or several such separators are rejected.
    pub fn parse(name: &str) -> Result<Self, CodecError> {
        let bytes = name.as_bytes();
        let mut split = None;
        for i in 1..bytes.len().saturating_sub(2) {
            if &bytes[i..i + 2] == b"To" && bytes[i + 2].is_ascii_uppercase() {
                if split.is_some() {
                    return Err(CodecError::InvalidTransformName(name.to_string()));
                }
                split = Some(i);
            }
        }
        match split {
            Some(i) => Ok(Self::new(&name[..i], &name[i + 2..])),
            None => Err(CodecError::InvalidTransformName(name.to_string())),
        }
    }

    pub fn inverse(&self) -> Self {
        Self::new(self.to.clone(), self.from.clone())
    }
}

impl fmt::Display for TransformName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}To{}", self.from, self.to)
    }
}

impl TryFrom<String> for TransformName {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TransformName> for String {
    fn from(name: TransformName) -> Self {
        name.to_string()
    }
}

/// An image stream and the frame its embedded matrix maps into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageStream {
    pub name: String,
    pub embedded_transform_to_frame: String,
}

/// What a client wants streamed to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientInfo {
    /// Explicit message type names; empty means "infer from the name lists".
    pub message_types: Vec<String>,
    pub transform_names: Vec<TransformName>,
    pub image_streams: Vec<ImageStream>,
    pub string_names: Vec<String>,
    /// Minimum spacing between tracking data messages
    pub resolution_ms: u32,
    pub tdata_requested: bool,
}

impl ClientInfo {
    /// Whether frames should be turned into messages of `kind` for this client.
    pub fn wants(&self, kind: MessageKind) -> bool {
        if !self.message_types.is_empty() {
            return self
                .message_types
                .iter()
                .any(|t| t == kind.type_name());
        }
        match kind {
            MessageKind::Transform => !self.transform_names.is_empty(),
            MessageKind::Image => !self.image_streams.is_empty(),
            MessageKind::String => !self.string_names.is_empty(),
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message_types.is_empty()
            && self.transform_names.is_empty()
            && self.image_streams.is_empty()
            && self.string_names.is_empty()
    }
}
