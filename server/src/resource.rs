//! Named auxiliary data (poly data files) served on request.

use shared::{Message, MessageBody, PolyDataBody, RtsBody, HEADER_VERSION_1};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const FILENAME_KEY: &str = "filename";
pub const REPLY_FILENAME_KEY: &str = "fileName";

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no resource name given")]
    EmptyName,

    #[error("resource name '{0}' leaves the resource directory")]
    OutsideRoot(String),

    #[error("resource '{0}' not found")]
    NotFound(String),

    #[error("failed to read resource '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Resolves a requested name to its bytes.
pub trait ResourceLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Vec<u8>, ResourceError>;
}

/// Reads files below an optional root directory. Absolute paths and `..`
/// components are refused.
#[derive(Debug, Clone, Default)]
pub struct FileResourceLoader {
    root: Option<PathBuf>,
}

impl FileResourceLoader {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, ResourceError> {
        if name.trim().is_empty() {
            return Err(ResourceError::EmptyName);
        }
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ResourceError::OutsideRoot(name.to_string()));
        }
        Ok(match &self.root {
            Some(root) => root.join(relative),
            None => relative.to_path_buf(),
        })
    }
}

impl ResourceLoader for FileResourceLoader {
    fn load(&self, name: &str) -> Result<Vec<u8>, ResourceError> {
        let path = self.resolve(name)?;
        std::fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ResourceError::NotFound(name.to_string()),
            _ => ResourceError::Io {
                name: name.to_string(),
                source,
            },
        })
    }
}

/// The name a poly data request refers to: the `filename` metadata entry for
/// version 2 clients, otherwise the device name.
pub fn requested_name(request: &Message) -> String {
    if request.version > HEADER_VERSION_1 {
        if let Some(name) = request.metadata_value(FILENAME_KEY) {
            return name.to_string();
        }
    }
    request.device_name.clone()
}

/// Loads the requested resource and builds the reply: `POLYDATA` on success,
/// `RTS_POLYDATA` with status 0 otherwise.
pub fn build_resource_reply(
    loader: &dyn ResourceLoader,
    request: &Message,
    version: u16,
) -> (Message, Result<(), ResourceError>) {
    let name = requested_name(request);
    match loader.load(&name) {
        Ok(data) => {
            let reply = Message::new(
                request.device_name.clone(),
                MessageBody::PolyData(PolyDataBody { data }),
            )
            .with_version(version)
            .with_metadata(REPLY_FILENAME_KEY, name);
            (reply, Ok(()))
        }
        Err(e) => {
            let reply = Message::new(
                request.device_name.clone(),
                MessageBody::RtsPolyData(RtsBody { status: 0 }),
            )
            .with_version(version);
            (reply, Err(e))
        }
    }
}
