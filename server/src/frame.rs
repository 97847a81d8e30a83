//! Pull-based frame source contract and an in-memory implementation.

use shared::message::IDENTITY;
use shared::{ImageData, Matrix4, TransformName};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("channel '{0}' has no data")]
    NoData(String),

    #[error("frame source failure: {0}")]
    Failed(String),
}

/// Per-tool tracking status as reported by the acquisition side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolStatus {
    Ok,
    Missing,
    OutOfView,
    OutOfVolume,
}

impl ToolStatus {
    pub fn is_valid(self) -> bool {
        self == ToolStatus::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolStatus::Ok => "OK",
            ToolStatus::Missing => "MISSING",
            ToolStatus::OutOfView => "OUT_OF_VIEW",
            ToolStatus::OutOfVolume => "OUT_OF_VOLUME",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTransform {
    pub matrix: Matrix4,
    pub status: ToolStatus,
}

/// One timestamped acquisition: transforms, an optional image and named
/// string fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedFrame {
    /// Seconds
    pub timestamp: f64,
    pub transforms: BTreeMap<String, FrameTransform>,
    pub image: Option<ImageData>,
    pub fields: BTreeMap<String, String>,
}

impl TrackedFrame {
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            transforms: BTreeMap::new(),
            image: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_transform(mut self, name: &str, matrix: Matrix4, status: ToolStatus) -> Self {
        self.transforms
            .insert(name.to_string(), FrameTransform { matrix, status });
        self
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    /// Looks up `name` directly, or as the inverse of its reverse transform.
    pub fn resolve_transform(&self, name: &TransformName) -> Option<FrameTransform> {
        if let Some(direct) = self.transforms.get(&name.to_string()) {
            return Some(*direct);
        }
        self.transforms
            .get(&name.inverse().to_string())
            .map(|reverse| FrameTransform {
                matrix: invert_rigid(&reverse.matrix),
                status: reverse.status,
            })
    }
}

/// Inverts a rotation plus translation: `[R t]^-1 = [R^T  -R^T t]`.
pub fn invert_rigid(m: &Matrix4) -> Matrix4 {
    let mut inv = IDENTITY;
    for row in 0..3 {
        for col in 0..3 {
            inv[row][col] = m[col][row];
        }
    }
    for row in 0..3 {
        inv[row][3] = -(0..3).map(|k| inv[row][k] * m[k][3]).sum::<f64>();
    }
    inv
}

/// Where the broadcast loop pulls frames from.
pub trait FrameSource: Send + Sync {
    fn channel_id(&self) -> &str;

    fn data_available(&self) -> bool;

    fn oldest_timestamp(&self) -> Option<f64>;

    fn most_recent_timestamp(&self) -> Option<f64>;

    /// Up to `max_frames` frames strictly newer than `watermark`, oldest first.
    fn frames_after(
        &self,
        watermark: f64,
        max_frames: usize,
    ) -> Result<Vec<TrackedFrame>, FrameSourceError>;
}

/// Bounded in-memory frame history; the oldest frame is evicted when full.
#[derive(Debug)]
pub struct FrameBuffer {
    channel_id: String,
    capacity: usize,
    frames: Mutex<VecDeque<TrackedFrame>>,
}

impl FrameBuffer {
    pub fn new(channel_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            channel_id: channel_id.into(),
            capacity: capacity.max(1),
            frames: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a frame. Frames that are not newer than the latest one are
    /// dropped and `false` is returned.
    pub fn push(&self, frame: TrackedFrame) -> bool {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = frames.back() {
            if frame.timestamp <= last.timestamp {
                return false;
            }
        }
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
        true
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSource for FrameBuffer {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn data_available(&self) -> bool {
        !self.is_empty()
    }

    fn oldest_timestamp(&self) -> Option<f64> {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.front().map(|f| f.timestamp)
    }

    fn most_recent_timestamp(&self) -> Option<f64> {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.back().map(|f| f.timestamp)
    }

    fn frames_after(
        &self,
        watermark: f64,
        max_frames: usize,
    ) -> Result<Vec<TrackedFrame>, FrameSourceError> {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if frames.is_empty() {
            return Err(FrameSourceError::NoData(self.channel_id.clone()));
        }
        let start = frames.partition_point(|f| f.timestamp <= watermark);
        Ok(frames.range(start..).take(max_frames).cloned().collect())
    }
}
