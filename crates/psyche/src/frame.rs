//! Frames pushed to canvases and the canvas identifier.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Stable identifier of a display surface.
///
/// Slugs are not checked against a fixed set: any slug may be connected to
/// or streamed to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanvasSlug(String);

impl CanvasSlug {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanvasSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanvasSlug {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CanvasSlug {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One encoded image on its way to a canvas.
///
/// Frames are constructed per delivery and not retained after broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    pub image: Bytes,
    pub image_id: String,
}

impl Frame {
    /// Stamps `image` with the current time and a fresh random id.
    pub fn new(image: impl Into<Bytes>) -> Self {
        Self {
            timestamp: Utc::now(),
            image: image.into(),
            image_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Renders the JSON message sent to canvas viewers.
    pub fn to_message(&self) -> FrameMessage {
        FrameMessage {
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            image: STANDARD.encode(&self.image),
            image_id: self.image_id.clone(),
        }
    }

    /// Serializes [`Frame::to_message`] to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_message())
    }
}

/// Wire shape of a frame: `{"timestamp", "image", "image_id"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMessage {
    /// ISO-8601 timestamp.
    pub timestamp: String,
    /// Standard base64 of the encoded image.
    pub image: String,
    pub image_id: String,
}
