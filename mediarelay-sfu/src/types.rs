//! Common types used throughout the forwarding core

use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Highest spatial layer a simulcast publisher can send.
pub const DEFAULT_MAX_SPATIAL_LAYER: i32 = 2;
/// Highest temporal layer within a spatial layer.
pub const DEFAULT_MAX_TEMPORAL_LAYER: i32 = 3;

/// Channel capacity used when the caller has no constraint to apply.
pub const CHANNEL_CAPACITY_INFINITY: i64 = i64::MAX;

/// Per-layer bitrate matrix, indexed `[spatial][temporal]`, in bits per second.
pub type Bitrates = [[i64; 4]; 3];

/// Unique identifier for a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a published track
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TryFrom<RTPCodecType> for TrackKind {
    type Error = crate::Error;

    fn try_from(codec_type: RTPCodecType) -> Result<Self, Self::Error> {
        match codec_type {
            RTPCodecType::Audio => Ok(Self::Audio),
            RTPCodecType::Video => Ok(Self::Video),
            _ => Err(crate::Error::UnknownKind),
        }
    }
}

/// A coordinate into the spatial x temporal bitrate matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoLayers {
    pub spatial: i32,
    pub temporal: i32,
}

/// Sentinel for "not forwarding anything".
pub const INVALID_LAYERS: VideoLayers = VideoLayers {
    spatial: -1,
    temporal: -1,
};

impl VideoLayers {
    #[must_use]
    pub const fn new(spatial: i32, temporal: i32) -> Self {
        Self { spatial, temporal }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.spatial >= 0 && self.temporal >= 0
    }
}

impl Default for VideoLayers {
    fn default() -> Self {
        INVALID_LAYERS
    }
}

impl fmt::Display for VideoLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VideoLayers{{s: {}, t: {}}}", self.spatial, self.temporal)
    }
}

/// Outcome class of the last allocation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoAllocationState {
    #[default]
    None,
    Muted,
    FeedDry,
    AwaitingMeasurement,
    Optimal,
    Deficient,
}

impl fmt::Display for VideoAllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Muted => "MUTED",
            Self::FeedDry => "FEED_DRY",
            Self::AwaitingMeasurement => "AWAITING_MEASUREMENT",
            Self::Optimal => "OPTIMAL",
            Self::Deficient => "DEFICIENT",
        };
        f.write_str(s)
    }
}

/// Result of an allocation call on a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoAllocationResult {
    pub state: VideoAllocationState,
    pub bandwidth_requested: i64,
    pub bandwidth_delta: i64,
    pub layers_changed: bool,
}

/// How much of what the subscriber asked for is being forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingStatus {
    Off,
    Partial,
    Optimal,
}

/// Map a simulcast RTP stream id to its spatial layer.
#[must_use]
pub fn rid_to_layer(rid: &str) -> i32 {
    match rid {
        "f" => 2,
        "h" => 1,
        _ => 0,
    }
}
