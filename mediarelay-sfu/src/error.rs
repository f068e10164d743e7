use thiserror::Error;

/// Errors produced by the forwarding core.
///
/// Variants fall into three groups: stream-state conditions that only mean
/// "drop this packet", protocol/codec errors that are surfaced to the caller,
/// and resource errors caused by teardown racing with in-flight packets.
#[derive(Error, Debug)]
pub enum Error {
    #[error("out-of-order sequence number not found in cache")]
    OutOfOrderSequenceNumberCacheMiss,

    #[error("padding only packet that can be dropped")]
    PaddingOnlyPacket,

    #[error("duplicate packet")]
    DuplicatePacket,

    #[error("padding packet can only be sent on frame boundary")]
    PaddingNotOnFrameBoundary,

    #[error("out-of-order VP8 picture id not found in cache")]
    OutOfOrderVp8PictureIdCacheMiss,

    #[error("filtered VP8 temporal layer")]
    FilteredVp8TemporalLayer,

    #[error("unknown track kind")]
    UnknownKind,

    #[error("not a VP8 packet")]
    NotVp8,

    #[error("invalid VP8 payload descriptor: {0}")]
    InvalidVp8(&'static str),

    #[error("buffer too short: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("no buffer for layer {0}")]
    BufferNotFound(i32),

    #[error("packet {0} not found in buffer")]
    PacketNotFound(u16),

    #[error("down track is not bound")]
    NotBound,

    #[error("marshal error: {0}")]
    Marshal(#[from] webrtc::util::Error),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("RTCP error: {0}")]
    Rtcp(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether this error only signals an expected transient stream condition.
    ///
    /// Such packets are dropped and counted, never escalated.
    #[must_use]
    pub const fn is_stream_state(&self) -> bool {
        matches!(
            self,
            Self::OutOfOrderSequenceNumberCacheMiss
                | Self::PaddingOnlyPacket
                | Self::DuplicatePacket
                | Self::PaddingNotOnFrameBoundary
                | Self::OutOfOrderVp8PictureIdCacheMiss
                | Self::FilteredVp8TemporalLayer
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_state_classification() {
        assert!(Error::DuplicatePacket.is_stream_state());
        assert!(Error::FilteredVp8TemporalLayer.is_stream_state());
        assert!(!Error::NotVp8.is_stream_state());
        assert!(!Error::BufferNotFound(1).is_stream_state());
    }

    #[test]
    fn test_error_display() {
        let err = Error::ShortBuffer {
            needed: 4,
            available: 2,
        };
        assert_eq!(err.to_string(), "buffer too short: need 4 bytes, have 2");
    }
}
