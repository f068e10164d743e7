//! The seams between a publisher's receiver and its subscribers' down tracks
//!
//! A receiver only ever sees its subscribers as [`TrackSender`]s and a down
//! track only sees its publisher as a [`TrackReceiver`], so either side can be
//! replaced by a fake in tests.

use crate::buffer::{ExtPacket, SenderReportData};
use crate::error::Result;
use crate::types::{Bitrates, PeerId, TrackId, TrackKind};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// Subscriber side of a forwarded track.
pub trait TrackSender: Send + Sync {
    fn id(&self) -> &TrackId;
    fn peer_id(&self) -> &PeerId;
    fn codec(&self) -> &RTCRtpCodecCapability;

    /// The publisher's set of flowing spatial layers changed.
    fn uptrack_layers_change(&self, available_layers: &[i32]);

    /// Forward one packet received on spatial `layer`.
    ///
    /// Called from the publisher's forwarding loop; must not block.
    fn write_rtp(&self, ext: &ExtPacket, layer: i32) -> Result<()>;

    fn set_track_type(&self, is_simulcast: bool);

    fn close(&self);
}

/// Publisher side of a forwarded track.
pub trait TrackReceiver: Send + Sync {
    fn track_id(&self) -> &TrackId;
    fn stream_id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn codec(&self) -> &RTCRtpCodecCapability;

    /// Copy the stored packet `sn` of `layer` into `buf`.
    fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize>;

    /// Ask the publisher for a key frame on `layer`; rate limited.
    fn send_pli(&self, layer: i32);

    fn bitrate_temporal_cumulative(&self) -> Bitrates;

    fn sender_report_time(&self, layer: i32) -> Option<SenderReportData>;

    fn delete_down_track(&self, peer_id: &PeerId);
}
