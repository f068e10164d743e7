//! Send-side serialization of outgoing RTP
//!
//! Down tracks hand finished packets to a [`Pacer`], which owns the actual
//! transport write so the forwarding path never waits on I/O.

mod no_queue;

pub use no_queue::NoQueue;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;
use webrtc::rtp::extension::abs_send_time_extension::AbsSendTimeExtension;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::marshal::Marshal;

/// Sink for a subscriber's RTP stream.
#[async_trait]
pub trait RtpWriter: Send + Sync {
    async fn write_rtp(&self, packet: &Packet) -> Result<usize>;
}

/// Adapts a `webrtc` track writer to [`RtpWriter`].
#[derive(Debug)]
pub struct TrackLocalRtpWriter<W>(pub W);

#[async_trait]
impl<W> RtpWriter for TrackLocalRtpWriter<W>
where
    W: TrackLocalWriter + Send + Sync,
{
    async fn write_rtp(&self, packet: &Packet) -> Result<usize> {
        self.0
            .write_rtp(packet)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Outcome of every packet the pacer sends or fails to send.
pub trait PacketSentObserver: Send + Sync {
    fn on_packet_sent(&self, header: &Header, payload_size: usize, is_padding: bool, result: &Result<usize>);
}

pub struct PacerPacket {
    pub packet: Packet,
    /// Header extension id for abs-send-time, 0 when not negotiated
    pub abs_send_time_ext_id: u8,
    pub is_padding: bool,
    pub writer: Arc<dyn RtpWriter>,
    pub observer: Option<Arc<dyn PacketSentObserver>>,
}

pub trait Pacer: Send + Sync {
    fn enqueue(&self, packet: PacerPacket);
    fn stop(&self);
}

/// Stamp abs-send-time, write, and report.
pub(crate) async fn send_packet(mut p: PacerPacket) {
    if p.abs_send_time_ext_id != 0 {
        let stamped = AbsSendTimeExtension::new(SystemTime::now())
            .marshal()
            .map_err(Error::from)
            .and_then(|payload| {
                p.packet
                    .header
                    .set_extension(p.abs_send_time_ext_id, payload)
                    .map_err(|e| Error::Rtp(e.to_string()))
            });
        if let Err(e) = stamped {
            tracing::debug!(error = %e, "failed to stamp abs-send-time");
        }
    }

    let result = p.writer.write_rtp(&p.packet).await;
    if let Some(observer) = &p.observer {
        observer.on_packet_sent(&p.packet.header, p.packet.payload.len(), p.is_padding, &result);
    }
}
