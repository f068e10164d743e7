//! One subscriber's view of a published track
//!
//! A `DownTrack` owns the [`Forwarder`] for its (publisher, subscriber) pair,
//! rewrites every forwarded packet into the subscriber's numbering space and
//! hands it to the shared [`Pacer`]. It also serves the subscriber's RTCP:
//! key frame requests go upstream, NACKs are answered from the publisher's
//! packet buffers through the [`Sequencer`].
//!
//! Nothing is sent until the transport binds the track. Media written before
//! that is silently discarded.

use crate::buffer::{ExtPacket, Vp8};
use crate::config::DownTrackConfig;
use crate::error::{Error, Result};
use crate::forwarder::{Forwarder, VideoStreamingChange};
use crate::pacer::{Pacer, PacerPacket, PacketSentObserver, RtpWriter};
use crate::sequencer::{PacketMeta, Sequencer};
use crate::track::{TrackReceiver, TrackSender};
use crate::types::{
    ForwardingStatus, PeerId, TrackId, TrackKind, VideoAllocationResult, VideoAllocationState,
    VideoLayers,
};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Once};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn, Instrument, Span};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8};
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::source_description::{SdesType, SourceDescriptionChunk, SourceDescriptionItem};
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};
use webrtc::util::marshal::{MarshalSize, Unmarshal};

pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";

const RTP_PADDING_ESTIMATED_HEADER_SIZE: usize = 20;
const RTX_BUFFER_SIZE: usize = 1500;
/// Seconds between the NTP epoch (1900) and the unix epoch.
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// 1x1 VP8 key frame, shown by the decoder as a blank picture.
const VP8_KEY_FRAME_1X1: &[u8] = &[
    0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x01, 0x00, 0x01, 0x00, 0x0b, 0xc7, 0x08, 0x85, 0x85,
    0x88, 0x85, 0x84, 0x88, 0x3f, 0x82, 0x00, 0x0c, 0x0d, 0x60, 0x00, 0xfe, 0xe6, 0xb5, 0x00,
];

/// SPS, PPS and IDR of a 2x2 H.264 key frame.
const H264_KEY_FRAME_2X2: [&[u8]; 3] = [
    &[
        0x67, 0x42, 0xc0, 0x1f, 0x0f, 0xd9, 0x1f, 0x88, 0x88, 0x84, 0x00, 0x00, 0x03, 0x00, 0x04,
        0x00, 0x00, 0x03, 0x00, 0xc8, 0x3c, 0x60, 0xc9, 0x20,
    ],
    &[0x68, 0x87, 0xcb, 0x83, 0xcb, 0x20],
    &[0x65, 0x88, 0x84, 0x0a, 0xf2, 0x62, 0x80, 0x00, 0xa7, 0xbe],
];

const NALU_STAP_A: u8 = 0x18;

/// Subscriber-side events. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait DownTrackListener: Send + Sync {
    fn on_bind(&self) {}
    fn on_close(&self) {}
    /// Every RTCP batch from the subscriber, before it is handled.
    fn on_rtcp(&self, packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>]) {}
    fn on_remb(&self, remb: &ReceiverEstimatedMaximumBitrate) {}
    /// Receiver report reduced to the blocks about this track.
    fn on_receiver_report(&self, report: &ReceiverReport) {}
    fn on_available_layers_changed(&self) {}
    fn on_subscribed_layers_changed(&self, layers: VideoLayers) {}
    fn on_subscription_changed(&self) {}
    fn on_packet_sent(&self, is_padding: bool, size: usize) {}
}

#[derive(Debug, Default)]
pub struct NoopDownTrackListener;

impl DownTrackListener for NoopDownTrackListener {}

/// A negotiated RTP header extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeaderExtension {
    pub uri: String,
    pub id: u8,
}

/// What the transport negotiated for this track.
pub struct BindContext {
    pub ssrc: u32,
    pub codec_parameters: Vec<RTCRtpCodecParameters>,
    pub header_extensions: Vec<RtpHeaderExtension>,
    pub mid: Option<String>,
    pub writer: Arc<dyn RtpWriter>,
}

struct Binding {
    ssrc: u32,
    payload_type: u8,
    mime_type: String,
    mid: Option<String>,
    abs_send_time_ext_id: u8,
    writer: Arc<dyn RtpWriter>,
}

#[derive(Default)]
struct SendStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    padding_packets: AtomicU64,
    padding_bytes: AtomicU64,
    loss_fraction: AtomicU8,
}

/// Snapshot of what a down track has sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownTrackStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
    pub padding_packets: u64,
    pub padding_bytes: u64,
    /// Last loss fraction reported by the subscriber, in 1/256 units
    pub loss_fraction: u8,
}

/// Accounts for packets once the pacer has written them.
struct SendObserver {
    stats: Arc<SendStats>,
    listener: Arc<dyn DownTrackListener>,
    span: Span,
}

impl PacketSentObserver for SendObserver {
    fn on_packet_sent(&self, header: &Header, payload_size: usize, is_padding: bool, result: &Result<usize>) {
        match result {
            Ok(_) => {
                let size = header.marshal_size() + payload_size;
                self.stats.packets.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes.fetch_add(size as u64, Ordering::Relaxed);
                if is_padding {
                    self.stats.padding_packets.fetch_add(1, Ordering::Relaxed);
                    self.stats.padding_bytes.fetch_add(size as u64, Ordering::Relaxed);
                }
                self.listener.on_packet_sent(is_padding, size);
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.span.in_scope(|| {
                    debug!(error = %e, sn = header.sequence_number, "failed to write packet");
                });
            }
        }
    }
}

pub struct DownTrack {
    id: TrackId,
    peer_id: PeerId,
    stream_id: String,
    kind: TrackKind,
    codec: RTCRtpCodecCapability,
    max_padding_size: usize,

    receiver: Arc<dyn TrackReceiver>,
    forwarder: Forwarder,
    sequencer: Option<Sequencer>,
    pacer: Arc<dyn Pacer>,
    listener: Arc<dyn DownTrackListener>,

    bound: AtomicBool,
    binding: RwLock<Option<Arc<Binding>>>,
    is_simulcast: AtomicBool,
    /// Set by the first forwarded media packet; generated packets wait for it
    written: AtomicBool,
    close_once: Once,

    last_pli_ms: AtomicU64,
    last_rtp_ms: AtomicU64,
    stats: Arc<SendStats>,
    sent_observer: Arc<dyn PacketSentObserver>,

    span: Span,
}

impl DownTrack {
    /// The track kind comes from the codec mime type.
    pub fn new(
        codec: RTCRtpCodecCapability,
        receiver: Arc<dyn TrackReceiver>,
        peer_id: PeerId,
        pacer: Arc<dyn Pacer>,
        listener: Arc<dyn DownTrackListener>,
        config: &DownTrackConfig,
        span: Span,
    ) -> Result<Arc<Self>> {
        let kind = kind_from_mime(&codec.mime_type)?;
        let stats = Arc::new(SendStats::default());
        let sent_observer = Arc::new(SendObserver {
            stats: Arc::clone(&stats),
            listener: Arc::clone(&listener),
            span: span.clone(),
        });

        Ok(Arc::new(Self {
            id: receiver.track_id().clone(),
            stream_id: receiver.stream_id().to_string(),
            peer_id,
            kind,
            forwarder: Forwarder::new(codec.clone(), kind, span.clone()),
            codec,
            max_padding_size: config.max_padding_size,
            sequencer: (kind == TrackKind::Video).then(|| Sequencer::new(config.sequencer_size)),
            receiver,
            pacer,
            listener,
            bound: AtomicBool::new(false),
            binding: RwLock::new(None),
            is_simulcast: AtomicBool::new(false),
            written: AtomicBool::new(false),
            close_once: Once::new(),
            last_pli_ms: AtomicU64::new(0),
            last_rtp_ms: AtomicU64::new(0),
            stats,
            sent_observer,
            span,
        }))
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn codec(&self) -> &RTCRtpCodecCapability {
        &self.codec
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ssrc(&self) -> Option<u32> {
        self.binding().map(|b| b.ssrc)
    }

    #[must_use]
    pub fn payload_type(&self) -> Option<u8> {
        self.binding().map(|b| b.payload_type)
    }

    #[must_use]
    pub fn mid(&self) -> Option<String> {
        self.binding().and_then(|b| b.mid.clone())
    }

    #[must_use]
    pub fn is_simulcast(&self) -> bool {
        self.is_simulcast.load(Ordering::Relaxed)
    }

    fn binding(&self) -> Option<Arc<Binding>> {
        self.binding.read().clone()
    }

    /// Called by the transport once negotiation settled on a codec.
    pub fn bind(&self, ctx: BindContext) -> Result<RTCRtpCodecParameters> {
        let codec = codec_parameters_fuzzy_search(&self.codec, &ctx.codec_parameters)
            .ok_or_else(|| Error::UnsupportedCodec(self.codec.mime_type.clone()))?;

        let abs_send_time_ext_id = ctx
            .header_extensions
            .iter()
            .find(|ext| ext.uri == ABS_SEND_TIME_URI)
            .map_or(0, |ext| ext.id);

        *self.binding.write() = Some(Arc::new(Binding {
            ssrc: ctx.ssrc,
            payload_type: codec.payload_type,
            mime_type: codec.capability.mime_type.to_lowercase(),
            mid: ctx.mid,
            abs_send_time_ext_id,
            writer: ctx.writer,
        }));
        self.bound.store(true, Ordering::Release);

        self.span.in_scope(|| {
            info!(
                ssrc = ctx.ssrc,
                payload_type = codec.payload_type,
                mime = %codec.capability.mime_type,
                "down track bound"
            );
        });
        self.listener.on_bind();
        Ok(codec)
    }

    /// Stop sending and detach from the publisher.
    pub fn unbind(&self) {
        self.bound.store(false, Ordering::Release);
        self.receiver.delete_down_track(&self.peer_id);
    }

    fn send(&self, binding: &Binding, packet: Packet, is_padding: bool) {
        self.pacer.enqueue(PacerPacket {
            packet,
            abs_send_time_ext_id: binding.abs_send_time_ext_id,
            is_padding,
            writer: Arc::clone(&binding.writer),
            observer: Some(Arc::clone(&self.sent_observer)),
        });
    }

    fn count_drop(&self) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Translate and queue one packet received on spatial `layer`.
    pub fn write_rtp(&self, ext: &ExtPacket, layer: i32) -> Result<()> {
        self.last_rtp_ms.store(unix_millis(), Ordering::Relaxed);
        if !self.is_bound() {
            return Ok(());
        }
        let Some(binding) = self.binding() else {
            return Ok(());
        };

        let tp = match self.forwarder.get_translation_params(ext, layer) {
            Ok(tp) => tp,
            Err(e) => {
                self.count_drop();
                return Err(e);
            }
        };

        if tp.should_send_pli {
            self.last_pli_ms.store(unix_millis(), Ordering::Relaxed);
            self.receiver.send_pli(layer);
        }
        let Some(tp_rtp) = tp.rtp.filter(|_| !tp.should_drop) else {
            self.count_drop();
            return Ok(());
        };

        let vp8 = tp.vp8.map(|tp_vp8| tp_vp8.header);
        let payload = match (&vp8, &ext.vp8) {
            (Some(outgoing), Some(incoming)) => {
                match translate_vp8_payload(&ext.packet.payload, incoming, outgoing) {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.count_drop();
                        return Err(e);
                    }
                }
            }
            _ => ext.packet.payload.clone(),
        };

        if let Some(sequencer) = &self.sequencer {
            sequencer.push(
                ext.packet.header.sequence_number,
                tp_rtp.sequence_number,
                tp_rtp.timestamp,
                u8::try_from(layer).unwrap_or_default(),
                vp8,
            );
        }

        let mut header = ext.packet.header.clone();
        header.payload_type = binding.payload_type;
        header.sequence_number = tp_rtp.sequence_number;
        header.timestamp = tp_rtp.timestamp;
        header.ssrc = binding.ssrc;
        strip_extensions(&mut header);

        self.written.store(true, Ordering::Release);
        self.send(&binding, Packet { header, payload }, false);
        Ok(())
    }

    /// Queue padding-only packets for a budget of `bytes_to_send` bytes and
    /// return the bytes actually queued.
    ///
    /// The budget buys one packet per `max_padding_size` plus header. Each
    /// packet has an empty payload and the 4-byte pad the RTP marshaller
    /// appends, so the returned size is usually well below the budget.
    ///
    /// Audio, muted tracks and tracks that have not forwarded media yet
    /// never pad.
    pub fn write_padding_rtp(&self, bytes_to_send: usize) -> usize {
        if self.kind == TrackKind::Audio || self.forwarder.muted() {
            return 0;
        }
        if !self.is_bound() || !self.written.load(Ordering::Acquire) {
            return 0;
        }
        let Some(binding) = self.binding() else {
            return 0;
        };

        let num = bytes_to_send.div_ceil(self.max_padding_size + RTP_PADDING_ESTIMATED_HEADER_SIZE);
        if num == 0 {
            return 0;
        }
        let snts = match self.forwarder.get_sn_ts_for_padding(num) {
            Ok(snts) => snts,
            Err(e) => {
                self.span
                    .in_scope(|| debug!(error = %e, "padding not possible"));
                return 0;
            }
        };

        let mut bytes_sent = 0;
        for snts in snts {
            let packet = Packet {
                header: Header {
                    version: 2,
                    padding: true,
                    marker: false,
                    payload_type: binding.payload_type,
                    sequence_number: snts.sequence_number,
                    timestamp: snts.timestamp,
                    ssrc: binding.ssrc,
                    ..Default::default()
                },
                // the marshaller writes the pad itself
                payload: Bytes::new(),
            };
            bytes_sent += packet.marshal_size();
            self.send(&binding, packet, true);
        }
        bytes_sent
    }

    /// Queue blank key frames so the subscriber's decoder does not freeze on
    /// the last picture. Returns the number of frames queued.
    pub fn write_blank_frames(&self) -> Result<usize> {
        if self.kind == TrackKind::Audio
            || !self.is_bound()
            || !self.written.load(Ordering::Acquire)
        {
            return Ok(0);
        }
        let Some(binding) = self.binding() else {
            return Ok(0);
        };

        let is_vp8 = binding.mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8);
        if !is_vp8 && !binding.mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
            return Ok(0);
        }

        let (snts, mut frame_end_needed) = self.forwarder.get_sn_ts_for_blank_frames()?;
        for snts in &snts {
            let payload = if is_vp8 {
                self.vp8_blank_frame(frame_end_needed)?
            } else {
                h264_blank_frame()
            };
            let packet = Packet {
                header: Header {
                    version: 2,
                    marker: true,
                    payload_type: binding.payload_type,
                    sequence_number: snts.sequence_number,
                    timestamp: snts.timestamp,
                    ssrc: binding.ssrc,
                    ..Default::default()
                },
                payload,
            };
            self.send(&binding, packet, false);
            frame_end_needed = false;
        }
        Ok(snts.len())
    }

    fn vp8_blank_frame(&self, frame_end_needed: bool) -> Result<Bytes> {
        let vp8 = self
            .forwarder
            .get_padding_vp8(frame_end_needed)
            .ok_or(Error::NotVp8)?;
        let mut buf = BytesMut::zeroed(vp8.header_size + VP8_KEY_FRAME_1X1.len());
        vp8.marshal_to(&mut buf[..vp8.header_size])?;
        buf[vp8.header_size..].copy_from_slice(VP8_KEY_FRAME_1X1);
        Ok(buf.freeze())
    }

    /// Mute, flush the subscriber's decoder and notify the listener.
    ///
    /// Runs once no matter how many callers race here; the others wait for
    /// the first to finish.
    pub fn close(&self) {
        self.close_once.call_once(|| {
            self.forwarder.mute(true);
            match self.write_blank_frames() {
                Ok(frames) => self
                    .span
                    .in_scope(|| debug!(frames, "wrote blank frames on close")),
                Err(e) => self
                    .span
                    .in_scope(|| debug!(error = %e, "failed to write blank frames")),
            }
            self.span.in_scope(|| info!(peer_id = %self.peer_id, "down track closed"));
            self.listener.on_close();
        });
    }

    pub fn mute(&self, muted: bool) {
        if !self.forwarder.mute(muted) {
            return;
        }
        if muted {
            // stale loss would skew quality while nothing flows
            self.stats.loss_fraction.store(0, Ordering::Relaxed);
        }
        self.listener.on_subscription_changed();
    }

    #[must_use]
    pub fn muted(&self) -> bool {
        self.forwarder.muted()
    }

    pub fn set_max_spatial_layer(&self, spatial: i32) {
        let (changed, layers) = self.forwarder.set_max_spatial_layer(spatial);
        if changed {
            self.listener.on_subscribed_layers_changed(layers);
        }
    }

    pub fn set_max_temporal_layer(&self, temporal: i32) {
        let (changed, layers) = self.forwarder.set_max_temporal_layer(temporal);
        if changed {
            self.listener.on_subscribed_layers_changed(layers);
        }
    }

    #[must_use]
    pub fn max_layers(&self) -> VideoLayers {
        self.forwarder.max_layers()
    }

    #[must_use]
    pub fn current_layers(&self) -> VideoLayers {
        self.forwarder.current_layers()
    }

    #[must_use]
    pub fn target_layers(&self) -> VideoLayers {
        self.forwarder.target_layers()
    }

    #[must_use]
    pub fn forwarding_status(&self) -> ForwardingStatus {
        self.forwarder.forwarding_status()
    }

    pub fn uptrack_layers_change(&self, available_layers: &[i32]) {
        self.forwarder.uptrack_layers_change(available_layers);
        self.listener.on_available_layers_changed();
    }

    #[must_use]
    pub fn allocation_state(&self) -> VideoAllocationState {
        self.forwarder.allocation_state()
    }

    #[must_use]
    pub fn is_deficient(&self) -> bool {
        self.forwarder.is_deficient()
    }

    #[must_use]
    pub fn last_streaming_change(&self) -> VideoStreamingChange {
        self.forwarder.last_streaming_change()
    }

    #[must_use]
    pub fn bandwidth_requested(&self) -> i64 {
        self.forwarder.allocation_bandwidth()
    }

    #[must_use]
    pub fn bandwidth_needed(&self) -> i64 {
        self.forwarder
            .bandwidth_needed(&self.receiver.bitrate_temporal_cumulative())
    }

    pub fn allocate(&self, available_channel_capacity: i64) -> VideoAllocationResult {
        self.forwarder.allocate(
            available_channel_capacity,
            &self.receiver.bitrate_temporal_cumulative(),
        )
    }

    pub fn try_allocate(&self, additional_channel_capacity: i64) -> VideoAllocationResult {
        self.forwarder.try_allocate(
            additional_channel_capacity,
            &self.receiver.bitrate_temporal_cumulative(),
        )
    }

    pub fn finalize_allocate(&self) {
        self.forwarder
            .finalize_allocate(&self.receiver.bitrate_temporal_cumulative());
    }

    pub fn allocate_next_higher(&self) -> VideoAllocationResult {
        self.forwarder
            .allocate_next_higher(&self.receiver.bitrate_temporal_cumulative())
    }

    /// Handle one compound RTCP packet from the subscriber.
    pub fn handle_rtcp(self: &Arc<Self>, raw: &[u8]) {
        let mut buf = raw;
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => packets,
            Err(e) => {
                self.span
                    .in_scope(|| warn!(error = %e, "failed to unmarshal RTCP"));
                return;
            }
        };
        self.listener.on_rtcp(&packets);

        let ssrc = self.ssrc().unwrap_or_default();
        let mut pli_sent = false;
        let mut nacked = Vec::new();

        for packet in &packets {
            let any = packet.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some()
                || any.downcast_ref::<FullIntraRequest>().is_some()
            {
                // one upstream request per batch
                if pli_sent {
                    continue;
                }
                let target = self.forwarder.target_layers().spatial;
                if target >= 0 {
                    self.last_pli_ms.store(unix_millis(), Ordering::Relaxed);
                    self.receiver.send_pli(target);
                    pli_sent = true;
                }
            } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                self.listener.on_remb(remb);
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                let reports: Vec<_> = rr
                    .reports
                    .iter()
                    .filter(|report| report.ssrc == ssrc)
                    .cloned()
                    .collect();
                let Some(loss) = reports.iter().map(|report| report.fraction_lost).max() else {
                    continue;
                };
                self.stats.loss_fraction.store(loss, Ordering::Relaxed);
                self.listener.on_receiver_report(&ReceiverReport {
                    ssrc: rr.ssrc,
                    reports,
                    profile_extensions: rr.profile_extensions.clone(),
                });
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                if let Some(sequencer) = &self.sequencer {
                    for pair in &nack.nacks {
                        nacked.extend(sequencer.get_packet_metas(&pair.packet_list()));
                    }
                }
            }
        }

        if !nacked.is_empty() {
            let track = Arc::clone(self);
            tokio::spawn(
                async move { track.retransmit_packets(&nacked) }.instrument(self.span.clone()),
            );
        }
    }

    fn retransmit_packets(&self, metas: &[PacketMeta]) {
        let Some(binding) = self.binding() else {
            return;
        };

        let mut buf = vec![0u8; RTX_BUFFER_SIZE];
        for meta in metas {
            let packet = self
                .receiver
                .read_rtp(&mut buf, meta.layer, meta.source_sn)
                .and_then(|n| {
                    let mut raw = &buf[..n];
                    Ok(Packet::unmarshal(&mut raw)?)
                })
                .and_then(|mut packet| {
                    if let Some(outgoing) = &meta.vp8 {
                        let incoming = Vp8::unmarshal(&packet.payload)?;
                        packet.payload = translate_vp8_payload(&packet.payload, &incoming, outgoing)?;
                    }
                    Ok(packet)
                });

            let mut packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, sn = meta.source_sn, "cannot retransmit");
                    continue;
                }
            };
            packet.header.sequence_number = meta.target_sn;
            packet.header.timestamp = meta.timestamp;
            packet.header.ssrc = binding.ssrc;
            packet.header.payload_type = binding.payload_type;
            strip_extensions(&mut packet.header);

            self.send(&binding, packet, false);
        }
    }

    /// Sender report mapping the publisher's clock into this track's
    /// timestamp space, `None` until bound and a publisher report arrived.
    #[must_use]
    pub fn create_sender_report(&self) -> Option<SenderReport> {
        if !self.is_bound() {
            return None;
        }
        let binding = self.binding()?;

        let layer = match self.kind {
            TrackKind::Audio => 0,
            TrackKind::Video => self.forwarder.current_layers().spatial,
        };
        let sr = self.receiver.sender_report_time(layer)?;

        let elapsed = sr.arrival.elapsed();
        let advance = elapsed.as_nanos() * u128::from(self.codec.clock_rate) / 1_000_000_000;
        let munger = self.forwarder.get_rtp_munger_params();
        let rtp_time = sr
            .rtp_time
            .wrapping_sub(munger.ts_offset)
            .wrapping_add(advance as u32);

        Some(SenderReport {
            ssrc: binding.ssrc,
            ntp_time: ntp_time(SystemTime::now()),
            rtp_time,
            packet_count: self.stats.packets.load(Ordering::Relaxed) as u32,
            octet_count: self.stats.bytes.load(Ordering::Relaxed) as u32,
            ..Default::default()
        })
    }

    /// SDES chunks announcing this track, `None` until bound.
    #[must_use]
    pub fn create_source_description_chunks(&self) -> Option<Vec<SourceDescriptionChunk>> {
        if !self.is_bound() {
            return None;
        }
        let binding = self.binding()?;
        Some(vec![SourceDescriptionChunk {
            source: binding.ssrc,
            items: vec![SourceDescriptionItem {
                sdes_type: SdesType::SdesCname,
                text: Bytes::from(self.stream_id.clone()),
            }],
        }])
    }

    #[must_use]
    pub fn stats(&self) -> DownTrackStats {
        DownTrackStats {
            packets_sent: self.stats.packets.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes.load(Ordering::Relaxed),
            packets_dropped: self.stats.dropped.load(Ordering::Relaxed),
            padding_packets: self.stats.padding_packets.load(Ordering::Relaxed),
            padding_bytes: self.stats.padding_bytes.load(Ordering::Relaxed),
            loss_fraction: self.stats.loss_fraction.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn debug_info(&self) -> serde_json::Value {
        let binding = self.binding();
        let munger = self.forwarder.get_rtp_munger_params();
        serde_json::json!({
            "peer_id": self.peer_id,
            "track_id": self.id,
            "stream_id": self.stream_id,
            "kind": self.kind,
            "mime": self.codec.mime_type,
            "ssrc": binding.as_ref().map(|b| b.ssrc),
            "payload_type": binding.as_ref().map(|b| b.payload_type),
            "bound": self.is_bound(),
            "muted": self.muted(),
            "simulcast": self.is_simulcast(),
            "current_layers": self.current_layers(),
            "target_layers": self.target_layers(),
            "max_layers": self.max_layers(),
            "forwarding_status": self.forwarding_status(),
            "allocation_state": self.allocation_state().to_string(),
            "last_pli_ms": self.last_pli_ms.load(Ordering::Relaxed),
            "last_rtp_ms": self.last_rtp_ms.load(Ordering::Relaxed),
            "rtp_munger": {
                "last_sn": munger.last_sn,
                "sn_offset": munger.sn_offset,
                "last_ts": munger.last_ts,
                "ts_offset": munger.ts_offset,
                "last_marker": munger.last_marker,
            },
            "stats": self.stats(),
        })
    }
}

impl TrackSender for DownTrack {
    fn id(&self) -> &TrackId {
        &self.id
    }

    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn codec(&self) -> &RTCRtpCodecCapability {
        &self.codec
    }

    fn uptrack_layers_change(&self, available_layers: &[i32]) {
        Self::uptrack_layers_change(self, available_layers);
    }

    fn write_rtp(&self, ext: &ExtPacket, layer: i32) -> Result<()> {
        Self::write_rtp(self, ext, layer)
    }

    fn set_track_type(&self, is_simulcast: bool) {
        self.is_simulcast.store(is_simulcast, Ordering::Relaxed);
    }

    fn close(&self) {
        Self::close(self);
    }
}

fn kind_from_mime(mime_type: &str) -> Result<TrackKind> {
    let mime_type = mime_type.to_lowercase();
    if mime_type.starts_with("audio/") {
        Ok(TrackKind::Audio)
    } else if mime_type.starts_with("video/") {
        Ok(TrackKind::Video)
    } else {
        Err(Error::UnknownKind)
    }
}

/// Exact match on mime type and fmtp line first, then mime type alone.
fn codec_parameters_fuzzy_search(
    needle: &RTCRtpCodecCapability,
    haystack: &[RTCRtpCodecParameters],
) -> Option<RTCRtpCodecParameters> {
    let same_mime =
        |c: &&RTCRtpCodecParameters| c.capability.mime_type.eq_ignore_ascii_case(&needle.mime_type);
    haystack
        .iter()
        .filter(same_mime)
        .find(|c| c.capability.sdp_fmtp_line == needle.sdp_fmtp_line)
        .or_else(|| haystack.iter().find(same_mime))
        .cloned()
}

/// Publisher header extensions are never forwarded; the pacer adds ours.
fn strip_extensions(header: &mut Header) {
    header.extension = false;
    header.extension_profile = 0;
    header.extensions.clear();
}

/// Swap the VP8 descriptor of `payload` for `outgoing`.
fn translate_vp8_payload(payload: &[u8], incoming: &Vp8, outgoing: &Vp8) -> Result<Bytes> {
    if payload.len() < incoming.header_size {
        return Err(Error::ShortBuffer {
            needed: incoming.header_size,
            available: payload.len(),
        });
    }
    let body = &payload[incoming.header_size..];
    let mut buf = BytesMut::zeroed(outgoing.header_size + body.len());
    outgoing.marshal_to(&mut buf[..outgoing.header_size])?;
    buf[outgoing.header_size..].copy_from_slice(body);
    Ok(buf.freeze())
}

/// STAP-A aggregate of the blank H.264 key frame.
fn h264_blank_frame() -> Bytes {
    let len = 1 + H264_KEY_FRAME_2X2.iter().map(|nalu| 2 + nalu.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(NALU_STAP_A);
    for nalu in H264_KEY_FRAME_2X2 {
        buf.put_u16(nalu.len() as u16);
        buf.put_slice(nalu);
    }
    buf.freeze()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn ntp_time(t: SystemTime) -> u64 {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = d.as_secs() + NTP_EPOCH_OFFSET;
    let frac = (u64::from(d.subsec_nanos()) << 32) / 1_000_000_000;
    (secs << 32) | frac
}
