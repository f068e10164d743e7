//! Publisher-side packet buffer
//!
//! One `Buffer` exists per received simulcast layer. The transport writes raw
//! RTP into it; the receiver's forwarding loop drains parsed [`ExtPacket`]s
//! with [`Buffer::read_extended`], and down tracks read stored packets back by
//! sequence number to serve retransmissions.

mod bucket;
pub mod vp8;

use crate::config::ReceiverConfig;
use crate::error::{Error, Result};
use bucket::Bucket;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, Span};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::util::marshal::Unmarshal;

pub use vp8::Vp8;

/// A received RTP packet with the metadata the forwarding path needs.
#[derive(Debug, Clone)]
pub struct ExtPacket {
    /// Newest sequence number seen so far on this buffer
    pub head: bool,
    pub arrival: Instant,
    pub packet: Packet,
    /// Parsed payload descriptor for VP8 streams
    pub vp8: Option<Vp8>,
    pub key_frame: bool,
    pub raw: Bytes,
}

impl ExtPacket {
    #[must_use]
    pub fn temporal_layer(&self) -> usize {
        match &self.vp8 {
            Some(vp8) if vp8.tid_present => usize::from(vp8.tid.min(3)),
            _ => 0,
        }
    }
}

/// Timing of the last RTCP sender report received for this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReportData {
    pub rtp_time: u32,
    pub ntp_time: u64,
    pub arrival: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Vp8,
    H264,
    Other,
}

struct BitrateMeter {
    interval: Duration,
    window_start: Option<Instant>,
    bytes: [u64; 4],
    bitrates: [i64; 4],
}

impl BitrateMeter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            bytes: [0; 4],
            bitrates: [0; 4],
        }
    }

    fn roll(&mut self, now: Instant) {
        let Some(start) = self.window_start else {
            return;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.interval {
            return;
        }

        let secs = elapsed.as_secs_f64();
        for (bitrate, bytes) in self.bitrates.iter_mut().zip(self.bytes.iter_mut()) {
            *bitrate = (*bytes as f64 * 8.0 / secs) as i64;
            *bytes = 0;
        }
        self.window_start = Some(now);
    }

    fn add(&mut self, now: Instant, tid: usize, size: usize) {
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.roll(now);
        self.bytes[tid] += size as u64;
    }
}

struct BufferInner {
    bucket: Bucket,
    pending: VecDeque<ExtPacket>,
    highest_sn: Option<u16>,
    bitrate: BitrateMeter,
    sender_report: Option<SenderReportData>,
    closed: bool,
}

/// Per-layer receive buffer
pub struct Buffer {
    ssrc: u32,
    codec: Codec,
    clock_rate: u32,
    inner: Mutex<BufferInner>,
    notify: Notify,
    span: Span,
}

impl Buffer {
    #[must_use]
    pub fn new(
        ssrc: u32,
        capability: &RTCRtpCodecCapability,
        config: &ReceiverConfig,
        span: Span,
    ) -> Self {
        let codec = if capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
            Codec::Vp8
        } else if capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
            Codec::H264
        } else {
            Codec::Other
        };

        Self {
            ssrc,
            codec,
            clock_rate: capability.clock_rate,
            inner: Mutex::new(BufferInner {
                bucket: Bucket::new(config.packet_buffer_size),
                pending: VecDeque::new(),
                highest_sn: None,
                bitrate: BitrateMeter::new(config.bitrate_interval()),
                sender_report: None,
                closed: false,
            }),
            notify: Notify::new(),
            span,
        }
    }

    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[must_use]
    pub const fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Store a raw RTP packet and queue it for the reader.
    pub fn write(&self, raw: &[u8]) -> Result<()> {
        let mut reader = raw;
        let packet = Packet::unmarshal(&mut reader)?;

        let vp8 = if self.codec == Codec::Vp8 && !packet.payload.is_empty() {
            Some(Vp8::unmarshal(&packet.payload)?)
        } else {
            None
        };
        let key_frame = match self.codec {
            Codec::Vp8 => vp8.is_some_and(|v| v.is_key_frame),
            Codec::H264 => is_h264_keyframe(&packet.payload),
            Codec::Other => false,
        };

        let now = Instant::now();
        let sn = packet.header.sequence_number;
        let raw = Bytes::copy_from_slice(raw);

        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }

        let head = match inner.highest_sn {
            None => true,
            Some(highest) => {
                let diff = sn.wrapping_sub(highest);
                diff != 0 && diff < 0x8000
            }
        };
        if head {
            inner.highest_sn = Some(sn);
        }

        inner.bucket.add(sn, raw.clone());

        let ext = ExtPacket {
            head,
            arrival: now,
            packet,
            vp8,
            key_frame,
            raw,
        };
        let tid = ext.temporal_layer();
        inner.bitrate.add(now, tid, ext.raw.len());
        inner.pending.push_back(ext);
        drop(inner);

        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next received packet; `None` once closed and drained.
    pub async fn read_extended(&self) -> Option<ExtPacket> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(pkt) = inner.pending.pop_front() {
                    return Some(pkt);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Copy the stored packet with sequence number `sn` into `buf`.
    pub fn get_packet(&self, buf: &mut [u8], sn: u16) -> Result<usize> {
        let inner = self.inner.lock();
        let data = inner.bucket.get(sn).ok_or(Error::PacketNotFound(sn))?;
        if buf.len() < data.len() {
            return Err(Error::ShortBuffer {
                needed: data.len(),
                available: buf.len(),
            });
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Bitrates per temporal layer where each layer includes the ones below it.
    ///
    /// A layer with no measured traffic stays at zero.
    #[must_use]
    pub fn bitrate_temporal_cumulative(&self) -> [i64; 4] {
        let mut inner = self.inner.lock();
        inner.bitrate.roll(Instant::now());
        let mut br = inner.bitrate.bitrates;
        drop(inner);

        for i in (1..br.len()).rev() {
            if br[i] != 0 {
                for j in (0..i).rev() {
                    br[i] += br[j];
                }
            }
        }
        br
    }

    pub fn set_sender_report_data(&self, rtp_time: u32, ntp_time: u64) {
        self.inner.lock().sender_report = Some(SenderReportData {
            rtp_time,
            ntp_time,
            arrival: Instant::now(),
        });
    }

    #[must_use]
    pub fn sender_report_data(&self) -> Option<SenderReportData> {
        self.inner.lock().sender_report
    }

    /// Stop accepting packets; the reader sees EOF after draining.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);

        self.span.in_scope(|| debug!(ssrc = self.ssrc, "buffer closed"));
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Whether an H.264 RTP payload starts or carries an IDR picture or SPS.
fn is_h264_keyframe(payload: &[u8]) -> bool {
    const NALU_IDR: u8 = 5;
    const NALU_SPS: u8 = 7;
    const NALU_STAP_A: u8 = 24;
    const NALU_FU_A: u8 = 28;

    let Some(&first) = payload.first() else {
        return false;
    };

    match first & 0x1f {
        NALU_IDR | NALU_SPS => true,
        NALU_STAP_A => {
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = usize::from(u16::from_be_bytes([payload[offset], payload[offset + 1]]));
                let nalu = payload[offset + 2] & 0x1f;
                if nalu == NALU_IDR || nalu == NALU_SPS {
                    return true;
                }
                offset += 2 + size;
            }
            false
        }
        NALU_FU_A => payload
            .get(1)
            .is_some_and(|&fu| fu & 0x80 != 0 && matches!(fu & 0x1f, NALU_IDR | NALU_SPS)),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use webrtc::rtp::header::Header;
    use webrtc::util::marshal::Marshal;

    pub(crate) fn vp8_capability() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        }
    }

    pub(crate) fn rtp_bytes(sn: u16, ts: u32, payload: &[u8]) -> Bytes {
        Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                sequence_number: sn,
                timestamp: ts,
                ssrc: 1234,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        }
        .marshal()
        .unwrap()
    }

    fn new_buffer() -> Buffer {
        Buffer::new(
            1234,
            &vp8_capability(),
            &ReceiverConfig::default(),
            Span::none(),
        )
    }

    #[tokio::test]
    async fn test_write_then_read_extended() {
        let buffer = new_buffer();
        // key frame: S bit, PID 0, P bit clear
        buffer.write(&rtp_bytes(10, 3000, &[0x10, 0x00, 0x9d])).unwrap();
        buffer.write(&rtp_bytes(11, 3000, &[0x00, 0x01])).unwrap();

        let first = buffer.read_extended().await.unwrap();
        assert!(first.head);
        assert!(first.key_frame);
        assert_eq!(first.packet.header.sequence_number, 10);

        let second = buffer.read_extended().await.unwrap();
        assert!(second.head);
        assert!(!second.key_frame);
    }

    #[tokio::test]
    async fn test_out_of_order_is_not_head() {
        let buffer = new_buffer();
        buffer.write(&rtp_bytes(20, 0, &[0x10, 0x01])).unwrap();
        buffer.write(&rtp_bytes(19, 0, &[0x10, 0x01])).unwrap();

        assert!(buffer.read_extended().await.unwrap().head);
        assert!(!buffer.read_extended().await.unwrap().head);
    }

    #[tokio::test]
    async fn test_close_yields_eof_after_drain() {
        let buffer = Arc::new(new_buffer());
        buffer.write(&rtp_bytes(1, 0, &[0x10, 0x01])).unwrap();
        buffer.close();

        assert!(buffer.read_extended().await.is_some());
        assert!(buffer.read_extended().await.is_none());
        // writes after close are ignored
        buffer.write(&rtp_bytes(2, 0, &[0x10, 0x01])).unwrap();
        assert!(buffer.read_extended().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_wakes_on_write() {
        let buffer = Arc::new(new_buffer());
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.read_extended().await })
        };
        tokio::task::yield_now().await;
        buffer.write(&rtp_bytes(5, 0, &[0x10, 0x01])).unwrap();

        let pkt = reader.await.unwrap().unwrap();
        assert_eq!(pkt.packet.header.sequence_number, 5);
    }

    #[test]
    fn test_get_packet() {
        let buffer = new_buffer();
        let raw = rtp_bytes(65535, 0, &[0x10, 0x01, 0x02]);
        buffer.write(&raw).unwrap();

        let mut buf = [0u8; 1500];
        let n = buffer.get_packet(&mut buf, 65535).unwrap();
        assert_eq!(&buf[..n], &raw[..]);
        assert!(matches!(
            buffer.get_packet(&mut buf, 0),
            Err(Error::PacketNotFound(0))
        ));
    }

    #[test]
    fn test_h264_keyframe_detection() {
        assert!(is_h264_keyframe(&[0x65, 0x88]));
        assert!(is_h264_keyframe(&[0x18, 0x00, 0x02, 0x67, 0x42]));
        assert!(is_h264_keyframe(&[0x7c, 0x85, 0x00]));
        assert!(!is_h264_keyframe(&[0x41, 0x9a]));
        assert!(!is_h264_keyframe(&[]));
    }
}
