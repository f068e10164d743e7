//! Subscriber sequence number bookkeeping for retransmission
//!
//! Every forwarded packet is recorded under its munged (subscriber-facing)
//! sequence number together with where it came from, so a NACK can be served
//! by re-reading the original packet from the receiver's buffer.

use crate::buffer::Vp8;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// Retransmit the same packet at most this often.
const IGNORE_RETRANSMISSION: Duration = Duration::from_millis(100);
/// Give up on a packet after this many retransmissions.
const MAX_NACK: u8 = 3;

/// What a forwarded packet was before munging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Sequence number in the publisher's stream
    pub source_sn: u16,
    /// Sequence number sent to the subscriber
    pub target_sn: u16,
    /// Munged timestamp
    pub timestamp: u32,
    /// Spatial layer the packet was read from
    pub layer: u8,
    /// Munged VP8 descriptor, if the payload header was rewritten
    pub vp8: Option<Vp8>,
    nacked: u8,
    last_nack: Option<Instant>,
}

struct SequencerInner {
    slots: Vec<Option<PacketMeta>>,
    /// newest target sequence number and its unwrapped value
    head: Option<(u16, u64)>,
}

impl SequencerInner {
    fn unwrap_sn(&self, sn: u16) -> Option<u64> {
        let (head_sn, head_ext) = self.head?;
        let diff = i64::from(sn.wrapping_sub(head_sn) as i16);
        u64::try_from(head_ext as i64 + diff).ok()
    }

    fn index_of(&self, ext: u64) -> Option<usize> {
        let (_, head_ext) = self.head?;
        if ext > head_ext || head_ext - ext >= self.slots.len() as u64 {
            return None;
        }
        Some((ext % self.slots.len() as u64) as usize)
    }
}

/// Ring of recently forwarded packets keyed by subscriber sequence number.
pub struct Sequencer {
    inner: Mutex<SequencerInner>,
}

impl Sequencer {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(SequencerInner {
                slots: vec![None; size.max(1)],
                head: None,
            }),
        }
    }

    /// Record a forwarded packet.
    pub fn push(&self, source_sn: u16, target_sn: u16, timestamp: u32, layer: u8, vp8: Option<Vp8>) {
        let mut inner = self.inner.lock();

        let ext = match inner.unwrap_sn(target_sn) {
            Some(ext) => ext,
            None => {
                let ext = (1 << 16) + u64::from(target_sn);
                inner.head = Some((target_sn, ext));
                ext
            }
        };
        if inner.head.is_some_and(|(_, head_ext)| ext > head_ext) {
            inner.head = Some((target_sn, ext));
        }

        let Some(idx) = inner.index_of(ext) else {
            trace!(source_sn, target_sn, "packet too old to sequence");
            return;
        };
        inner.slots[idx] = Some(PacketMeta {
            source_sn,
            target_sn,
            timestamp,
            layer,
            vp8,
            nacked: 0,
            last_nack: None,
        });
    }

    /// Look up NACKed subscriber sequence numbers that are eligible for resend.
    pub fn get_packet_metas(&self, target_sns: &[u16]) -> Vec<PacketMeta> {
        self.get_packet_metas_at(target_sns, Instant::now())
    }

    fn get_packet_metas_at(&self, target_sns: &[u16], now: Instant) -> Vec<PacketMeta> {
        let mut inner = self.inner.lock();
        let mut metas = Vec::with_capacity(target_sns.len());

        for &sn in target_sns {
            let Some(idx) = inner.unwrap_sn(sn).and_then(|ext| inner.index_of(ext)) else {
                continue;
            };
            let Some(meta) = inner.slots[idx].as_mut() else {
                continue;
            };
            if meta.target_sn != sn || meta.nacked >= MAX_NACK {
                continue;
            }
            if meta
                .last_nack
                .is_some_and(|last| now.saturating_duration_since(last) <= IGNORE_RETRANSMISSION)
            {
                continue;
            }

            meta.nacked += 1;
            meta.last_nack = Some(now);
            metas.push(*meta);
        }

        metas
    }
}
