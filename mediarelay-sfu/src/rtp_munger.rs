//! Sequence number and timestamp rewriting
//!
//! The munger maps the publisher's sequence-number/timestamp space onto the
//! subscriber's so that the subscriber sees one contiguous stream across
//! layer switches, publisher restarts and intentionally dropped packets.

use crate::buffer::ExtPacket;
use crate::error::{Error, Result};
use indexmap::IndexMap;

/// Out-of-order packets further behind the highest sequence number are not munged.
const MISSING_SN_CACHE_SIZE: u16 = 100;

/// How an incoming packet relates to the highest sequence number seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceNumberOrdering {
    #[default]
    Contiguous,
    OutOfOrder,
    Gap,
    Duplicate,
}

/// Munged header fields for one forwarded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TranslationParamsRtp {
    pub sn_ordering: SequenceNumberOrdering,
    pub sequence_number: u16,
    pub timestamp: u32,
}

/// Sequence number and timestamp for a generated packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnTs {
    pub sequence_number: u16,
    pub timestamp: u32,
}

/// Snapshot of the munger state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtpMungerParams {
    pub highest_incoming_sn: u16,
    pub last_sn: u16,
    pub sn_offset: u16,
    pub last_ts: u32,
    pub ts_offset: u32,
    pub last_marker: bool,
}

#[derive(Debug, Default)]
pub struct RtpMunger {
    params: RtpMungerParams,
    /// incoming sequence numbers lost in a gap, with the offset in force
    /// then, oldest first
    missing_sns: IndexMap<u16, u16>,
}

impl RtpMunger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn params(&self) -> RtpMungerParams {
        self.params.clone()
    }

    /// Start munging from this packet, keeping its numbering as is.
    pub fn set_last_sn_ts(&mut self, ext: &ExtPacket) {
        let header = &ext.packet.header;
        self.params.highest_incoming_sn = header.sequence_number.wrapping_sub(1);
        self.params.last_sn = header.sequence_number;
        self.params.last_ts = header.timestamp;
    }

    /// Re-anchor offsets so `ext` continues right after the last sent packet.
    pub fn update_sn_ts_offsets(&mut self, ext: &ExtPacket, sn_adjust: u16, ts_adjust: u32) {
        let header = &ext.packet.header;
        self.params.highest_incoming_sn = header.sequence_number.wrapping_sub(1);
        self.params.sn_offset = header
            .sequence_number
            .wrapping_sub(self.params.last_sn)
            .wrapping_sub(sn_adjust);
        self.params.ts_offset = header
            .timestamp
            .wrapping_sub(self.params.last_ts)
            .wrapping_sub(ts_adjust);

        // missing packets of the previous source are never forwarded
        self.missing_sns.clear();
    }

    /// Account for a head packet that will not be forwarded.
    pub fn packet_dropped(&mut self, ext: &ExtPacket) {
        if !ext.head {
            return;
        }
        self.params.highest_incoming_sn = ext.packet.header.sequence_number;
        self.params.sn_offset = self.params.sn_offset.wrapping_add(1);
        self.prune_missing_sns();
    }

    /// Forget lost sequence numbers that fell out of the window behind the
    /// highest one, so a stale entry never matches after the wrap.
    fn prune_missing_sns(&mut self) {
        while let Some((&sn, _)) = self.missing_sns.first() {
            if self.params.highest_incoming_sn.wrapping_sub(sn) <= MISSING_SN_CACHE_SIZE {
                break;
            }
            self.missing_sns.shift_remove_index(0);
        }
    }

    pub fn update_and_get_sn_ts(&mut self, ext: &ExtPacket) -> Result<TranslationParamsRtp> {
        let header = &ext.packet.header;

        if !ext.head {
            let sn_offset = self
                .missing_sns
                .shift_remove(&header.sequence_number)
                .ok_or(Error::OutOfOrderSequenceNumberCacheMiss)?;
            return Ok(TranslationParamsRtp {
                sn_ordering: SequenceNumberOrdering::OutOfOrder,
                sequence_number: header.sequence_number.wrapping_sub(sn_offset),
                timestamp: header.timestamp.wrapping_sub(self.params.ts_offset),
            });
        }

        let mut ordering = SequenceNumberOrdering::Contiguous;
        let diff = header
            .sequence_number
            .wrapping_sub(self.params.highest_incoming_sn);
        if diff > 1 {
            ordering = SequenceNumberOrdering::Gap;
            let mut sn = if diff - 1 > MISSING_SN_CACHE_SIZE {
                header.sequence_number.wrapping_sub(MISSING_SN_CACHE_SIZE)
            } else {
                self.params.highest_incoming_sn.wrapping_add(1)
            };
            while sn != header.sequence_number {
                self.missing_sns.insert(sn, self.params.sn_offset);
                sn = sn.wrapping_add(1);
            }
        } else if diff == 0 {
            // FEC and retransmission can deliver the same packet twice
            return Err(Error::DuplicatePacket);
        } else if ext.packet.payload.is_empty() {
            // in-order padding can be absorbed by the offset
            self.params.highest_incoming_sn = header.sequence_number;
            self.params.sn_offset = self.params.sn_offset.wrapping_add(1);
            self.prune_missing_sns();
            return Err(Error::PaddingOnlyPacket);
        }

        // Anything after a gap is forwarded even if it is padding, since it
        // cannot be known whether the lost packets would have been dropped.
        let munged_sn = header.sequence_number.wrapping_sub(self.params.sn_offset);
        let munged_ts = header.timestamp.wrapping_sub(self.params.ts_offset);

        self.params.highest_incoming_sn = header.sequence_number;
        self.prune_missing_sns();
        self.params.last_sn = munged_sn;
        self.params.last_ts = munged_ts;
        self.params.last_marker = header.marker;

        Ok(TranslationParamsRtp {
            sn_ordering: ordering,
            sequence_number: munged_sn,
            timestamp: munged_ts,
        })
    }

    /// Allocate sequence numbers and timestamps for `num` generated packets.
    pub fn update_and_get_padding_sn_ts(
        &mut self,
        num: usize,
        clock_rate: u32,
        frame_rate: u32,
        force_marker: bool,
    ) -> Result<Vec<SnTs>> {
        let mut use_last_ts = false;
        if !self.params.last_marker {
            if !force_marker {
                return Err(Error::PaddingNotOnFrameBoundary);
            }
            // the first generated packet closes the frame in flight
            use_last_ts = true;
        }

        if num == 0 {
            return Ok(Vec::new());
        }

        let ts_step = if frame_rate == 0 {
            0
        } else {
            clock_rate / frame_rate
        };

        let mut vals = Vec::with_capacity(num);
        for i in 0..num {
            let frames = if use_last_ts { i } else { i + 1 };
            vals.push(SnTs {
                sequence_number: self.params.last_sn.wrapping_add(i as u16 + 1),
                timestamp: self
                    .params
                    .last_ts
                    .wrapping_add((frames as u32).wrapping_mul(ts_step)),
            });
        }

        if let Some(last) = vals.last() {
            self.params.sn_offset = self.params.sn_offset.wrapping_sub(num as u16);
            self.params.ts_offset = self
                .params
                .ts_offset
                .wrapping_sub(last.timestamp.wrapping_sub(self.params.last_ts));
            self.params.last_sn = last.sequence_number;
            self.params.last_ts = last.timestamp;
        }
        if force_marker {
            self.params.last_marker = true;
        }

        Ok(vals)
    }

    #[must_use]
    pub const fn is_on_frame_boundary(&self) -> bool {
        self.params.last_marker
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Instant;
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    pub(crate) fn ext_packet(sn: u16, ts: u32, payload: &[u8], head: bool) -> ExtPacket {
        ExtPacket {
            head,
            arrival: Instant::now(),
            packet: Packet {
                header: Header {
                    version: 2,
                    sequence_number: sn,
                    timestamp: ts,
                    ssrc: 1,
                    ..Default::default()
                },
                payload: Bytes::copy_from_slice(payload),
            },
            vp8: None,
            key_frame: false,
            raw: Bytes::new(),
        }
    }

    #[test]
    fn test_contiguous_passthrough() {
        let mut munger = RtpMunger::new();
        let first = ext_packet(23333, 0xabcd, &[1], true);
        munger.set_last_sn_ts(&first);

        let tp = munger.update_and_get_sn_ts(&first).unwrap();
        assert_eq!(tp.sn_ordering, SequenceNumberOrdering::Contiguous);
        assert_eq!(tp.sequence_number, 23333);
        assert_eq!(tp.timestamp, 0xabcd);
    }

    #[test]
    fn test_gap_then_out_of_order_fill() {
        let mut munger = RtpMunger::new();
        let first = ext_packet(100, 1000, &[1], true);
        munger.set_last_sn_ts(&first);
        munger.update_and_get_sn_ts(&first).unwrap();

        let tp = munger
            .update_and_get_sn_ts(&ext_packet(103, 1000, &[1], true))
            .unwrap();
        assert_eq!(tp.sn_ordering, SequenceNumberOrdering::Gap);
        assert_eq!(tp.sequence_number, 103);

        let tp = munger
            .update_and_get_sn_ts(&ext_packet(101, 1000, &[1], false))
            .unwrap();
        assert_eq!(tp.sn_ordering, SequenceNumberOrdering::OutOfOrder);
        assert_eq!(tp.sequence_number, 101);

        // served from the cache only once
        assert!(matches!(
            munger.update_and_get_sn_ts(&ext_packet(101, 1000, &[1], false)),
            Err(Error::OutOfOrderSequenceNumberCacheMiss)
        ));
    }

    #[test]
    fn test_missing_sn_cache_is_bounded_across_wrap() {
        let mut munger = RtpMunger::new();
        let first = ext_packet(10, 0, &[1], true);
        munger.set_last_sn_ts(&first);
        munger.update_and_get_sn_ts(&first).unwrap();

        // a long gap only remembers the most recent losses
        munger
            .update_and_get_sn_ts(&ext_packet(40_000, 0, &[1], true))
            .unwrap();
        assert_eq!(munger.missing_sns.len(), MISSING_SN_CACHE_SIZE as usize);
        assert!(matches!(
            munger.update_and_get_sn_ts(&ext_packet(11, 0, &[1], false)),
            Err(Error::OutOfOrderSequenceNumberCacheMiss)
        ));

        // walk past the wrap without further gaps
        for sn in 40_001..=65_535u16 {
            munger
                .update_and_get_sn_ts(&ext_packet(sn, 0, &[1], true))
                .unwrap();
        }
        for sn in 0..=39_950u16 {
            munger
                .update_and_get_sn_ts(&ext_packet(sn, 0, &[1], true))
                .unwrap();
        }
        assert!(munger.missing_sns.is_empty());

        // this number was lost before the wrap; a late copy must not be munged
        assert!(matches!(
            munger.update_and_get_sn_ts(&ext_packet(39_950, 0, &[1], false)),
            Err(Error::OutOfOrderSequenceNumberCacheMiss)
        ));
    }

    #[test]
    fn test_duplicate() {
        let mut munger = RtpMunger::new();
        let first = ext_packet(7, 0, &[1], true);
        munger.set_last_sn_ts(&first);
        munger.update_and_get_sn_ts(&first).unwrap();
        assert!(matches!(
            munger.update_and_get_sn_ts(&first),
            Err(Error::DuplicatePacket)
        ));
    }

    #[test]
    fn test_padding_only_packet_is_absorbed() {
        let mut munger = RtpMunger::new();
        let first = ext_packet(10, 0, &[1], true);
        munger.set_last_sn_ts(&first);
        munger.update_and_get_sn_ts(&first).unwrap();

        assert!(matches!(
            munger.update_and_get_sn_ts(&ext_packet(11, 0, &[], true)),
            Err(Error::PaddingOnlyPacket)
        ));
        let tp = munger
            .update_and_get_sn_ts(&ext_packet(12, 0, &[1], true))
            .unwrap();
        assert_eq!(tp.sequence_number, 11);
    }

    #[test]
    fn test_dropped_packet_keeps_contiguity() {
        let mut munger = RtpMunger::new();
        let first = ext_packet(65534, 0, &[1], true);
        munger.set_last_sn_ts(&first);
        munger.update_and_get_sn_ts(&first).unwrap();

        munger.packet_dropped(&ext_packet(65535, 0, &[1], true));
        let tp = munger
            .update_and_get_sn_ts(&ext_packet(0, 0, &[1], true))
            .unwrap();
        assert_eq!(tp.sequence_number, 65535);
        assert_eq!(tp.sn_ordering, SequenceNumberOrdering::Contiguous);
    }

    #[test]
    fn test_source_switch_offsets() {
        let mut munger = RtpMunger::new();
        let first = ext_packet(500, 10_000, &[1], true);
        munger.set_last_sn_ts(&first);
        munger.update_and_get_sn_ts(&first).unwrap();

        let switched = ext_packet(9000, 777_000, &[1], true);
        munger.update_sn_ts_offsets(&switched, 1, 3000);
        let tp = munger.update_and_get_sn_ts(&switched).unwrap();
        assert_eq!(tp.sequence_number, 501);
        assert_eq!(tp.timestamp, 13_000);
    }

    #[test]
    fn test_padding_requires_frame_boundary() {
        let mut munger = RtpMunger::new();
        let first = ext_packet(10, 1000, &[1], true);
        munger.set_last_sn_ts(&first);
        munger.update_and_get_sn_ts(&first).unwrap();

        assert!(matches!(
            munger.update_and_get_padding_sn_ts(2, 90000, 30, false),
            Err(Error::PaddingNotOnFrameBoundary)
        ));

        let vals = munger
            .update_and_get_padding_sn_ts(2, 90000, 30, true)
            .unwrap();
        assert_eq!(vals[0].sequence_number, 11);
        assert_eq!(vals[0].timestamp, 1000);
        assert_eq!(vals[1].sequence_number, 12);
        assert_eq!(vals[1].timestamp, 4000);
        assert!(munger.is_on_frame_boundary());

        // the next real packet continues after the generated ones
        let tp = munger
            .update_and_get_sn_ts(&ext_packet(11, 1000 + 3000, &[1], true))
            .unwrap();
        assert_eq!(tp.sequence_number, 13);
        assert_eq!(tp.timestamp, 7000);
    }
}
