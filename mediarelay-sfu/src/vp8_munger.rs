//! VP8 payload descriptor rewriting
//!
//! Keeps picture id, TL0PICIDX and KEYIDX continuous for the subscriber when
//! layers are switched or temporal layers are filtered out.

use crate::buffer::vp8::{picture_id_size_diff, Vp8};
use crate::buffer::ExtPacket;
use crate::error::{Error, Result};
use crate::rtp_munger::SequenceNumberOrdering;
use indexmap::IndexMap;

/// Missing picture ids remembered for late packets after a gap.
const MISSING_PICTURE_ID_CACHE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationParamsVp8 {
    pub header: Vp8,
}

/// Unwraps 7/15-bit picture ids into a monotonically growing space.
#[derive(Debug, Default)]
struct PictureIdWrapHandler {
    max_picture_id: i32,
    max_m_bit: bool,
}

impl PictureIdWrapHandler {
    fn init(&mut self, ext_picture_id: i32, m_bit: bool) {
        self.max_picture_id = ext_picture_id;
        self.max_m_bit = m_bit;
    }

    const fn max_picture_id(&self) -> i32 {
        self.max_picture_id
    }

    /// Senders may switch between 7 and 15 bits, so wrap is judged against
    /// the width of the newest picture id seen.
    fn unwrap(&self, picture_id: u16, m_bit: bool) -> i32 {
        let modulus: i32 = if self.max_m_bit { 1 << 15 } else { 1 << 7 };
        let base = self.max_picture_id - self.max_picture_id.rem_euclid(modulus);
        let new = if m_bit {
            i32::from(picture_id & 0x7fff)
        } else {
            i32::from(picture_id & 0x7f)
        };

        let mut ext = base + new;
        let diff = ext - self.max_picture_id;
        if diff < -(modulus / 2) {
            ext += modulus;
        } else if diff > modulus / 2 && new < modulus {
            // late packet from before the last wrap
            ext -= modulus;
        }
        ext
    }

    fn update_max_picture_id(&mut self, ext_picture_id: i32, m_bit: bool) {
        if ext_picture_id >= self.max_picture_id {
            self.max_picture_id = ext_picture_id;
            self.max_m_bit = m_bit;
        }
    }
}

#[derive(Debug, Default)]
pub struct Vp8Munger {
    wrap_handler: PictureIdWrapHandler,
    ext_last_picture_id: i32,
    picture_id_offset: i32,
    picture_id_used: bool,
    last_tl0_pic_idx: u8,
    tl0_pic_idx_offset: u8,
    tl0_pic_idx_used: bool,
    tid_used: bool,
    last_key_idx: u8,
    key_idx_offset: u8,
    key_idx_used: bool,

    missing_picture_ids: IndexMap<i32, i32>,
    last_dropped_picture_id: Option<i32>,
}

impl Vp8Munger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start munging from this packet, keeping its values as they are.
    pub fn set_last(&mut self, ext: &ExtPacket) {
        let Some(vp8) = &ext.vp8 else {
            return;
        };

        self.picture_id_used = vp8.picture_id_present;
        if self.picture_id_used {
            self.wrap_handler
                .init(i32::from(vp8.picture_id) - 1, vp8.m_bit);
            self.ext_last_picture_id = i32::from(vp8.picture_id);
        }

        self.tl0_pic_idx_used = vp8.tl0_pic_idx_present;
        if self.tl0_pic_idx_used {
            self.last_tl0_pic_idx = vp8.tl0_pic_idx;
        }

        self.tid_used = vp8.tid_present;

        self.key_idx_used = vp8.key_idx_present;
        if self.key_idx_used {
            self.last_key_idx = vp8.key_idx;
        }

        self.last_dropped_picture_id = None;
    }

    /// Re-anchor offsets so `ext` continues right after the last sent picture.
    pub fn update_offsets(&mut self, ext: &ExtPacket) {
        let Some(vp8) = &ext.vp8 else {
            return;
        };

        if self.picture_id_used {
            self.wrap_handler
                .init(i32::from(vp8.picture_id) - 1, vp8.m_bit);
            self.picture_id_offset = i32::from(vp8.picture_id) - self.ext_last_picture_id - 1;
        }
        if self.tl0_pic_idx_used {
            self.tl0_pic_idx_offset = vp8
                .tl0_pic_idx
                .wrapping_sub(self.last_tl0_pic_idx)
                .wrapping_sub(1);
        }
        if self.key_idx_used {
            self.key_idx_offset = vp8
                .key_idx
                .wrapping_sub(self.last_key_idx)
                .wrapping_sub(1)
                & 0x1f;
        }

        self.missing_picture_ids.clear();
        self.last_dropped_picture_id = None;
    }

    pub fn update_and_get(
        &mut self,
        ext: &ExtPacket,
        ordering: SequenceNumberOrdering,
        max_temporal_layer: i32,
    ) -> Result<TranslationParamsVp8> {
        let vp8 = ext.vp8.ok_or(Error::NotVp8)?;

        let ext_picture_id = self.wrap_handler.unwrap(vp8.picture_id, vp8.m_bit);

        if ordering == SequenceNumberOrdering::OutOfOrder {
            // kept in the cache as more packets of the same picture may follow
            let picture_id_offset = *self
                .missing_picture_ids
                .get(&ext_picture_id)
                .ok_or(Error::OutOfOrderVp8PictureIdCacheMiss)?;

            return Ok(TranslationParamsVp8 {
                header: self.munged_header(&vp8, ext_picture_id - picture_id_offset),
            });
        }

        let prev_max_picture_id = self.wrap_handler.max_picture_id();
        self.wrap_handler
            .update_max_picture_id(ext_picture_id, vp8.m_bit);

        if ordering == SequenceNumberOrdering::Gap {
            // A later packet of a picture that was already filtered out can
            // be dropped; its missing siblings will miss the cache too.
            if self.last_dropped_picture_id == Some(ext_picture_id) {
                return Err(Error::FilteredVp8TemporalLayer);
            }

            // lost packets may belong to any picture from the last seen one
            // up to this one
            for lost in prev_max_picture_id..=ext_picture_id {
                self.missing_picture_ids
                    .insert(lost, self.picture_id_offset);
            }
            while self.missing_picture_ids.len() > MISSING_PICTURE_ID_CACHE_SIZE {
                self.missing_picture_ids.shift_remove_index(0);
            }
        } else if vp8.tid_present && i32::from(vp8.tid) > max_temporal_layer {
            // adjust once per picture, a picture can span several packets
            if self.last_dropped_picture_id != Some(ext_picture_id) {
                self.last_dropped_picture_id = Some(ext_picture_id);
                self.picture_id_offset += 1;
            }
            return Err(Error::FilteredVp8TemporalLayer);
        }

        // After a gap even filtered layers are forwarded: whether the lost
        // packets were droppable cannot be known.
        let header = self.munged_header(&vp8, ext_picture_id - self.picture_id_offset);
        if self.picture_id_used {
            self.ext_last_picture_id = ext_picture_id - self.picture_id_offset;
        }
        self.last_tl0_pic_idx = header.tl0_pic_idx;
        self.last_key_idx = header.key_idx;

        Ok(TranslationParamsVp8 { header })
    }

    fn munged_header(&self, vp8: &Vp8, ext_munged_picture_id: i32) -> Vp8 {
        let mut header = *vp8;

        if vp8.picture_id_present {
            let picture_id = (ext_munged_picture_id & 0x7fff) as u16;
            header.picture_id = picture_id;
            header.m_bit = picture_id > 127;
            header.header_size =
                (vp8.header_size as isize + picture_id_size_diff(header.m_bit, vp8.m_bit)) as usize;
        }
        header.tl0_pic_idx = vp8.tl0_pic_idx.wrapping_sub(self.tl0_pic_idx_offset);
        header.key_idx = vp8.key_idx.wrapping_sub(self.key_idx_offset) & 0x1f;

        header
    }

    /// Descriptor for a generated frame, optionally starting a new picture.
    pub fn update_and_get_padding(&mut self, new_picture: bool) -> Vp8 {
        let offset: u8 = u8::from(new_picture);

        let mut header_size = 1;
        if self.picture_id_used || self.tl0_pic_idx_used || self.tid_used || self.key_idx_used {
            header_size += 1;
        }

        let mut picture_id = 0u16;
        if self.picture_id_used {
            let ext_picture_id = self.ext_last_picture_id + i32::from(offset);
            self.ext_last_picture_id = ext_picture_id;
            self.picture_id_offset -= i32::from(offset);
            picture_id = (ext_picture_id & 0x7fff) as u16;
            header_size += if picture_id > 127 { 2 } else { 1 };
        }

        let mut tl0_pic_idx = 0;
        if self.tl0_pic_idx_used {
            tl0_pic_idx = self.last_tl0_pic_idx.wrapping_add(offset);
            self.last_tl0_pic_idx = tl0_pic_idx;
            self.tl0_pic_idx_offset = self.tl0_pic_idx_offset.wrapping_sub(offset);
            header_size += 1;
        }

        if self.tid_used || self.key_idx_used {
            header_size += 1;
        }

        let mut key_idx = 0;
        if self.key_idx_used {
            key_idx = self.last_key_idx.wrapping_add(offset) & 0x1f;
            self.last_key_idx = key_idx;
            self.key_idx_offset = self.key_idx_offset.wrapping_sub(offset);
        }

        Vp8 {
            // start of partition 0
            first_byte: 0x10,
            picture_id_present: self.picture_id_used,
            picture_id,
            m_bit: picture_id > 127,
            tl0_pic_idx_present: self.tl0_pic_idx_used,
            tl0_pic_idx,
            tid_present: self.tid_used,
            tid: 0,
            y: 1,
            key_idx_present: self.key_idx_used,
            key_idx,
            header_size,
            is_key_frame: true,
        }
    }
}
