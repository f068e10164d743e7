//! VP8 RTP payload descriptor (RFC 7741 section 4.2)
//!
//! ```text
//!       0 1 2 3 4 5 6 7
//!      +-+-+-+-+-+-+-+-+
//!      |X|R|N|S|R| PID | (REQUIRED)
//!      +-+-+-+-+-+-+-+-+
//! X:   |I|L|T|K| RSV   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! I:   |M| PictureID   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//!      |   PictureID   |
//!      +-+-+-+-+-+-+-+-+
//! L:   |   TL0PICIDX   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! T/K: |TID|Y| KEYIDX  | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! ```

use crate::error::{Error, Result};

/// Parsed VP8 payload descriptor plus the keyframe flag of the frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vp8 {
    pub first_byte: u8,

    pub picture_id_present: bool,
    pub picture_id: u16,
    /// Picture id is carried in 15 bits
    pub m_bit: bool,

    pub tl0_pic_idx_present: bool,
    pub tl0_pic_idx: u8,

    pub tid_present: bool,
    pub tid: u8,
    pub y: u8,

    pub key_idx_present: bool,
    pub key_idx: u8,

    pub header_size: usize,
    pub is_key_frame: bool,
}

impl Vp8 {
    pub fn unmarshal(payload: &[u8]) -> Result<Self> {
        let len = payload.len();
        if len == 0 {
            return Err(Error::InvalidVp8("empty payload"));
        }

        let mut vp8 = Self {
            first_byte: payload[0],
            ..Self::default()
        };
        let extended = payload[0] & 0x80 != 0;
        let start_of_partition = payload[0] & 0x10 != 0;
        let partition_id = payload[0] & 0x07;

        let mut idx = 1;
        if extended {
            if idx >= len {
                return Err(Error::InvalidVp8("missing extension byte"));
            }
            let x = payload[idx];
            vp8.picture_id_present = x & 0x80 != 0;
            vp8.tl0_pic_idx_present = x & 0x40 != 0;
            vp8.tid_present = x & 0x20 != 0;
            vp8.key_idx_present = x & 0x10 != 0;
            idx += 1;

            if vp8.picture_id_present {
                if idx >= len {
                    return Err(Error::InvalidVp8("missing picture id"));
                }
                vp8.m_bit = payload[idx] & 0x80 != 0;
                if vp8.m_bit {
                    if idx + 1 >= len {
                        return Err(Error::InvalidVp8("truncated 15-bit picture id"));
                    }
                    vp8.picture_id =
                        (u16::from(payload[idx] & 0x7f) << 8) | u16::from(payload[idx + 1]);
                    idx += 2;
                } else {
                    vp8.picture_id = u16::from(payload[idx] & 0x7f);
                    idx += 1;
                }
            }

            if vp8.tl0_pic_idx_present {
                if idx >= len {
                    return Err(Error::InvalidVp8("missing TL0PICIDX"));
                }
                vp8.tl0_pic_idx = payload[idx];
                idx += 1;
            }

            if vp8.tid_present || vp8.key_idx_present {
                if idx >= len {
                    return Err(Error::InvalidVp8("missing TID/KEYIDX"));
                }
                if vp8.tid_present {
                    vp8.tid = (payload[idx] & 0xc0) >> 6;
                    vp8.y = (payload[idx] & 0x20) >> 5;
                }
                if vp8.key_idx_present {
                    vp8.key_idx = payload[idx] & 0x1f;
                }
                idx += 1;
            }
        }

        vp8.header_size = idx;
        // P bit of the VP8 frame header is 0 for key frames
        vp8.is_key_frame =
            start_of_partition && partition_id == 0 && idx < len && payload[idx] & 0x01 == 0;

        Ok(vp8)
    }

    /// Write the descriptor into the front of `buf`, returning bytes written.
    pub fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.header_size {
            return Err(Error::ShortBuffer {
                needed: self.header_size,
                available: buf.len(),
            });
        }

        let mut idx = 0;
        buf[idx] = self.first_byte;
        if self.picture_id_present
            || self.tl0_pic_idx_present
            || self.tid_present
            || self.key_idx_present
        {
            buf[idx] |= 0x80;
            idx += 1;

            let x_pos = idx;
            let mut x = 0u8;
            idx += 1;

            if self.picture_id_present {
                x |= 0x80;
                if self.m_bit {
                    buf[idx] = 0x80 | ((self.picture_id >> 8) & 0x7f) as u8;
                    buf[idx + 1] = (self.picture_id & 0xff) as u8;
                    idx += 2;
                } else {
                    buf[idx] = (self.picture_id & 0x7f) as u8;
                    idx += 1;
                }
            }

            if self.tl0_pic_idx_present {
                x |= 0x40;
                buf[idx] = self.tl0_pic_idx;
                idx += 1;
            }

            if self.tid_present || self.key_idx_present {
                let mut b = 0u8;
                if self.tid_present {
                    x |= 0x20;
                    b |= (self.tid & 0x03) << 6;
                    b |= (self.y & 0x01) << 5;
                }
                if self.key_idx_present {
                    x |= 0x10;
                    b |= self.key_idx & 0x1f;
                }
                buf[idx] = b;
                idx += 1;
            }

            buf[x_pos] = x;
        } else {
            buf[idx] &= 0x7f;
            idx += 1;
        }

        Ok(idx)
    }
}

/// Change in descriptor size when the picture id moves between 7 and 15 bits.
#[must_use]
pub const fn picture_id_size_diff(m_bit_new: bool, m_bit_old: bool) -> isize {
    match (m_bit_new, m_bit_old) {
        (true, false) => 1,
        (false, true) => -1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmarshal_full_descriptor() {
        // X, S, PID 0 | I L T K | M + 15-bit pid | tl0 | tid=2 y=1 keyidx=5 | P=0
        let payload = [0x90, 0xf0, 0x81, 0x23, 0x07, 0xa5, 0x00, 0xaa];
        let vp8 = Vp8::unmarshal(&payload).unwrap();

        assert!(vp8.picture_id_present);
        assert!(vp8.m_bit);
        assert_eq!(vp8.picture_id, 0x0123);
        assert_eq!(vp8.tl0_pic_idx, 7);
        assert_eq!(vp8.tid, 2);
        assert_eq!(vp8.y, 1);
        assert_eq!(vp8.key_idx, 5);
        assert_eq!(vp8.header_size, 6);
        assert!(vp8.is_key_frame);
    }

    #[test]
    fn test_unmarshal_minimal_descriptor() {
        let payload = [0x10, 0x01, 0x02];
        let vp8 = Vp8::unmarshal(&payload).unwrap();
        assert_eq!(vp8.header_size, 1);
        assert!(!vp8.picture_id_present);
        // P bit set, so not a key frame
        assert!(!vp8.is_key_frame);
    }

    #[test]
    fn test_unmarshal_truncated() {
        assert!(Vp8::unmarshal(&[]).is_err());
        assert!(Vp8::unmarshal(&[0x80]).is_err());
        assert!(Vp8::unmarshal(&[0x80, 0x80, 0x80]).is_err());
    }

    #[test]
    fn test_marshal_changes_picture_id_width() {
        let payload = [0x90, 0x80, 0x7f, 0x00];
        let mut vp8 = Vp8::unmarshal(&payload).unwrap();
        assert_eq!(vp8.header_size, 3);

        vp8.picture_id = 200;
        vp8.m_bit = true;
        vp8.header_size = (vp8.header_size as isize + picture_id_size_diff(true, false)) as usize;

        let mut buf = [0u8; 8];
        let n = vp8.marshal_to(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[0x90, 0x80, 0x80, 200]);

        let parsed = Vp8::unmarshal(&buf[..n]).unwrap();
        assert_eq!(parsed.picture_id, 200);
    }

    #[test]
    fn test_marshal_short_buffer() {
        let vp8 = Vp8 {
            header_size: 4,
            ..Vp8::default()
        };
        let mut buf = [0u8; 2];
        assert!(matches!(
            vp8.marshal_to(&mut buf),
            Err(Error::ShortBuffer { needed: 4, .. })
        ));
    }
}
