use bytes::Bytes;

/// Fixed-size packet store indexed by extended sequence number.
///
/// Sequence numbers are unwrapped against the newest one stored, so slots
/// stay distinct across the 16-bit wrap.
pub(crate) struct Bucket {
    slots: Vec<Option<(u16, Bytes)>>,
    head: Option<(u16, u64)>,
}

impl Bucket {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            head: None,
        }
    }

    fn unwrap_sn(&self, sn: u16) -> Option<u64> {
        let (head_sn, head_ext) = self.head?;
        let diff = i64::from(sn.wrapping_sub(head_sn) as i16);
        u64::try_from(head_ext as i64 + diff).ok()
    }

    pub(crate) fn add(&mut self, sn: u16, data: Bytes) {
        let ext = match self.unwrap_sn(sn) {
            Some(ext) => ext,
            None => {
                // start one cycle in so early out-of-order packets unwrap cleanly
                let ext = (1 << 16) + u64::from(sn);
                self.head = Some((sn, ext));
                ext
            }
        };

        let (_, head_ext) = self.head.unwrap_or((sn, ext));
        if ext > head_ext {
            self.head = Some((sn, ext));
        } else if head_ext - ext >= self.slots.len() as u64 {
            // older than anything the ring can hold
            return;
        }

        let idx = (ext % self.slots.len() as u64) as usize;
        self.slots[idx] = Some((sn, data));
    }

    pub(crate) fn get(&self, sn: u16) -> Option<&Bytes> {
        let ext = self.unwrap_sn(sn)?;
        let (_, head_ext) = self.head?;
        if ext > head_ext || head_ext - ext >= self.slots.len() as u64 {
            return None;
        }

        let idx = (ext % self.slots.len() as u64) as usize;
        match &self.slots[idx] {
            Some((stored, data)) if *stored == sn => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get_across_wrap() {
        let mut bucket = Bucket::new(8);
        for sn in [65533u16, 65534, 65535, 0, 1, 2] {
            bucket.add(sn, Bytes::from(vec![sn as u8]));
        }
        assert_eq!(bucket.get(65534).unwrap()[0], 65534u16 as u8);
        assert_eq!(bucket.get(2).unwrap()[0], 2);
        assert!(bucket.get(3).is_none());
    }

    #[test]
    fn test_old_packets_are_evicted() {
        let mut bucket = Bucket::new(4);
        for sn in 10u16..20 {
            bucket.add(sn, Bytes::from_static(b"x"));
        }
        assert!(bucket.get(15).is_none());
        assert!(bucket.get(16).is_some());
        assert!(bucket.get(19).is_some());

        // too old to be stored at all
        bucket.add(12, Bytes::from_static(b"late"));
        assert!(bucket.get(12).is_none());
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut bucket = Bucket::new(16);
        bucket.add(100, Bytes::from_static(b"a"));
        bucket.add(102, Bytes::from_static(b"c"));
        bucket.add(101, Bytes::from_static(b"b"));
        assert_eq!(bucket.get(101).unwrap().as_ref(), b"b");
        assert_eq!(bucket.get(102).unwrap().as_ref(), b"c");
    }
}
