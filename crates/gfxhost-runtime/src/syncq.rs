//! Completion queue storage
//!
//! A ring of 32-bit words holding one entry per queued submission:
//!
//! ```text
//! [counter, threshold, num_gathers, num_handles, handle...]
//! ```
//!
//! Entries never straddle the end of the ring: whenever fewer than
//! `MIN_ENTRY` words remain after a position, it wraps to 0. One word
//! is always left unused so `read == write` means empty.
//!
//! This type holds no lock; the channel's queue mutex guards it.

use gfxhost_core::CounterId;

/// Header plus one handle
pub const MIN_ENTRY: u32 = 5;

const HEADER: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub counter: CounterId,
    pub threshold: u32,
    pub num_gathers: u32,
    pub num_handles: u32,
}

pub struct SyncQueue {
    buf: Vec<u32>,
    read: u32,
    write: u32,
}

impl SyncQueue {
    pub fn new(words: u32) -> Self {
        debug_assert!(words >= 2 * MIN_ENTRY);
        Self {
            buf: vec![0; words as usize],
            read: 0,
            write: 0,
        }
    }

    fn size(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Handles the next entry can carry; 0 when it must wait.
    pub fn free_space(&self) -> u32 {
        let (read, write, size) = (self.read, self.write, self.size());
        let words = if read > write {
            (read - 1) - write
        } else {
            let tail = size - write;
            if read == 0 {
                tail.saturating_sub(MIN_ENTRY)
            } else {
                tail
            }
        };
        if words < MIN_ENTRY {
            0
        } else {
            words - HEADER
        }
    }

    pub fn add(&mut self, counter: CounterId, threshold: u32, num_gathers: u32, handles: &[u32]) {
        let n = handles.len() as u32;
        debug_assert!(n >= 1 && n <= self.free_space(), "completion entry does not fit");
        let w = self.write as usize;
        self.buf[w] = counter.as_u32();
        self.buf[w + 1] = threshold;
        self.buf[w + 2] = num_gathers;
        self.buf[w + 3] = n;
        self.buf[w + 4..w + 4 + handles.len()].copy_from_slice(handles);

        self.write += HEADER + n;
        if self.write + MIN_ENTRY > self.size() {
            self.write = 0;
        }
    }

    pub fn head(&self) -> Option<EntryHeader> {
        if self.is_empty() {
            return None;
        }
        let r = self.read as usize;
        Some(EntryHeader {
            counter: CounterId::new(self.buf[r]),
            threshold: self.buf[r + 1],
            num_gathers: self.buf[r + 2],
            num_handles: self.buf[r + 3],
        })
    }

    pub fn head_handles(&self) -> &[u32] {
        match self.head() {
            Some(h) => {
                let start = self.read as usize + HEADER as usize;
                &self.buf[start..start + h.num_handles as usize]
            }
            None => &[],
        }
    }

    pub fn dequeue(&mut self) {
        let Some(h) = self.head() else {
            debug_assert!(false, "dequeue from empty completion queue");
            return;
        };
        self.read += HEADER + h.num_handles;
        if self.read + MIN_ENTRY > self.size() {
            self.read = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: CounterId = CounterId::new(7);

    #[test]
    fn test_fifo_order() {
        let mut q = SyncQueue::new(64);
        q.add(ID, 3, 2, &[10, 11]);
        q.add(ID, 5, 1, &[12]);

        assert_eq!(
            q.head(),
            Some(EntryHeader { counter: ID, threshold: 3, num_gathers: 2, num_handles: 2 })
        );
        assert_eq!(q.head_handles(), &[10, 11]);
        q.dequeue();
        assert_eq!(q.head().unwrap().threshold, 5);
        q.dequeue();
        assert!(q.is_empty());
        assert_eq!(q.head(), None);
    }

    #[test]
    fn test_free_space_from_empty() {
        let q = SyncQueue::new(64);
        // 64 words minus the guard entry at the start, minus the header
        assert_eq!(q.free_space(), 64 - MIN_ENTRY - 4);
    }

    #[test]
    fn test_full_queue_reports_zero() {
        let mut q = SyncQueue::new(32);
        let n = q.free_space();
        let handles: Vec<u32> = (0..n).collect();
        q.add(ID, 1, 0, &handles);
        assert_eq!(q.free_space(), 0);
        assert!(!q.is_empty());
        q.dequeue();
        assert!(q.is_empty());
    }

    #[test]
    fn test_wraps_without_straddling() {
        let mut q = SyncQueue::new(20);
        // 4 + 8 = 12 words, 8 left: no wrap yet
        q.add(ID, 1, 1, &[0; 8]);
        q.dequeue();
        // read = write = 12; tail of 8 words holds 4 handles
        assert_eq!(q.free_space(), 4);
        q.add(ID, 2, 1, &[1, 2, 3, 4]);
        // 20 - 20 < MIN_ENTRY, so write wrapped
        assert_eq!(q.write, 0);
        assert_eq!(q.free_space(), (12 - 1) - HEADER);
        q.add(ID, 3, 0, &[9]);
        q.dequeue();
        assert_eq!(q.read, 0);
        assert_eq!(q.head().unwrap().threshold, 3);
        assert_eq!(q.head_handles(), &[9]);
    }

    #[test]
    fn test_reset() {
        let mut q = SyncQueue::new(32);
        q.add(ID, 1, 1, &[1]);
        q.reset();
        assert!(q.is_empty());
    }
}
