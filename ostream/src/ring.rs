//! Ring-buffer substate of the output stream.
//!
//! A `head`/`tail` offset pair plus a `full` flag encode a circular byte
//! queue over the whole allocation, so no slot is wasted on empty/full
//! disambiguation. `head` is the first unsent byte, `tail` the first
//! unused one.

#![allow(clippy::arithmetic_side_effects)]

use crate::pool::Pool;

pub(crate) struct Ring {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    full: bool,
    max_size: usize,
}

impl Ring {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            head: 0,
            tail: 0,
            full: false,
            max_size,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail && !self.full
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub(crate) fn unused_space(&self) -> usize {
        if self.head > self.tail {
            // XXXT...HXXX
            self.head - self.tail
        } else if self.head < self.tail {
            // ...HXXXT...
            (self.buf.len() - self.tail) + self.head
        } else if self.full {
            0
        } else {
            self.buf.len()
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.buf.len() - self.unused_space()
    }

    /// The used region as up to two contiguous slices, transmission order.
    /// The second slice is empty unless the region wraps.
    pub(crate) fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.is_empty() {
            (&[], &[])
        } else if self.head < self.tail {
            (&self.buf[self.head..self.tail], &[])
        } else {
            (&self.buf[self.head..], &self.buf[..self.tail])
        }
    }

    /// Drops `size` transmitted bytes from the front of the used region.
    /// Offsets are normalized back to zero whenever the buffer drains so
    /// the next append is a single copy.
    pub(crate) fn advance_head(&mut self, size: usize) {
        if self.is_empty() || size == 0 {
            return;
        }

        if self.head < self.tail {
            debug_assert!(size <= self.tail - self.head);
            self.head += size;
        } else {
            let leading = self.buf.len() - self.head;
            if size > leading {
                debug_assert!(size - leading <= self.tail);
                self.head = size - leading;
            } else {
                self.head += size;
            }
            self.full = false;
        }

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
        if self.head == self.buf.len() {
            self.head = 0;
        }
    }

    /// Copies as much of `data` as fits, growing the allocation first when
    /// the policy allows it. Returns the number of bytes taken.
    pub(crate) fn append(
        &mut self,
        data: &[u8],
        pool: &dyn Pool,
        optimal_block_size: usize,
        corked: bool,
    ) -> usize {
        let unused = self.unused_space();
        if unused < data.len() {
            self.grow(data.len() - unused, pool, optimal_block_size, corked);
        }

        let mut taken = 0;
        // at most two copies: up to the end of the allocation, then the wrap
        for _ in 0..2 {
            if taken == data.len() || self.full {
                break;
            }
            let room = if self.tail >= self.head {
                self.buf.len() - self.tail
            } else {
                self.head - self.tail
            };
            let count = room.min(data.len() - taken);
            if count == 0 {
                break;
            }
            self.buf[self.tail..self.tail + count].copy_from_slice(&data[taken..taken + count]);
            taken += count;

            self.tail += count;
            if self.tail == self.buf.len() {
                self.tail = 0;
            }
            if self.head == self.tail {
                self.full = true;
            }
        }
        taken
    }

    /// Grows the allocation by at least `bytes` if the max-size cap allows.
    /// While corked the size is biased up toward the optimal block size so
    /// the eventual uncork flush is one full kernel write.
    pub(crate) fn grow(
        &mut self,
        bytes: usize,
        pool: &dyn Pool,
        optimal_block_size: usize,
        corked: bool,
    ) {
        let old_size = self.buf.len();
        let mut size = pool.exp_grown_size(old_size, old_size + bytes);
        if size > self.max_size {
            size = self.max_size;
        } else if corked {
            let biased = optimal_block_size.min(self.max_size);
            if biased > size {
                size = biased;
            }
        }

        if size <= old_size {
            return;
        }

        let was_empty = self.is_empty();
        self.buf.resize(size, 0);
        if self.tail <= self.head && !was_empty {
            // wrapped layout: slide the leading segment [head, old) to the
            // new end so the used region stays contiguous-in-order
            let leading = old_size - self.head;
            self.buf.copy_within(self.head..old_size, size - leading);
            self.head = size - leading;
        }
        self.full = false;
    }

    /// Whole allocation as scratch space. Only valid while the ring is
    /// empty; used by the backward-overlap copy to stage reads.
    pub(crate) fn scratch_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.is_empty());
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::pool::SystemPool,
    };

    const OPTIMAL: usize = 4096;

    fn ring(max: usize) -> Ring {
        Ring::new(max)
    }

    fn append(r: &mut Ring, data: &[u8]) -> usize {
        r.append(data, &SystemPool, OPTIMAL, false)
    }

    fn used_bytes(r: &Ring) -> Vec<u8> {
        let (a, b) = r.as_slices();
        let mut v = a.to_vec();
        v.extend_from_slice(b);
        v
    }

    #[test]
    fn starts_empty_and_unallocated() {
        let r = ring(64);
        assert!(r.is_empty());
        assert_eq!(r.capacity(), 0);
        assert_eq!(r.unused_space(), 0);
        assert_eq!(r.as_slices(), (&[][..], &[][..]));
    }

    #[test]
    fn append_then_drain() {
        let mut r = ring(64);
        assert_eq!(append(&mut r, b"hello"), 5);
        assert_eq!(r.used(), 5);
        assert_eq!(used_bytes(&r), b"hello");

        r.advance_head(5);
        assert!(r.is_empty());
        // offsets normalize back to zero on drain
        assert_eq!(r.as_slices().0.len(), 0);
    }

    #[test]
    fn wraps_and_reports_two_slices() {
        let mut r = ring(8);
        // force exactly 8 bytes of capacity
        assert_eq!(append(&mut r, &[0u8; 8]), 8);
        assert_eq!(r.capacity(), 8);
        r.advance_head(8);

        // leave head in the middle, then wrap the tail past the end
        assert_eq!(append(&mut r, b"abcdef"), 6);
        r.advance_head(4);
        assert_eq!(append(&mut r, b"ghij"), 4);

        let (first, second) = r.as_slices();
        assert_eq!(first, b"efgh");
        assert_eq!(second, b"ij");
        assert_eq!(used_bytes(&r), b"efghij");
    }

    #[test]
    fn full_flag_disambiguates() {
        let mut r = ring(8);
        assert_eq!(append(&mut r, &[1u8; 8]), 8);
        assert!(!r.is_empty());
        assert_eq!(r.unused_space(), 0);
        // head == tail but full
        assert_eq!(r.used(), 8);

        r.advance_head(3);
        assert_eq!(r.unused_space(), 3);
        assert_eq!(append(&mut r, &[2u8; 3]), 3);
        assert_eq!(r.unused_space(), 0);
        assert_eq!(used_bytes(&r), [[1u8; 5].as_slice(), [2u8; 3].as_slice()].concat());
    }

    #[test]
    fn append_stops_at_max_size() {
        let mut r = ring(4);
        assert_eq!(append(&mut r, b"abcdef"), 4);
        assert_eq!(used_bytes(&r), b"abcd");
        assert_eq!(append(&mut r, b"x"), 0);
    }

    #[test]
    fn zero_max_size_refuses_everything() {
        let mut r = ring(0);
        assert_eq!(append(&mut r, b"abc"), 0);
        assert!(r.is_empty());
        assert_eq!(r.capacity(), 0);
    }

    #[test]
    fn grow_relocates_wrapped_tail() {
        let mut r = ring(256);
        assert_eq!(append(&mut r, &[0u8; 64]), 64);
        assert_eq!(r.capacity(), 64);

        // head near the end, tail wrapped: used region spans the seam
        r.advance_head(60);
        assert_eq!(append(&mut r, &[1u8; 8]), 8);
        assert_eq!(r.used(), 12);

        // growth must slide the leading segment to the new end and keep
        // byte order intact
        assert_eq!(append(&mut r, &[2u8; 56]), 56);
        assert_eq!(r.capacity(), 128);
        let mut expect = vec![0u8; 4];
        expect.extend_from_slice(&[1u8; 8]);
        expect.extend_from_slice(&[2u8; 56]);
        assert_eq!(used_bytes(&r), expect);
    }

    #[test]
    fn corked_growth_biases_toward_optimal() {
        let mut r = ring(1 << 20);
        assert_eq!(r.append(b"x", &SystemPool, 8192, true), 1);
        assert!(r.capacity() >= 8192);
    }

    #[test]
    fn advance_over_the_seam() {
        let mut r = ring(8);
        assert_eq!(append(&mut r, &[0u8; 8]), 8);
        r.advance_head(6);
        assert_eq!(append(&mut r, b"abcd"), 4);
        // used region is [6..8) + [0..4)
        r.advance_head(3);
        assert_eq!(used_bytes(&r), b"bcd");
        r.advance_head(3);
        assert!(r.is_empty());
    }
}
