use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed-capacity circular byte store shared by exactly one writer and one reader. The two
///  halves are handed out by [ring_buffer], and since all mutating operations take `&mut self`,
///  the type system guarantees single producer / single consumer.
///
/// Cursors are kept in `[0, capacity)`. The writer never fills the buffer completely (a write
///  must leave `used + len < capacity`), so `read == write` unambiguously means 'empty'.
///
///  NB: The writer publishes a write by storing the write cursor with `Release` after copying
///       all bytes, and the reader acknowledges consumption by storing the read cursor with
///       `Release` after copying out. Each side loads the other side's cursor with `Acquire`.
///       That is the complete synchronization protocol, there are no locks involved.
struct RingShared {
    buf: Box<[UnsafeCell<u8>]>,
    read: AtomicUsize,
    write: AtomicUsize,
}

// Producer and consumer only ever touch disjoint regions of `buf`, separated by the cursors
unsafe impl Sync for RingShared {}
unsafe impl Send for RingShared {}

impl RingShared {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn used(&self, read: usize, write: usize) -> usize {
        if write >= read {
            write - read
        }
        else {
            write + (self.capacity() - read)
        }
    }

    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buf.as_ptr())
    }

    /// copies `data` into the buffer starting at `offs`, wrapping around at the end of the buffer
    ///
    /// SAFETY: the caller must own the region `[offs, offs + data.len())` (modulo capacity)
    unsafe fn copy_in(&self, offs: usize, data: &[u8]) {
        let first_len = data.len().min(self.capacity() - offs);
        ptr::copy_nonoverlapping(data.as_ptr(), self.base_ptr().add(offs), first_len);
        if first_len < data.len() {
            ptr::copy_nonoverlapping(data[first_len..].as_ptr(), self.base_ptr(), data.len() - first_len);
        }
    }

    /// SAFETY: the caller must own the region `[offs, offs + out.len())` (modulo capacity)
    unsafe fn copy_out(&self, offs: usize, out: &mut [u8]) {
        let first_len = out.len().min(self.capacity() - offs);
        ptr::copy_nonoverlapping(self.base_ptr().add(offs), out.as_mut_ptr(), first_len);
        if first_len < out.len() {
            let remaining = out.len() - first_len;
            ptr::copy_nonoverlapping(self.base_ptr(), out[first_len..].as_mut_ptr(), remaining);
        }
    }
}

/// Creates a ring buffer with the given capacity in bytes, returning its writing and its
///  reading half.
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring buffer capacity must not be zero");

    let buf = (0..capacity)
        .map(|_| UnsafeCell::new(0u8))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(RingShared {
        buf,
        read: AtomicUsize::new(0),
        write: AtomicUsize::new(0),
    });

    (RingProducer { shared: shared.clone() }, RingConsumer { shared })
}

pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn used_size(&self) -> usize {
        let read = self.shared.read.load(Ordering::Acquire);
        let write = self.shared.write.load(Ordering::Relaxed);
        self.shared.used(read, write)
    }

    /// Writes the concatenation of all `parts`, or nothing at all if it does not fit. The write
    ///  becomes visible to the consumer as a whole.
    pub fn try_write(&mut self, parts: &[&[u8]]) -> bool {
        let total_len: usize = parts.iter().map(|p| p.len()).sum();

        let read = self.shared.read.load(Ordering::Acquire);
        let write = self.shared.write.load(Ordering::Relaxed);
        if self.shared.used(read, write) + total_len >= self.capacity() {
            return false;
        }

        let mut offs = write;
        for part in parts {
            // SAFETY: the free region starts at `write` and is bigger than `total_len`, and the
            //  consumer does not read beyond the published write cursor
            unsafe { self.shared.copy_in(offs, part); }
            offs = (offs + part.len()) % self.capacity();
        }

        self.shared.write.store(offs, Ordering::Release);
        true
    }
}

pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn used_size(&self) -> usize {
        let read = self.shared.read.load(Ordering::Relaxed);
        let write = self.shared.write.load(Ordering::Acquire);
        self.shared.used(read, write)
    }

    pub fn is_empty(&self) -> bool {
        self.used_size() == 0
    }

    /// Copies `out.len()` bytes, starting `offset` bytes after the read cursor, without consuming
    ///  them. Returns `false` and leaves `out` untouched if there is not enough readable data.
    pub fn peek(&self, offset: usize, out: &mut [u8]) -> bool {
        let read = self.shared.read.load(Ordering::Relaxed);
        let write = self.shared.write.load(Ordering::Acquire);
        if self.shared.used(read, write) < offset + out.len() {
            return false;
        }

        // SAFETY: the region is inside the published part of the buffer, and the producer does
        //  not write there before the read cursor moves past it
        unsafe { self.shared.copy_out((read + offset) % self.capacity(), out); }
        true
    }

    /// Consumes `len` bytes, making room for the producer
    pub fn advance(&mut self, len: usize) -> bool {
        let read = self.shared.read.load(Ordering::Relaxed);
        let write = self.shared.write.load(Ordering::Acquire);
        if self.shared.used(read, write) < len {
            return false;
        }

        self.shared.read.store((read + len) % self.capacity(), Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_empty() {
        let (p, c) = ring_buffer(16);
        assert_eq!(p.capacity(), 16);
        assert_eq!(p.used_size(), 0);
        assert!(c.is_empty());

        let mut out = [0u8; 1];
        assert!(!c.peek(0, &mut out));
    }

    #[rstest]
    #[case::fits(16, 0, 15, true)]
    #[case::exactly_full(16, 0, 16, false)]
    #[case::partially_used_fits(16, 10, 5, true)]
    #[case::partially_used_full(16, 10, 6, false)]
    #[case::empty_write(16, 15, 0, true)]
    fn test_capacity_rule(#[case] capacity: usize, #[case] pre_filled: usize, #[case] len: usize, #[case] expected: bool) {
        let (mut p, _c) = ring_buffer(capacity);
        assert!(p.try_write(&[&vec![1u8; pre_filled]]));
        assert_eq!(p.try_write(&[&vec![2u8; len]]), expected);
        assert_eq!(p.used_size(), if expected { pre_filled + len } else { pre_filled });
    }

    #[test]
    fn test_failed_write_is_not_partial() {
        let (mut p, c) = ring_buffer(8);
        assert!(!p.try_write(&[&[1, 2, 3], &[4, 5, 6, 7, 8]]));
        assert!(c.is_empty());
    }

    #[test]
    fn test_parts_are_concatenated() {
        let (mut p, mut c) = ring_buffer(16);
        assert!(p.try_write(&[&[1, 2], &[], &[3, 4, 5]]));
        assert_eq!(c.used_size(), 5);

        let mut out = [0u8; 5];
        assert!(c.peek(0, &mut out));
        assert_eq!(out, [1, 2, 3, 4, 5]);

        let mut out = [0u8; 2];
        assert!(c.peek(3, &mut out));
        assert_eq!(out, [4, 5]);
        assert!(!c.peek(4, &mut out));

        assert!(c.advance(5));
        assert!(c.is_empty());
        assert!(!c.advance(1));
    }

    #[test]
    fn test_wraparound() {
        let (mut p, mut c) = ring_buffer(10);
        assert!(p.try_write(&[&[0, 0, 0, 0, 0, 0, 0]]));
        assert!(c.advance(7));

        // write cursor at 7: this write is split at the buffer boundary
        assert!(p.try_write(&[&[1, 2, 3, 4, 5, 6]]));
        assert_eq!(p.used_size(), 6);
        assert_eq!(c.used_size(), 6);

        let mut out = [0u8; 6];
        assert!(c.peek(0, &mut out));
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);

        let mut out = [0u8; 3];
        assert!(c.peek(2, &mut out));
        assert_eq!(out, [3, 4, 5]);

        assert!(c.advance(6));
        assert!(c.is_empty());
        assert_eq!(p.used_size(), 0);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        const NUM_CHUNKS: usize = 10_000;

        let (mut p, mut c) = ring_buffer(97);

        let producer = std::thread::spawn(move || {
            for i in 0..NUM_CHUNKS {
                let chunk = [(i % 251) as u8; 7];
                while !p.try_write(&[&chunk]) {
                    std::thread::yield_now();
                }
            }
        });

        let mut out = [0u8; 7];
        for i in 0..NUM_CHUNKS {
            while !c.peek(0, &mut out) {
                std::thread::yield_now();
            }
            assert_eq!(out, [(i % 251) as u8; 7]);
            assert!(c.advance(7));
        }

        producer.join().unwrap();
        assert!(c.is_empty());
    }
}
