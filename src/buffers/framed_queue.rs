use tracing::error;
use crate::buffers::ring_buffer::{ring_buffer, RingConsumer, RingProducer};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Every frame is preceded by its length as a u32 in little endian byte order
pub const FRAME_PREFIX_LEN: usize = std::mem::size_of::<u32>();

/// Creates a queue of variable-length frames on top of a ring buffer with the given capacity
///  in bytes. A frame occupies its payload length plus [FRAME_PREFIX_LEN] bytes.
pub fn framed_queue(capacity: usize) -> (FramedProducer, FramedConsumer) {
    let (producer, consumer) = ring_buffer(capacity);
    (FramedProducer { ring: producer }, FramedConsumer { ring: consumer })
}

pub struct FramedProducer {
    ring: RingProducer,
}

impl FramedProducer {
    /// The biggest payload that fits into the queue when it is empty
    pub fn max_payload_len(&self) -> usize {
        self.ring.capacity() - FRAME_PREFIX_LEN - 1
    }

    pub fn used_size(&self) -> usize {
        self.ring.used_size()
    }

    /// Appends a frame. This fails without writing anything if the frame does not fit into the
    ///  currently free space.
    pub fn try_push(&mut self, data: &[u8]) -> bool {
        if data.len() > self.max_payload_len() {
            return false;
        }

        let len: u32 = data.len().prechecked_cast();
        self.ring.try_write(&[&len.to_le_bytes(), data])
    }
}

pub struct FramedConsumer {
    ring: RingConsumer,
}

impl FramedConsumer {
    pub fn used_size(&self) -> usize {
        self.ring.used_size()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Removes the oldest frame, replacing `out`'s content with its payload
    pub fn try_pop(&mut self, out: &mut Vec<u8>) -> bool {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        if !self.ring.peek(0, &mut prefix) {
            return false;
        }
        let len: usize = u32::from_le_bytes(prefix).safe_cast();

        out.clear();
        out.resize(len, 0);
        if !self.ring.peek(FRAME_PREFIX_LEN, out) {
            // frames are published atomically, so a visible prefix always comes with its payload
            error!("framed queue is corrupt: announced frame length {} exceeds readable data", len);
            out.clear();
            return false;
        }

        self.ring.advance(FRAME_PREFIX_LEN + len)
    }
}
