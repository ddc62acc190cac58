use std::sync::Mutex;
use bytes::BytesMut;
use tracing::{debug, trace};

/// Recycles the buffers that outgoing messages are written into, so that steady-state sending
///  does not allocate
pub struct MessagePool {
    buf_capacity: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl MessagePool {
    pub fn new(buf_capacity: usize, max_pool_size: usize) -> MessagePool {
        MessagePool {
            buf_capacity,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_capacity)
    }

    /// NB: Buffers that grew beyond the regular capacity are discarded rather than pooled, so
    ///      that a single huge message does not pin its memory
    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() > 2 * self.buf_capacity {
            debug!("returned buffer grew to {} bytes: discarding it", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
