pub mod framed_queue;
pub mod message_pool;
pub mod ring_buffer;
