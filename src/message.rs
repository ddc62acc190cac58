//! Messages travel from the network thread to the application thread through a framed queue.
//!  A message bigger than the queue's chunk size is split into several frames, the first of
//!  them announcing the total length. Messages that do not fit into the queue are kept in an
//!  unbounded backlog on the network thread and retried on the next tick, so the network thread
//!  never blocks on a slow application thread.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, trace};
use crate::buffers::framed_queue::{framed_queue, FramedConsumer, FramedProducer, FRAME_PREFIX_LEN};
use crate::ids::{PeerId, SocketId};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// A received packet or transport event, or a synthesized event for a connection that failed
///  before the transport was involved. The first payload byte is the message tag.
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    pub peer_id: PeerId,
    pub socket_id: Option<SocketId>,
    pub remote: Option<SocketAddr>,
    pub payload: Bytes,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{{:?}/{:?}@{:?}: tag {:?}, {} bytes}}", self.peer_id, self.socket_id, self.remote, self.tag(), self.payload.len())
    }
}

impl Message {
    pub fn tag(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.peer_id.raw());
        match self.socket_id {
            Some(socket_id) => {
                buf.put_u8(1);
                buf.put_u32(socket_id.raw());
            }
            None => buf.put_u8(0),
        }
        match &self.remote {
            None => buf.put_u8(0),
            Some(SocketAddr::V4(data)) => {
                buf.put_u8(4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            Some(SocketAddr::V6(data)) => {
                buf.put_u8(6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
        buf.put_slice(&self.payload);
    }

    pub fn try_deser(mut buf: Bytes) -> anyhow::Result<Message> {
        let peer_id = PeerId::from_raw(buf.try_get_u32()?);
        let socket_id = match buf.try_get_u8()? {
            0 => None,
            1 => Some(SocketId::from_raw(buf.try_get_u32()?)),
            n => return Err(anyhow!("invalid socket id discriminator: {}", n)),
        };
        let remote = match buf.try_get_u8()? {
            0 => None,
            4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                Some(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)))
            }
            6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                Some(SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0)))
            }
            n => return Err(anyhow!("invalid socket address discriminator: {}", n)),
        };

        Ok(Message {
            peer_id,
            socket_id,
            remote,
            payload: buf,
        })
    }
}

pub fn message_channel(capacity: usize) -> (MessageSender, MessageReceiver) {
    let (producer, consumer) = framed_queue(capacity);
    let chunk_len = (capacity / 4)
        .max(2 * FRAME_PREFIX_LEN)
        .min(producer.max_payload_len());

    let sender = MessageSender {
        producer,
        backlog: VecDeque::new(),
        chunk_len,
        buf: BytesMut::new(),
    };
    let receiver = MessageReceiver {
        consumer,
        chunk: Vec::new(),
        partial: Vec::new(),
        expected_len: None,
    };
    (sender, receiver)
}

pub struct MessageSender {
    producer: FramedProducer,
    /// chunks that did not fit into the queue, in the order they were sent
    backlog: VecDeque<Bytes>,
    chunk_len: usize,
    buf: BytesMut,
}

impl MessageSender {
    pub fn send(&mut self, message: &Message) {
        trace!("queueing {:?}", message);

        self.buf.clear();
        self.buf.put_u32_le(0);
        message.ser(&mut self.buf);
        let total_len: u32 = (self.buf.len() - FRAME_PREFIX_LEN).prechecked_cast();
        self.buf[..FRAME_PREFIX_LEN].copy_from_slice(&total_len.to_le_bytes());

        let mut data = self.buf.split().freeze();
        while !data.is_empty() {
            let chunk = data.split_to(self.chunk_len.min(data.len()));
            if !self.backlog.is_empty() || !self.producer.try_push(&chunk) {
                self.backlog.push_back(chunk);
            }
        }
    }

    /// Moves as many buffered chunks to the queue as fit, preserving their order
    pub fn flush_backlog(&mut self) {
        while let Some(chunk) = self.backlog.front() {
            if !self.producer.try_push(chunk) {
                trace!("{} chunks remaining in message backlog", self.backlog.len());
                return;
            }
            self.backlog.pop_front();
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

pub struct MessageReceiver {
    consumer: FramedConsumer,
    chunk: Vec<u8>,
    partial: Vec<u8>,
    /// the announced length of a message that was not received completely yet
    expected_len: Option<usize>,
}

impl MessageReceiver {
    /// Returns the next complete message. If only part of a message's chunks are available, they
    ///  are kept until the remaining chunks arrive.
    pub fn try_recv(&mut self) -> Option<Message> {
        while self.consumer.try_pop(&mut self.chunk) {
            let expected_len = match self.expected_len {
                Some(len) => {
                    self.partial.extend_from_slice(&self.chunk);
                    len
                }
                None => {
                    if self.chunk.len() < FRAME_PREFIX_LEN {
                        error!("message chunk of {} bytes is too short for a length prefix - skipping", self.chunk.len());
                        continue;
                    }
                    let mut prefix = [0u8; FRAME_PREFIX_LEN];
                    prefix.copy_from_slice(&self.chunk[..FRAME_PREFIX_LEN]);
                    let len: usize = u32::from_le_bytes(prefix).safe_cast();

                    self.partial.clear();
                    self.partial.extend_from_slice(&self.chunk[FRAME_PREFIX_LEN..]);
                    self.expected_len = Some(len);
                    len
                }
            };

            if self.partial.len() < expected_len {
                continue;
            }
            self.expected_len = None;

            if self.partial.len() > expected_len {
                error!("message chunks exceed the announced length of {} bytes - skipping", expected_len);
                continue;
            }

            match Message::try_deser(Bytes::copy_from_slice(&self.partial)) {
                Ok(message) => return Some(message),
                Err(e) => error!("error deserializing message: {}", e),
            }
        }
        None
    }
}
