//! Everything that travels from the application thread to the network thread: control
//!  [Command]s through a framed queue, and payloads to send through an [OutboundSender].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, trace};
use crate::buffers::framed_queue::{framed_queue, FramedConsumer, FramedProducer};
use crate::config::DISCOVERY_NAME_LEN;
use crate::ids::{PeerId, SocketId};
use crate::message_types::ClientRole;
use crate::safe_converter::PrecheckedCast;
use crate::transport::{Priority, Reliability};

/// Longest host name or address that an [Command::Open] can carry
pub const MAX_ADDRESS_LEN: usize = 255;

/// What a peer answering discovery pings sends back
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveryDescriptor {
    pub name: [u8; DISCOVERY_NAME_LEN],
    pub role: ClientRole,
}

impl DiscoveryDescriptor {
    pub const SERIALIZED_LEN: usize = DISCOVERY_NAME_LEN + 1;

    /// NB: names longer than [DISCOVERY_NAME_LEN] bytes are truncated, shorter names are padded
    ///      with zeros
    pub fn new(name: &str, role: ClientRole) -> DiscoveryDescriptor {
        let mut raw = [0u8; DISCOVERY_NAME_LEN];
        let len = name.len().min(DISCOVERY_NAME_LEN);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        DiscoveryDescriptor { name: raw, role }
    }

    pub fn name(&self) -> String {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DISCOVERY_NAME_LEN);
        String::from_utf8_lossy(&self.name[..len]).to_string()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.name);
        buf.put_u8(self.role.into());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<DiscoveryDescriptor> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("discovery descriptor is truncated");
        }
        let mut name = [0u8; DISCOVERY_NAME_LEN];
        buf.copy_to_slice(&mut name);
        let role = ClientRole::try_from_primitive(buf.try_get_u8()?)?;
        Ok(DiscoveryDescriptor { name, role })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// open an outgoing connection from a new peer
    Open { peer_id: PeerId, socket_id: SocketId, address: String, port: u16 },
    /// start listening for incoming connections on a new peer
    Accept { peer_id: PeerId, port: u16, max_connections: u16 },
    /// answer discovery pings on a new peer
    DiscoveryResponse { peer_id: PeerId, port: u16, descriptor: DiscoveryDescriptor },
    /// release a connection (if a socket id is given) or the listener / discovery registration
    ///  of a peer, closing the peer when nothing references it any more
    RemovePeerReference { peer_id: PeerId, socket_id: Option<SocketId> },
    /// close a connection that is still referenced
    Close { peer_id: PeerId, socket_id: SocketId },
}

const ID_OPEN: u8 = 1;
const ID_ACCEPT: u8 = 2;
const ID_DISCOVERY_RESPONSE: u8 = 3;
const ID_REMOVE_PEER_REFERENCE: u8 = 4;
const ID_CLOSE: u8 = 5;

impl Command {
    fn id(&self) -> u8 {
        match self {
            Command::Open { .. } => ID_OPEN,
            Command::Accept { .. } => ID_ACCEPT,
            Command::DiscoveryResponse { .. } => ID_DISCOVERY_RESPONSE,
            Command::RemovePeerReference { .. } => ID_REMOVE_PEER_REFERENCE,
            Command::Close { .. } => ID_CLOSE,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            Command::Open { peer_id, .. } => *peer_id,
            Command::Accept { peer_id, .. } => *peer_id,
            Command::DiscoveryResponse { peer_id, .. } => *peer_id,
            Command::RemovePeerReference { peer_id, .. } => *peer_id,
            Command::Close { peer_id, .. } => *peer_id,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id());
        buf.put_u32(self.peer_id().raw());

        match self {
            Command::Open { socket_id, address, port, .. } => {
                buf.put_u32(socket_id.raw());
                buf.put_u16(*port);
                let len = address.len().min(MAX_ADDRESS_LEN);
                buf.put_u8(len.prechecked_cast());
                buf.put_slice(&address.as_bytes()[..len]);
            }
            Command::Accept { port, max_connections, .. } => {
                buf.put_u16(*port);
                buf.put_u16(*max_connections);
            }
            Command::DiscoveryResponse { port, descriptor, .. } => {
                buf.put_u16(*port);
                descriptor.ser(buf);
            }
            Command::RemovePeerReference { socket_id, .. } => {
                match socket_id {
                    Some(socket_id) => {
                        buf.put_u8(1);
                        buf.put_u32(socket_id.raw());
                    }
                    None => buf.put_u8(0),
                }
            }
            Command::Close { socket_id, .. } => {
                buf.put_u32(socket_id.raw());
            }
        }
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<Command> {
        let id = buf.try_get_u8()?;
        let peer_id = PeerId::from_raw(buf.try_get_u32()?);

        let command = match id {
            ID_OPEN => {
                let socket_id = SocketId::from_raw(buf.try_get_u32()?);
                let port = buf.try_get_u16()?;
                let len = buf.try_get_u8()? as usize;
                if buf.remaining() < len {
                    bail!("address is truncated");
                }
                let address = String::from_utf8(buf[..len].to_vec())?;
                buf.advance(len);
                Command::Open { peer_id, socket_id, address, port }
            }
            ID_ACCEPT => {
                let port = buf.try_get_u16()?;
                let max_connections = buf.try_get_u16()?;
                Command::Accept { peer_id, port, max_connections }
            }
            ID_DISCOVERY_RESPONSE => {
                let port = buf.try_get_u16()?;
                let descriptor = DiscoveryDescriptor::try_deser(&mut buf)?;
                Command::DiscoveryResponse { peer_id, port, descriptor }
            }
            ID_REMOVE_PEER_REFERENCE => {
                let socket_id = match buf.try_get_u8()? {
                    0 => None,
                    1 => Some(SocketId::from_raw(buf.try_get_u32()?)),
                    b => return Err(anyhow!("invalid value for an optional socket id: {}", b)),
                };
                Command::RemovePeerReference { peer_id, socket_id }
            }
            ID_CLOSE => {
                let socket_id = SocketId::from_raw(buf.try_get_u32()?);
                Command::Close { peer_id, socket_id }
            }
            id => return Err(anyhow!("invalid command discriminator {}", id)),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after command", buf.remaining());
        }
        Ok(command)
    }
}

pub fn command_channel(capacity: usize, wake: Arc<Notify>) -> (CommandSender, CommandReceiver) {
    let (producer, consumer) = framed_queue(capacity);
    let is_closed = Arc::new(AtomicBool::new(false));
    let sender = CommandSender {
        inner: Arc::new(CommandSenderInner {
            producer: Mutex::new(producer),
            wake,
            is_closed: is_closed.clone(),
        }),
    };
    let receiver = CommandReceiver {
        consumer,
        buf: Vec::new(),
        is_closed,
    };
    (sender, receiver)
}

struct CommandSenderInner {
    /// Commands are normally sent from the application thread only, but releasing a connection
    ///  handle sends a command from whatever thread drops it. The mutex keeps the queue's
    ///  producer side single-threaded.
    producer: Mutex<FramedProducer>,
    wake: Arc<Notify>,
    /// set when the receiver is gone, so that a sender waiting for room gives up
    is_closed: Arc<AtomicBool>,
}

/// The sending side of the command queue. Sending never fails: if the queue is full, the sender
///  yields and retries until the network thread made room.
#[derive(Clone)]
pub struct CommandSender {
    inner: Arc<CommandSenderInner>,
}

impl CommandSender {
    pub fn send(&self, command: Command) {
        if self.inner.is_closed.load(Ordering::Acquire) {
            debug!("network thread is shut down - discarding {:?}", command);
            return;
        }

        let mut buf = BytesMut::new();
        command.ser(&mut buf);

        {
            let mut producer = self.inner.producer.lock().unwrap();
            while !producer.try_push(&buf) {
                if self.inner.is_closed.load(Ordering::Acquire) {
                    debug!("network thread is shut down - discarding {:?}", command);
                    return;
                }
                std::thread::yield_now();
            }
        }
        trace!("sent command {:?}", command);

        self.inner.wake.notify_one();
    }

    /// Called when the network thread terminates: commands sent afterwards are discarded
    pub fn close(&self) {
        self.inner.is_closed.store(true, Ordering::Release);
    }
}

/// The network thread's end of the command queue. Dropping it closes the queue, whichever way
///  the network thread terminates.
pub struct CommandReceiver {
    consumer: FramedConsumer,
    buf: Vec<u8>,
    is_closed: Arc<AtomicBool>,
}

impl Drop for CommandReceiver {
    fn drop(&mut self) {
        debug!("command receiver released - closing the command queue");
        self.is_closed.store(true, Ordering::Release);
    }
}

impl CommandReceiver {
    pub fn try_recv(&mut self) -> Option<Command> {
        while self.consumer.try_pop(&mut self.buf) {
            match Command::try_deser(&self.buf) {
                Ok(command) => return Some(command),
                Err(e) => error!("error deserializing command: {}", e),
            }
        }
        None
    }
}

/// A payload that the application thread hands to the network thread for sending
#[derive(Debug)]
pub struct OutboundPacket {
    pub socket_id: SocketId,
    pub payload: Bytes,
    pub priority: Priority,
    pub reliability: Reliability,
    pub channel: u8,
}

#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<OutboundPacket>,
    wake: Arc<Notify>,
}

impl OutboundSender {
    pub fn new(tx: mpsc::UnboundedSender<OutboundPacket>, wake: Arc<Notify>) -> OutboundSender {
        OutboundSender { tx, wake }
    }

    pub fn send(&self, packet: OutboundPacket) {
        if let Err(e) = self.tx.send(packet) {
            debug!("network thread is shut down - discarding outbound packet for {:?}", e.0.socket_id);
            return;
        }
        self.wake.notify_one();
    }
}
