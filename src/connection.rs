use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, warn};
use crate::command::{Command, CommandSender, OutboundPacket, OutboundSender};
use crate::ids::{PeerId, SocketId};
use crate::message_types::{to_transport_priority, to_transport_reliability, MessageChannel, MessagePriority, MessageReliability};

/// A connection's status only ever moves forward in this order, though states can be skipped
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
pub enum ConnectionStatus {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailureReason {
    Unknown,
    CannotConnect,
    AlreadyConnected,
    MaxConnectionsReached,
}

/// Receives a connection's status changes and messages. Messages are delivered twice: first
///  to [ConnectionListener::on_message_received_async] on the network thread as soon as they
///  are received, and then to [ConnectionListener::on_message_received] on the application
///  thread during `ConnectionManager::update()`.
#[cfg_attr(test, automock)]
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, socket_id: SocketId);
    fn on_connection_failed(&self, socket_id: SocketId, reason: FailureReason);
    fn on_disconnected(&self, socket_id: SocketId);
    fn on_message_received(&self, socket_id: SocketId, payload: &Bytes);
    fn on_message_received_async(&self, socket_id: SocketId, payload: &Bytes);
}

/// The part of a connection that is shared between the application thread and the network
///  thread through the directory
pub(crate) struct ConnectionShared {
    id: SocketId,
    peer_id: PeerId,
    status: AtomicU8,
    remote: Mutex<Option<SocketAddr>>,
    listener: Mutex<Option<Weak<dyn ConnectionListener>>>,
}

impl Debug for ConnectionShared {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{:?}/{:?}: {:?}}}", self.peer_id, self.id, self.status())
    }
}

impl ConnectionShared {
    pub fn new(id: SocketId, peer_id: PeerId, status: ConnectionStatus, remote: Option<SocketAddr>) -> ConnectionShared {
        ConnectionShared {
            id,
            peer_id,
            status: AtomicU8::new(status.into()),
            remote: Mutex::new(remote),
            listener: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn status(&self) -> ConnectionStatus {
        let raw = self.status.load(Ordering::Acquire);
        ConnectionStatus::try_from_primitive(raw)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Moves the status forward to `new_status`. Returns `false` and leaves the status unchanged
    ///  if that would not be a step forward.
    pub fn advance_status(&self, new_status: ConnectionStatus) -> bool {
        let new_raw: u8 = new_status.into();
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current >= new_raw {
                return false;
            }
            match self.status.compare_exchange(current, new_raw, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    debug!("{:?}/{:?}: status {:?} -> {:?}", self.peer_id, self.id, ConnectionStatus::try_from_primitive(current), new_status);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock().unwrap()
    }

    pub fn set_remote(&self, remote: Option<SocketAddr>) {
        *self.remote.lock().unwrap() = remote;
    }

    pub fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.lock().unwrap()
            .as_ref()
            .and_then(|l| l.upgrade())
    }

    pub fn set_listener(&self, listener: Option<Weak<dyn ConnectionListener>>) {
        *self.listener.lock().unwrap() = listener;
    }
}

struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
    commands: CommandSender,
    outbound: OutboundSender,
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        debug!("releasing connection {:?}", self.shared);
        self.commands.send(Command::RemovePeerReference {
            peer_id: self.shared.peer_id(),
            socket_id: Some(self.shared.id()),
        });
    }
}

/// The application's handle to a single logical connection. Clones refer to the same
///  connection, and releasing the last clone closes the connection and releases its peer.
#[derive(Clone)]
pub struct Connection {
    handle: Arc<ConnectionHandle>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.handle.shared.fmt(f)
    }
}

impl Connection {
    pub(crate) fn new(shared: Arc<ConnectionShared>, commands: CommandSender, outbound: OutboundSender) -> Connection {
        Connection {
            handle: Arc::new(ConnectionHandle {
                shared,
                commands,
                outbound,
            })
        }
    }

    pub fn id(&self) -> SocketId {
        self.handle.shared.id()
    }

    pub fn peer_id(&self) -> PeerId {
        self.handle.shared.peer_id()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// The remote endpoint, which is known once the transport connection is established
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.handle.shared.remote()
    }

    /// Hands a payload to the network thread for sending. This fails if the connection is not
    ///  connected.
    pub fn send(&self, payload: Bytes, priority: MessagePriority, reliability: MessageReliability, channel: MessageChannel) -> bool {
        if !self.is_connected() {
            warn!("{:?}: not connected - discarding {} bytes", self, payload.len());
            return false;
        }

        self.handle.outbound.send(OutboundPacket {
            socket_id: self.id(),
            payload,
            priority: to_transport_priority(priority),
            reliability: to_transport_reliability(reliability),
            channel: channel.raw(),
        });
        true
    }

    /// Closes the connection locally. Listeners are notified through `on_disconnected` once
    ///  the network thread closed the transport link.
    pub fn disconnect(&self) {
        if self.handle.shared.advance_status(ConnectionStatus::Disconnecting) {
            self.handle.commands.send(Command::Close {
                peer_id: self.peer_id(),
                socket_id: self.id(),
            });
        }
    }

    /// NB: The connection holds its listener weakly, so the caller is responsible for keeping
    ///      the listener alive
    pub fn set_listener(&self, listener: Option<Weak<dyn ConnectionListener>>) {
        self.handle.shared.set_listener(listener);
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.handle.shared
    }
}
