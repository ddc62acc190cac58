use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};
use crate::buffers::message_pool::MessagePool;
use crate::connection::{Connection, ConnectionListener, ConnectionStatus, FailureReason};
use crate::ids::{ConnectionGuid, SocketId};
use crate::message_types::{ClientRole, MessageChannel, MessageId, MessagePriority, MessageReliability};
use crate::network_message::{NetworkInMessage, NetworkOutMessage};

/// Receives a [NetworkConnection]'s status changes and the messages with the tag the listener
///  was registered for. A listener registered for several tags gets each status change once.
#[cfg_attr(test, automock)]
pub trait NetworkConnectionListener: Send + Sync {
    fn on_connected(&self, _connection: &NetworkConnection) {}
    fn on_connect_failed(&self, _connection: &NetworkConnection) {}
    fn on_disconnected(&self, _connection: &NetworkConnection) {}
    fn on_message_received(&self, _connection: &NetworkConnection, _message: &mut NetworkInMessage) {}
}

type ListenerMap = FxHashMap<u8, Vec<Arc<dyn NetworkConnectionListener>>>;

#[derive(Copy, Clone)]
enum StatusChange {
    Connected,
    ConnectFailed,
    Disconnected,
}

struct NetworkConnectionInner {
    myself: Weak<NetworkConnectionInner>,
    guid: ConnectionGuid,
    socket: Mutex<Option<Connection>>,
    /// called on the application thread
    listeners: Mutex<ListenerMap>,
    /// called on the network thread as soon as a message is received
    async_listeners: Mutex<ListenerMap>,
    pool: Arc<MessagePool>,
}

/// The application-facing wrapper around a [Connection]: dispatches received messages to
///  listeners by message tag, and writes messages through a pool of buffers.
///
/// The wrapped connection can be replaced at any time, while listeners stay registered. Clones
///  refer to the same NetworkConnection.
#[derive(Clone)]
pub struct NetworkConnection {
    inner: Arc<NetworkConnectionInner>,
}

impl Debug for NetworkConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetworkConnection{{{:x}: {:?}}}", self.inner.guid.0, self.socket())
    }
}

impl NetworkConnection {
    pub fn new(pool: Arc<MessagePool>) -> NetworkConnection {
        NetworkConnection {
            inner: Arc::new_cyclic(|myself| NetworkConnectionInner {
                myself: myself.clone(),
                guid: ConnectionGuid::random(),
                socket: Default::default(),
                listeners: Default::default(),
                async_listeners: Default::default(),
                pool,
            })
        }
    }

    pub fn connection_guid(&self) -> ConnectionGuid {
        self.inner.guid
    }

    pub fn socket(&self) -> Option<Connection> {
        self.inner.socket.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.socket()
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.socket()
            .and_then(|s| s.remote_address())
    }

    /// Replaces the wrapped connection. Listeners are notified right away if the new
    ///  connection is already connected, or if a connected connection is removed.
    pub fn set_socket(&self, socket: Option<Connection>) {
        let old = std::mem::replace(&mut *self.inner.socket.lock().unwrap(), socket.clone());

        let old_was_connected = match &old {
            Some(old) => {
                old.set_listener(None);
                old.is_connected()
            }
            None => false,
        };

        match socket {
            Some(socket) => {
                debug!("{:?}: wrapping {:?}", self, socket);
                let listener: Weak<dyn ConnectionListener> = self.inner.myself.clone();
                socket.set_listener(Some(listener));
                if socket.is_connected() {
                    self.inner.notify(StatusChange::Connected);
                }
            }
            None => {
                if old_was_connected {
                    self.inner.notify(StatusChange::Disconnected);
                }
            }
        }
    }

    /// Closes the wrapped connection, notifying listeners unless it was already disconnecting
    pub fn disconnect(&self) {
        let Some(socket) = self.socket() else {
            return;
        };
        if socket.status() > ConnectionStatus::Connected {
            return;
        }

        socket.disconnect();
        self.inner.release_socket(socket.id());
        self.inner.notify(StatusChange::Disconnected);
    }

    pub fn create_message(&self, tag: u8) -> NetworkOutMessage {
        NetworkOutMessage::new(self.inner.pool.get_from_pool(), tag)
    }

    pub fn return_message(&self, message: NetworkOutMessage) {
        self.inner.pool.return_to_pool(message.into_inner());
    }

    pub fn send(&self, message: &NetworkOutMessage, priority: MessagePriority, reliability: MessageReliability, channel: MessageChannel) {
        let socket = match self.socket() {
            Some(socket) if socket.is_connected() => socket,
            _ => {
                error!("{:?}: cannot send message with tag {}: not connected", self, message.tag());
                return;
            }
        };
        socket.send(Bytes::copy_from_slice(message.as_slice()), priority, reliability, channel);
    }

    /// Sends the message and returns it to the pool, even if it could not be sent
    pub fn send_and_release(&self, message: NetworkOutMessage, priority: MessagePriority, reliability: MessageReliability, channel: MessageChannel) {
        self.send(&message, priority, reliability, channel);
        self.return_message(message);
    }

    /// Sends a message to be relayed to a single user, wrapped in an envelope carrying the
    ///  relay's send settings and the target. The message is returned to the pool.
    pub fn send_to(&self, user_id: u32, role: ClientRole, message: NetworkOutMessage, priority: MessagePriority, reliability: MessageReliability, channel: MessageChannel) {
        let mut envelope = self.create_message(MessageId::SendTo.into());
        envelope.write_u8(priority.into());
        envelope.write_u8(reliability.into());
        envelope.write_u8(channel.raw());
        envelope.write_u32(user_id);
        envelope.write_u8(role.into());
        envelope.write_array(message.as_slice());
        self.return_message(message);

        self.send_and_release(envelope, priority, reliability, channel);
    }

    /// Sends a message to be relayed to all other users. The message is returned to the pool.
    pub fn broadcast(&self, message: NetworkOutMessage, priority: MessagePriority, reliability: MessageReliability, channel: MessageChannel) {
        let mut envelope = self.create_message(MessageId::Broadcast.into());
        envelope.write_u8(priority.into());
        envelope.write_u8(reliability.into());
        envelope.write_u8(channel.raw());
        envelope.write_array(message.as_slice());
        self.return_message(message);

        self.send_and_release(envelope, priority, reliability, channel);
    }

    /// Registers a listener for messages with the given tag, called on the application thread.
    ///  Tags below [MessageId::START] register for status changes only.
    pub fn add_listener(&self, tag: u8, listener: Arc<dyn NetworkConnectionListener>) {
        add_to(&self.inner.listeners, tag, listener);
    }

    pub fn remove_listener(&self, tag: u8, listener: &Arc<dyn NetworkConnectionListener>) {
        remove_from(&self.inner.listeners, tag, listener);
    }

    /// Registers a listener for messages with the given tag, called on the network thread.
    pub fn add_listener_async(&self, tag: u8, listener: Arc<dyn NetworkConnectionListener>) {
        add_to(&self.inner.async_listeners, tag, listener);
    }

    pub fn remove_listener_async(&self, tag: u8, listener: &Arc<dyn NetworkConnectionListener>) {
        remove_from(&self.inner.async_listeners, tag, listener);
    }
}

fn effective_tag(tag: u8) -> u8 {
    if tag < MessageId::START {
        MessageId::StatusOnly.into()
    }
    else {
        tag
    }
}

fn add_to(listeners: &Mutex<ListenerMap>, tag: u8, listener: Arc<dyn NetworkConnectionListener>) {
    let mut listeners = listeners.lock().unwrap();
    let for_tag = listeners.entry(effective_tag(tag)).or_default();
    if !for_tag.iter().any(|l| Arc::ptr_eq(l, &listener)) {
        for_tag.push(listener);
    }
}

fn remove_from(listeners: &Mutex<ListenerMap>, tag: u8, listener: &Arc<dyn NetworkConnectionListener>) {
    let mut listeners = listeners.lock().unwrap();
    let tag = effective_tag(tag);
    if let Some(for_tag) = listeners.get_mut(&tag) {
        for_tag.retain(|l| !Arc::ptr_eq(l, listener));
        if for_tag.is_empty() {
            listeners.remove(&tag);
        }
    }
}

impl NetworkConnectionInner {
    fn handle(&self) -> Option<NetworkConnection> {
        self.myself.upgrade()
            .map(|inner| NetworkConnection { inner })
    }

    fn is_current_socket(&self, socket_id: SocketId) -> bool {
        self.socket.lock().unwrap()
            .as_ref()
            .map(|s| s.id() == socket_id)
            .unwrap_or(false)
    }

    /// Forgets the wrapped connection if it is the one with the given id, releasing it
    fn release_socket(&self, socket_id: SocketId) -> bool {
        let released = {
            let mut socket = self.socket.lock().unwrap();
            match &*socket {
                Some(s) if s.id() == socket_id => socket.take(),
                _ => None,
            }
        };
        match released {
            Some(released) => {
                released.set_listener(None);
                true
            }
            None => false,
        }
    }

    /// every listener once, synchronous listeners first
    fn all_listeners(&self) -> Vec<Arc<dyn NetworkConnectionListener>> {
        let mut result: Vec<Arc<dyn NetworkConnectionListener>> = Vec::new();
        for map in [&self.listeners, &self.async_listeners] {
            for listener in map.lock().unwrap().values().flatten() {
                if !result.iter().any(|l| Arc::ptr_eq(l, listener)) {
                    result.push(listener.clone());
                }
            }
        }
        result
    }

    fn notify(&self, change: StatusChange) {
        let Some(handle) = self.handle() else {
            return;
        };
        for listener in self.all_listeners() {
            match change {
                StatusChange::Connected => listener.on_connected(&handle),
                StatusChange::ConnectFailed => listener.on_connect_failed(&handle),
                StatusChange::Disconnected => listener.on_disconnected(&handle),
            }
        }
    }

    /// Listeners are called without holding the lock, so they are free to register and
    ///  unregister listeners
    fn dispatch(&self, payload: &Bytes) {
        let Some(&tag) = payload.first() else {
            return;
        };
        let for_tag = self.listeners.lock().unwrap()
            .get(&tag)
            .cloned()
            .unwrap_or_default();
        self.call_listeners(tag, &for_tag, payload);
    }

    ///  NB: The lock is held while the listeners run, so that once `remove_listener_async()`
    ///       returns, the removed listener is not running and will not be called again. An async
    ///       listener must therefore not (un)register async listeners on the same connection.
    fn dispatch_async(&self, payload: &Bytes) {
        let Some(&tag) = payload.first() else {
            return;
        };
        let listeners = self.async_listeners.lock().unwrap();
        let for_tag = listeners.get(&tag)
            .map(|l| l.as_slice())
            .unwrap_or_default();
        self.call_listeners(tag, for_tag, payload);
    }

    fn call_listeners(&self, tag: u8, for_tag: &[Arc<dyn NetworkConnectionListener>], payload: &Bytes) {
        if for_tag.is_empty() {
            trace!("no listener for message tag {}", tag);
            return;
        }

        let Some(handle) = self.handle() else {
            return;
        };
        for listener in for_tag.iter().rev() {
            let mut message = NetworkInMessage::new(payload.clone());
            listener.on_message_received(&handle, &mut message);
        }
    }
}

impl ConnectionListener for NetworkConnectionInner {
    fn on_connected(&self, socket_id: SocketId) {
        if self.is_current_socket(socket_id) {
            self.notify(StatusChange::Connected);
        }
    }

    fn on_connection_failed(&self, socket_id: SocketId, reason: FailureReason) {
        debug!("{:?}: connection failed: {:?}", socket_id, reason);
        if self.release_socket(socket_id) {
            self.notify(StatusChange::ConnectFailed);
        }
    }

    fn on_disconnected(&self, socket_id: SocketId) {
        if self.release_socket(socket_id) {
            self.notify(StatusChange::Disconnected);
        }
    }

    fn on_message_received(&self, _socket_id: SocketId, payload: &Bytes) {
        self.dispatch(payload);
    }

    fn on_message_received_async(&self, _socket_id: SocketId, payload: &Bytes) {
        self.dispatch_async(payload);
    }
}
