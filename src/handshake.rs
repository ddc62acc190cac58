use std::sync::{Arc, Mutex, Weak};
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::{debug, info, warn};
use crate::buffers::message_pool::MessagePool;
use crate::connection::{Connection, ConnectionListener, FailureReason};
use crate::ids::SocketId;
use crate::message_types::{MessageChannel, MessageId, MessagePriority, MessageReliability};
use crate::network_message::{NetworkInMessage, NetworkOutMessage};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeResult {
    Success,
    /// The connection was lost before the handshake completed. Trying again may succeed.
    SoftFailure,
    /// The remote side sent something that is not a valid handshake
    FatalFailure,
}

/// The application-specific part of a handshake: what to send, and how to judge what the
///  remote side sent
#[cfg_attr(test, automock)]
pub trait HandshakeLogic: Send + Sync {
    /// Writes the handshake payload. The message tag is already written.
    fn create_outgoing_message(&self, message: &mut NetworkOutMessage);

    /// Judges the remote side's handshake payload, positioned after the message tag
    fn validate_incoming_message(&self, message: &mut NetworkInMessage) -> bool;
}

/// Called exactly once with the result. The connection is passed only on success, otherwise
///  it was closed.
pub type HandshakeCallback = Box<dyn FnOnce(Option<Connection>, SocketId, HandshakeResult) + Send>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HandshakeState {
    AwaitingLocalSend,
    AwaitingRemoteResponse,
    Complete(HandshakeResult),
}

/// Exchanges one handshake message in each direction on a fresh connection before the
///  application gets to use it. A handshake keeps itself alive until it reports its result.
pub struct NetworkHandshake {
    socket_id: SocketId,
    state: Mutex<HandshakeState>,
    connection: Mutex<Option<Connection>>,
    logic: Arc<dyn HandshakeLogic>,
    pool: Arc<MessagePool>,
    callback: Mutex<Option<HandshakeCallback>>,
    keep_alive: Mutex<Option<Arc<NetworkHandshake>>>,
}

impl NetworkHandshake {
    pub fn start(connection: Connection, logic: Arc<dyn HandshakeLogic>, pool: Arc<MessagePool>, callback: HandshakeCallback) {
        let handshake = Arc::new(NetworkHandshake {
            socket_id: connection.id(),
            state: Mutex::new(HandshakeState::AwaitingLocalSend),
            connection: Mutex::new(Some(connection.clone())),
            logic,
            pool,
            callback: Mutex::new(Some(callback)),
            keep_alive: Mutex::new(None),
        });
        *handshake.keep_alive.lock().unwrap() = Some(handshake.clone());

        debug!("{:?}: starting handshake", handshake.socket_id);
        let as_listener: Arc<dyn ConnectionListener> = handshake.clone();
        let listener: Weak<dyn ConnectionListener> = Arc::downgrade(&as_listener);
        connection.set_listener(Some(listener));

        if connection.is_connected() {
            handshake.send_local_message();
        }
    }

    fn send_local_message(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != HandshakeState::AwaitingLocalSend {
                return;
            }
            *state = HandshakeState::AwaitingRemoteResponse;
        }

        let Some(connection) = self.connection.lock().unwrap().clone() else {
            return;
        };

        let mut message = NetworkOutMessage::new(self.pool.get_from_pool(), MessageId::Handshake.into());
        self.logic.create_outgoing_message(&mut message);
        connection.send(Bytes::copy_from_slice(message.as_slice()), MessagePriority::Immediate, MessageReliability::ReliableOrdered, MessageChannel::DEFAULT);
        self.pool.return_to_pool(message.into_inner());
    }

    fn complete(&self, result: HandshakeResult) {
        {
            let mut state = self.state.lock().unwrap();
            if let HandshakeState::Complete(_) = *state {
                return;
            }
            *state = HandshakeState::Complete(result);
        }
        info!("{:?}: handshake complete: {:?}", self.socket_id, result);

        let connection = self.connection.lock().unwrap().take();
        if let Some(connection) = &connection {
            connection.set_listener(None);
        }

        let connection = match result {
            HandshakeResult::Success => connection,
            HandshakeResult::SoftFailure | HandshakeResult::FatalFailure => {
                if let Some(connection) = connection {
                    connection.disconnect();
                }
                None
            }
        };

        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(connection, self.socket_id, result);
        }

        self.keep_alive.lock().unwrap().take();
    }
}

impl ConnectionListener for NetworkHandshake {
    fn on_connected(&self, _socket_id: SocketId) {
        self.send_local_message();
    }

    fn on_connection_failed(&self, _socket_id: SocketId, reason: FailureReason) {
        debug!("{:?}: connection failed during handshake: {:?}", self.socket_id, reason);
        self.complete(HandshakeResult::SoftFailure);
    }

    fn on_disconnected(&self, _socket_id: SocketId) {
        debug!("{:?}: disconnected during handshake", self.socket_id);
        self.complete(HandshakeResult::SoftFailure);
    }

    fn on_message_received(&self, _socket_id: SocketId, payload: &Bytes) {
        let handshake_tag: u8 = MessageId::Handshake.into();
        if payload.first() != Some(&handshake_tag) {
            warn!("{:?}: expected handshake, received message with tag {:?}", self.socket_id, payload.first());
            self.complete(HandshakeResult::FatalFailure);
            return;
        }

        let mut message = NetworkInMessage::new(payload.clone());
        if self.logic.validate_incoming_message(&mut message) {
            self.complete(HandshakeResult::Success);
        }
        else {
            warn!("{:?}: remote handshake was rejected", self.socket_id);
            self.complete(HandshakeResult::FatalFailure);
        }
    }

    fn on_message_received_async(&self, _socket_id: SocketId, _payload: &Bytes) {
    }
}
