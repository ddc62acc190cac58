use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
#[cfg(test)] use mockall::automock;
use num_enum::TryFromPrimitive;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};
use crate::buffers::message_pool::MessagePool;
use crate::command::{command_channel, Command, CommandSender, DiscoveryDescriptor, OutboundSender, MAX_ADDRESS_LEN};
use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionShared, ConnectionStatus, FailureReason};
use crate::directory::Directory;
use crate::ids::{PeerId, SocketId};
use crate::message::{message_channel, Message, MessageReceiver};
use crate::message_types::{ClientRole, MessageId};
use crate::network_thread::{spawn_network_thread, NetworkThreadContext};
use crate::transport::event::TransportEvent;

/// Is notified of connections accepted by a listening peer, see [ConnectionManager::accept]
#[cfg_attr(test, automock)]
pub trait IncomingConnectionListener: Send + Sync {
    fn on_incoming_connection(&self, connection: Connection);

    /// Called if the listening peer could not bind its port. No connections will ever be
    ///  accepted through the receipt in that case.
    fn on_accept_failed(&self) {}
}

type IncomingListeners = Arc<Mutex<FxHashMap<PeerId, Arc<dyn IncomingConnectionListener>>>>;

/// Keeps a listening peer or a discovery responder alive. Dropping the receipt stops listening,
///  and closes the peer once all connections accepted through it are released.
pub struct Receipt {
    peer_id: PeerId,
    incoming_listeners: Option<IncomingListeners>,
    commands: CommandSender,
}

impl Receipt {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl Drop for Receipt {
    fn drop(&mut self) {
        debug!("releasing receipt for {:?}", self.peer_id);
        if let Some(listeners) = &self.incoming_listeners {
            listeners.lock().unwrap().remove(&self.peer_id);
        }
        self.commands.send(Command::RemovePeerReference {
            peer_id: self.peer_id,
            socket_id: None,
        });
    }
}

/// The application's entry point: owns the network thread and both ends of the queues
///  connecting it to the application thread.
///
/// All methods are meant to be called from a single application thread. Listener callbacks
///  except for `on_message_received_async` are called from inside [ConnectionManager::update].
pub struct ConnectionManager {
    config: Arc<NetConfig>,
    commands: CommandSender,
    outbound: OutboundSender,
    messages: MessageReceiver,
    directory: Arc<Directory>,
    incoming_listeners: IncomingListeners,
    message_pool: Arc<MessagePool>,
    wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    network_thread: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: Arc<NetConfig>) -> anyhow::Result<ConnectionManager> {
        config.validate()?;

        let wake = Arc::new(Notify::new());
        let (commands, command_receiver) = command_channel(config.command_queue_size, wake.clone());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (message_sender, messages) = message_channel(config.message_queue_size);
        let directory = Arc::new(Directory::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let network_thread = spawn_network_thread(NetworkThreadContext {
            config: config.clone(),
            commands: command_receiver,
            outbound: outbound_rx,
            messages: message_sender,
            directory: directory.clone(),
            wake: wake.clone(),
            shutdown: shutdown.clone(),
        })?;

        Ok(ConnectionManager {
            message_pool: Arc::new(MessagePool::new(config.transport.max_datagram_size, config.message_pool_size)),
            config,
            commands,
            outbound: OutboundSender::new(outbound_tx, wake.clone()),
            messages,
            directory,
            incoming_listeners: Default::default(),
            wake,
            shutdown,
            network_thread: Some(network_thread),
        })
    }

    /// Starts connecting to a remote peer from a new local peer bound to an ephemeral port.
    ///  The returned connection is `Connecting`, and its listener is notified when the attempt
    ///  succeeds or fails.
    pub fn open(&self, address: &str, port: u16) -> Connection {
        let peer_id = PeerId::next();
        let socket_id = SocketId::next();

        let address = if address.len() > MAX_ADDRESS_LEN {
            warn!("address {:?} is too long - the connection will fail", address);
            ""
        }
        else {
            address
        };

        let shared = Arc::new(ConnectionShared::new(socket_id, peer_id, ConnectionStatus::Connecting, None));
        self.directory.insert_connection(shared.clone());

        info!("{:?}: opening connection to {}:{}", socket_id, address, port);
        self.commands.send(Command::Open {
            peer_id,
            socket_id,
            address: address.to_string(),
            port,
        });

        Connection::new(shared, self.commands.clone(), self.outbound.clone())
    }

    /// Starts listening for incoming connections on a new peer bound to `port`. Accepted
    ///  connections are passed to `listener` during [ConnectionManager::update].
    ///
    /// NB: Failure to bind the port means that no connection is ever passed to `listener`. It
    ///      is logged, and `listener.on_accept_failed()` is called during a later `update()`.
    pub fn accept(&self, port: u16, max_connections: u16, listener: Arc<dyn IncomingConnectionListener>) -> Receipt {
        let peer_id = PeerId::next();
        self.incoming_listeners.lock().unwrap()
            .insert(peer_id, listener);

        self.commands.send(Command::Accept {
            peer_id,
            port,
            max_connections,
        });

        Receipt {
            peer_id,
            incoming_listeners: Some(self.incoming_listeners.clone()),
            commands: self.commands.clone(),
        }
    }

    /// Answers discovery pings on `port` with this process' discovery name and `role`
    pub fn accept_discovery_pings(&self, port: u16, role: ClientRole) -> Receipt {
        let peer_id = PeerId::next();
        self.commands.send(Command::DiscoveryResponse {
            peer_id,
            port,
            descriptor: DiscoveryDescriptor::new(&self.config.discovery_name, role),
        });

        Receipt {
            peer_id,
            incoming_listeners: None,
            commands: self.commands.clone(),
        }
    }

    /// The local address of the peer a connection goes through, once the peer is bound
    pub fn local_address_for(&self, connection: &Connection) -> Option<SocketAddr> {
        self.directory.local_addr(connection.peer_id())
    }

    pub fn message_pool(&self) -> Arc<MessagePool> {
        self.message_pool.clone()
    }

    /// Dispatches received messages and connection events to their listeners. This must be
    ///  called regularly from the application thread.
    pub fn update(&mut self) {
        for _ in 0..self.config.max_messages_per_update {
            match self.messages.try_recv() {
                Some(message) => self.dispatch(message),
                None => break,
            }
        }
    }

    fn dispatch(&self, message: Message) {
        trace!("dispatching {:?}", message);

        let Some(tag) = message.tag() else {
            debug!("empty message - ignoring");
            return;
        };
        let Some(socket_id) = message.socket_id else {
            if tag == u8::from(TransportEvent::ConnectionAttemptFailed) {
                self.on_accept_failed(message.peer_id);
            }
            else {
                debug!("message without a connection - ignoring");
            }
            return;
        };

        if tag >= MessageId::START {
            if let Some(listener) = self.directory.connection(socket_id).and_then(|c| c.listener()) {
                listener.on_message_received(socket_id, &message.payload);
            }
            return;
        }

        let event = match TransportEvent::try_from_primitive(tag) {
            Ok(event) => event,
            Err(_) => {
                debug!("unknown transport event {} - ignoring", tag);
                return;
            }
        };

        if event == TransportEvent::NewIncomingConnection {
            self.on_incoming_connection(message);
            return;
        }

        let Some(shared) = self.directory.connection(socket_id) else {
            debug!("{:?} for released connection {:?} - ignoring", event, socket_id);
            return;
        };

        match event {
            TransportEvent::ConnectionRequestAccepted => {
                if shared.advance_status(ConnectionStatus::Connected) {
                    if let Some(listener) = shared.listener() {
                        listener.on_connected(socket_id);
                    }
                }
            }
            TransportEvent::ConnectionAttemptFailed | TransportEvent::AlreadyConnected | TransportEvent::NoFreeIncomingConnections => {
                let reason = match event {
                    TransportEvent::ConnectionAttemptFailed => FailureReason::CannotConnect,
                    TransportEvent::AlreadyConnected => FailureReason::AlreadyConnected,
                    TransportEvent::NoFreeIncomingConnections => FailureReason::MaxConnectionsReached,
                    _ => FailureReason::Unknown,
                };
                if shared.advance_status(ConnectionStatus::Disconnected) {
                    info!("{:?}: connection failed: {:?}", socket_id, reason);
                    if let Some(listener) = shared.listener() {
                        listener.on_connection_failed(socket_id, reason);
                    }
                }
            }
            TransportEvent::DisconnectionNotification | TransportEvent::ConnectionLost => {
                if shared.advance_status(ConnectionStatus::Disconnected) {
                    info!("{:?}: disconnected ({:?})", socket_id, event);
                    if let Some(listener) = shared.listener() {
                        listener.on_disconnected(socket_id);
                    }
                }
            }
            _ => debug!("unexpected transport event {:?} - ignoring", event),
        }
    }

    fn on_accept_failed(&self, peer_id: PeerId) {
        let listener = self.incoming_listeners.lock().unwrap()
            .get(&peer_id)
            .cloned();
        match listener {
            Some(listener) => listener.on_accept_failed(),
            None => debug!("accepting on {:?} failed after its receipt was released", peer_id),
        }
    }

    fn on_incoming_connection(&self, message: Message) {
        let Some(socket_id) = message.socket_id else {
            return;
        };
        let Some(shared) = self.directory.connection(socket_id) else {
            debug!("new incoming connection {:?} was already released - ignoring", socket_id);
            return;
        };

        // the handle is created even without a listener, so that dropping it releases the
        //  connection on the network thread
        let connection = Connection::new(shared, self.commands.clone(), self.outbound.clone());

        let listener = self.incoming_listeners.lock().unwrap()
            .get(&message.peer_id)
            .cloned();
        match listener {
            Some(listener) => {
                info!("{:?}: new incoming connection from {:?}", socket_id, message.remote);
                listener.on_incoming_connection(connection);
            }
            None => debug!("no listener for incoming connection {:?} - closing it", socket_id),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        debug!("shutting down network thread");
        self.shutdown.store(true, Ordering::Release);
        self.commands.close();
        self.wake.notify_one();

        if let Some(handle) = self.network_thread.take() {
            if handle.join().is_err() {
                error!("network thread panicked");
            }
        }
    }
}
