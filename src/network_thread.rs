//! The network thread owns all peers and does all socket I/O. It runs a single-threaded tokio
//!  runtime on a dedicated OS thread, so nothing it does blocks the application thread and
//!  the peer and connection table state needs no synchronization.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, info_span, trace, warn};
use crate::command::{Command, CommandReceiver, DiscoveryDescriptor, OutboundPacket};
use crate::config::{NetConfig, TransportConfig};
use crate::connection::{ConnectionShared, ConnectionStatus};
use crate::directory::Directory;
use crate::ids::{PeerId, SocketId};
use crate::message::{Message, MessageSender};
use crate::transport::event::TransportEvent;
use crate::transport::peer::{Packet, Peer};
use crate::transport::USER_PACKET_START;

pub(crate) struct NetworkThreadContext {
    pub config: Arc<NetConfig>,
    pub commands: CommandReceiver,
    pub outbound: mpsc::UnboundedReceiver<OutboundPacket>,
    pub messages: MessageSender,
    pub directory: Arc<Directory>,
    pub wake: Arc<Notify>,
    pub shutdown: Arc<AtomicBool>,
}

pub(crate) fn spawn_network_thread(ctx: NetworkThreadContext) -> anyhow::Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("network".to_string())
        .spawn(move || {
            let span = info_span!("network_thread");
            let _entered = span.enter();

            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("error creating runtime for the network thread: {}", e);
                    return;
                }
            };
            rt.block_on(NetworkThread::new(ctx).run());
        })?;
    Ok(handle)
}

struct PeerEntry {
    peer: Peer,
    /// resolved connections by remote address
    sockets: FxHashMap<SocketAddr, SocketId>,
    /// the outgoing connection of a peer created by an 'open' command, until the transport
    ///  accepts or rejects it
    pending_outbound: Option<(SocketId, SocketAddr)>,
    /// number of connections using this peer, plus one for a registered listener or discovery
    ///  responder
    references: usize,
    listening: bool,
}

impl PeerEntry {
    fn new(peer: Peer, references: usize, listening: bool) -> PeerEntry {
        PeerEntry {
            peer,
            sockets: Default::default(),
            pending_outbound: None,
            references,
            listening,
        }
    }

    fn is_pending(&self, socket_id: SocketId) -> bool {
        matches!(self.pending_outbound, Some((id, _)) if id == socket_id)
    }
}

struct NetworkThread {
    config: Arc<NetConfig>,
    transport_config: Arc<TransportConfig>,
    commands: CommandReceiver,
    outbound: mpsc::UnboundedReceiver<OutboundPacket>,
    messages: MessageSender,
    directory: Arc<Directory>,
    wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,

    peers: FxHashMap<PeerId, PeerEntry>,
    /// peers that are no longer referenced, kept alive for a grace period so that data in
    ///  flight can be sent
    closing: Vec<(Instant, Peer)>,
    /// for every resolved connection, the peer and remote address it is routed through
    routes: FxHashMap<SocketId, (PeerId, SocketAddr)>,
}

impl NetworkThread {
    fn new(ctx: NetworkThreadContext) -> NetworkThread {
        NetworkThread {
            transport_config: Arc::new(ctx.config.transport.clone()),
            config: ctx.config,
            commands: ctx.commands,
            outbound: ctx.outbound,
            messages: ctx.messages,
            directory: ctx.directory,
            wake: ctx.wake,
            shutdown: ctx.shutdown,
            peers: Default::default(),
            closing: Default::default(),
            routes: Default::default(),
        }
    }

    async fn run(mut self) {
        info!("network thread started");

        while !self.shutdown.load(Ordering::Acquire) {
            self.drain_outbound();
            self.process_commands().await;
            self.messages.flush_backlog();

            let now = Instant::now();
            self.expire_closing_peers(now);
            self.update_peers(now).await;
            self.harvest();

            let _ = tokio::time::timeout(self.config.network_tick, self.wake.notified()).await;
        }

        self.shut_down_peers().await;
        info!("network thread stopped");
    }

    fn drain_outbound(&mut self) {
        while let Ok(packet) = self.outbound.try_recv() {
            let Some(&(peer_id, remote)) = self.routes.get(&packet.socket_id) else {
                debug!("no route for {:?} - dropping outbound packet", packet.socket_id);
                continue;
            };
            match self.peers.get_mut(&peer_id) {
                Some(entry) => {
                    entry.peer.send(remote, packet.payload, packet.priority, packet.reliability, packet.channel);
                }
                None => debug!("no peer {:?} for {:?} - dropping outbound packet", peer_id, packet.socket_id),
            }
        }
    }

    async fn process_commands(&mut self) {
        while let Some(command) = self.commands.try_recv() {
            trace!("processing command {:?}", command);
            match command {
                Command::Open { peer_id, socket_id, address, port } => self.on_open(peer_id, socket_id, &address, port).await,
                Command::Accept { peer_id, port, max_connections } => self.on_accept(peer_id, port, max_connections).await,
                Command::DiscoveryResponse { peer_id, port, descriptor } => self.on_discovery_response(peer_id, port, descriptor).await,
                Command::RemovePeerReference { peer_id, socket_id } => self.on_remove_peer_reference(peer_id, socket_id),
                Command::Close { peer_id, socket_id } => self.on_close(peer_id, socket_id),
            }
        }
    }

    async fn on_open(&mut self, peer_id: PeerId, socket_id: SocketId, address: &str, port: u16) {
        let remote = match resolve(address, port) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("{:?}: cannot resolve {}:{}: {}", socket_id, address, port, e);
                self.fail_open(peer_id, socket_id);
                return;
            }
        };

        let bind_addr = if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        }
        else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let mut peer = match self.bind_peer(peer_id, bind_addr).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("{:?}: cannot bind local socket for connecting to {:?}: {}", socket_id, remote, e);
                self.fail_open(peer_id, socket_id);
                return;
            }
        };

        debug!("{:?}: opening connection to {:?} from {:?}", socket_id, remote, peer_id);
        peer.connect(remote, Instant::now());

        let mut entry = PeerEntry::new(peer, 1, false);
        entry.pending_outbound = Some((socket_id, remote));
        self.peers.insert(peer_id, entry);
    }

    /// The failure is reported like a transport-level connection failure, so the application
    ///  thread handles both the same way
    fn fail_open(&mut self, peer_id: PeerId, socket_id: SocketId) {
        self.messages.send(&Message {
            peer_id,
            socket_id: Some(socket_id),
            remote: None,
            payload: event_payload(TransportEvent::ConnectionAttemptFailed),
        });
    }

    async fn on_accept(&mut self, peer_id: PeerId, port: u16, max_connections: u16) {
        match self.bind_peer(peer_id, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
            Ok(mut peer) => {
                info!("{:?}: accepting up to {} connections on port {}", peer_id, max_connections, port);
                peer.set_max_incoming(max_connections as usize);
                self.peers.insert(peer_id, PeerEntry::new(peer, 1, true));
            }
            Err(e) => {
                error!("{:?}: cannot listen on port {}: {}", peer_id, port, e);
                self.messages.send(&Message {
                    peer_id,
                    socket_id: None,
                    remote: None,
                    payload: event_payload(TransportEvent::ConnectionAttemptFailed),
                });
            }
        }
    }

    async fn on_discovery_response(&mut self, peer_id: PeerId, port: u16, descriptor: DiscoveryDescriptor) {
        match self.bind_peer(peer_id, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
            Ok(mut peer) => {
                info!("{:?}: answering discovery pings on port {} as {:?}", peer_id, port, descriptor.name());
                let mut buf = BytesMut::with_capacity(DiscoveryDescriptor::SERIALIZED_LEN);
                descriptor.ser(&mut buf);
                peer.set_offline_ping_response(Some(buf.freeze()));
                self.peers.insert(peer_id, PeerEntry::new(peer, 1, false));
            }
            Err(e) => error!("{:?}: cannot answer discovery pings on port {}: {}", peer_id, port, e),
        }
    }

    async fn bind_peer(&self, peer_id: PeerId, addr: SocketAddr) -> anyhow::Result<Peer> {
        let peer = Peer::bind(addr, self.transport_config.clone()).await?;
        self.directory.set_local_addr(peer_id, peer.local_addr()?);
        Ok(peer)
    }

    fn on_remove_peer_reference(&mut self, peer_id: PeerId, socket_id: Option<SocketId>) {
        if let Some(socket_id) = socket_id {
            if let Some(shared) = self.directory.remove_connection(socket_id) {
                shared.advance_status(ConnectionStatus::Disconnected);
            }
        }

        let Some(entry) = self.peers.get_mut(&peer_id) else {
            debug!("removing reference to {:?}, which is not open - ignoring", peer_id);
            return;
        };

        match socket_id {
            Some(socket_id) => {
                if let Some((_, remote)) = self.routes.remove(&socket_id) {
                    entry.sockets.remove(&remote);
                    entry.peer.close_link(remote);
                }
                if entry.is_pending(socket_id) {
                    if let Some((_, remote)) = entry.pending_outbound.take() {
                        entry.peer.close_link(remote);
                    }
                }
            }
            None => {
                entry.listening = false;
                entry.peer.set_max_incoming(0);
                entry.peer.set_offline_ping_response(None);
            }
        }

        entry.references = entry.references.saturating_sub(1);
        trace!("{:?} has {} remaining references", peer_id, entry.references);

        if entry.references == 0 {
            if let Some(mut entry) = self.peers.remove(&peer_id) {
                debug!("{:?} is no longer referenced - closing", peer_id);
                for socket_id in entry.sockets.values() {
                    self.routes.remove(socket_id);
                }
                entry.peer.shutdown();
                self.closing.push((Instant::now(), entry.peer));
                self.directory.remove_local_addr(peer_id);
            }
        }
    }

    fn on_close(&mut self, peer_id: PeerId, socket_id: SocketId) {
        let mut remote = None;
        if let Some(entry) = self.peers.get_mut(&peer_id) {
            if let Some((_, r)) = self.routes.remove(&socket_id) {
                entry.sockets.remove(&r);
                remote = Some(r);
            }
            else if entry.is_pending(socket_id) {
                remote = entry.pending_outbound.take().map(|(_, r)| r);
            }

            if let Some(remote) = remote {
                debug!("{:?}: closing connection to {:?}", socket_id, remote);
                entry.peer.close_link(remote);
            }
        }

        self.messages.send(&Message {
            peer_id,
            socket_id: Some(socket_id),
            remote,
            payload: event_payload(TransportEvent::DisconnectionNotification),
        });
    }

    fn expire_closing_peers(&mut self, now: Instant) {
        let grace = self.config.peer_shutdown_grace;
        self.closing.retain(|(since, peer)| {
            let keep = now.duration_since(*since) < grace;
            if !keep {
                debug!("releasing socket {:?}", peer.local_addr().ok());
            }
            keep
        });
    }

    async fn update_peers(&mut self, now: Instant) {
        for entry in self.peers.values_mut() {
            entry.peer.update(now).await;
        }
        for (_, peer) in self.closing.iter_mut() {
            peer.update(now).await;
            while peer.receive().is_some() {}
        }
    }

    fn harvest(&mut self) {
        let peer_ids = self.peers.keys().copied().collect::<Vec<_>>();
        for peer_id in peer_ids {
            for _ in 0..self.config.max_incoming_per_peer_update {
                let Some(packet) = self.peers.get_mut(&peer_id).and_then(|e| e.peer.receive()) else {
                    break;
                };
                self.on_packet(peer_id, packet);
            }
        }
    }

    fn on_packet(&mut self, peer_id: PeerId, packet: Packet) {
        let Some(entry) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let Some(&tag) = packet.data.first() else {
            return;
        };

        if tag >= USER_PACKET_START {
            let Some(&socket_id) = entry.sockets.get(&packet.remote) else {
                debug!("{:?}: received packet from {:?} without a connection - dropping", peer_id, packet.remote);
                return;
            };

            if let Some(listener) = self.directory.connection(socket_id).and_then(|c| c.listener()) {
                listener.on_message_received_async(socket_id, &packet.data);
            }
            self.messages.send(&Message {
                peer_id,
                socket_id: Some(socket_id),
                remote: Some(packet.remote),
                payload: packet.data,
            });
            return;
        }

        let socket_id = match TransportEvent::try_from_primitive(tag) {
            Ok(TransportEvent::ConnectionRequestAccepted) => {
                match entry.pending_outbound.take() {
                    Some((socket_id, remote)) if remote == packet.remote => {
                        debug!("{:?}: connected to {:?}", socket_id, remote);
                        entry.sockets.insert(remote, socket_id);
                        self.routes.insert(socket_id, (peer_id, remote));
                        if let Some(shared) = self.directory.connection(socket_id) {
                            shared.set_remote(Some(remote));
                        }
                        socket_id
                    }
                    other => {
                        debug!("{:?}: unexpected connection accept from {:?} - ignoring", peer_id, packet.remote);
                        entry.pending_outbound = other;
                        return;
                    }
                }
            }
            Ok(TransportEvent::NewIncomingConnection) => {
                if !entry.listening {
                    debug!("{:?}: incoming connection from {:?} after listener was removed - closing", peer_id, packet.remote);
                    entry.peer.close_link(packet.remote);
                    return;
                }

                let socket_id = SocketId::next();
                debug!("{:?}: new incoming connection from {:?}", socket_id, packet.remote);
                self.directory.insert_connection(Arc::new(ConnectionShared::new(socket_id, peer_id, ConnectionStatus::Connected, Some(packet.remote))));
                entry.sockets.insert(packet.remote, socket_id);
                entry.references += 1;
                self.routes.insert(socket_id, (peer_id, packet.remote));
                socket_id
            }
            Ok(TransportEvent::ConnectionAttemptFailed | TransportEvent::AlreadyConnected | TransportEvent::NoFreeIncomingConnections) => {
                match entry.pending_outbound.take() {
                    Some((socket_id, _)) => {
                        debug!("{:?}: connection attempt failed with {:?}", socket_id, TransportEvent::try_from_primitive(tag));
                        socket_id
                    }
                    None => {
                        debug!("{:?}: connection failure without a pending connection - ignoring", peer_id);
                        return;
                    }
                }
            }
            Ok(TransportEvent::DisconnectionNotification | TransportEvent::ConnectionLost) => {
                if let Some(socket_id) = entry.sockets.remove(&packet.remote) {
                    self.routes.remove(&socket_id);
                    socket_id
                }
                else if matches!(entry.pending_outbound, Some((_, remote)) if remote == packet.remote) {
                    match entry.pending_outbound.take() {
                        Some((socket_id, _)) => socket_id,
                        None => return,
                    }
                }
                else {
                    debug!("{:?}: disconnect from {:?} without a connection - ignoring", peer_id, packet.remote);
                    return;
                }
            }
            Ok(TransportEvent::UnconnectedPong) => {
                trace!("{:?}: ignoring unconnected pong from {:?}", peer_id, packet.remote);
                return;
            }
            Err(_) => {
                debug!("{:?}: unknown transport event {} - ignoring", peer_id, tag);
                return;
            }
        };

        self.messages.send(&Message {
            peer_id,
            socket_id: Some(socket_id),
            remote: Some(packet.remote),
            payload: packet.data,
        });
    }

    async fn shut_down_peers(&mut self) {
        let now = Instant::now();
        for entry in self.peers.values_mut() {
            entry.peer.shutdown();
            entry.peer.update(now).await;
        }
        for (_, peer) in self.closing.iter_mut() {
            peer.update(now).await;
        }
        self.peers.clear();
        self.closing.clear();
    }
}

fn event_payload(event: TransportEvent) -> Bytes {
    Bytes::copy_from_slice(&[event.into()])
}

/// Resolves a host name or literal address, preferring IPv4 addresses
fn resolve(address: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let candidates = (address, port).to_socket_addrs()?.collect::<Vec<_>>();
    candidates.iter()
        .find(|a| a.is_ipv4())
        .or(candidates.first())
        .copied()
        .ok_or_else(|| anyhow!("no address for {}", address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rstest::rstest;
    use crate::command::{command_channel, CommandSender};
    use crate::message::{message_channel, MessageReceiver};
    use crate::transport::{Priority, Reliability};

    #[rstest]
    #[case::literal("127.0.0.1", "127.0.0.1:9000")]
    #[case::localhost("localhost", "127.0.0.1:9000")]
    #[case::v6("::1", "[::1]:9000")]
    fn test_resolve(#[case] address: &str, #[case] expected: &str) {
        assert_eq!(resolve(address, 9000).unwrap(), expected.parse().unwrap());
    }

    #[test]
    fn test_resolve_invalid() {
        assert!(resolve("", 9000).is_err());
        assert!(resolve("not a host name", 9000).is_err());
    }

    #[test]
    fn test_event_payload() {
        assert_eq!(event_payload(TransportEvent::ConnectionAttemptFailed).as_ref(), &[17]);
    }

    /// A network thread that is driven step by step from the test instead of running its loop
    struct Fixture {
        thread: NetworkThread,
        commands: CommandSender,
        outbound: mpsc::UnboundedSender<OutboundPacket>,
        messages: MessageReceiver,
        received: Vec<Message>,
        directory: Arc<Directory>,
    }

    impl Fixture {
        fn new(config: NetConfig) -> Fixture {
            let config = Arc::new(config);
            let wake = Arc::new(Notify::new());
            let (commands, command_receiver) = command_channel(config.command_queue_size, wake.clone());
            let (outbound, outbound_rx) = mpsc::unbounded_channel();
            let (message_sender, messages) = message_channel(config.message_queue_size);
            let directory = Arc::new(Directory::default());

            let thread = NetworkThread::new(NetworkThreadContext {
                config,
                commands: command_receiver,
                outbound: outbound_rx,
                messages: message_sender,
                directory: directory.clone(),
                wake,
                shutdown: Arc::new(AtomicBool::new(false)),
            });

            Fixture {
                thread,
                commands,
                outbound,
                messages,
                received: Vec::new(),
                directory,
            }
        }

        async fn command(&mut self, command: Command) {
            self.commands.send(command);
            self.thread.process_commands().await;
        }

        fn collect_messages(&mut self) {
            while let Some(message) = self.messages.try_recv() {
                self.received.push(message);
            }
        }

        /// one iteration of the network loop, without waiting
        async fn tick(&mut self) {
            self.thread.drain_outbound();
            self.thread.process_commands().await;
            self.thread.messages.flush_backlog();
            self.thread.update_peers(Instant::now()).await;
            self.thread.harvest();
            self.collect_messages();
        }

        async fn tick_until(&mut self, mut done: impl FnMut(&Fixture) -> bool) {
            for _ in 0..500 {
                if done(self) {
                    return;
                }
                self.tick().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("condition not reached");
        }

        fn event_socket(&self, peer_id: PeerId, event: TransportEvent) -> Option<SocketId> {
            let tag: u8 = event.into();
            self.received.iter()
                .find(|m| m.peer_id == peer_id && m.tag() == Some(tag))
                .and_then(|m| m.socket_id)
        }

        fn references(&self, peer_id: PeerId) -> Option<usize> {
            self.thread.peers.get(&peer_id).map(|e| e.references)
        }

        /// accepts on an ephemeral port, and connects to it from a second peer. Returns the
        ///  listening peer, the connecting peer, the connecting socket and the accepted socket.
        async fn connected_pair(&mut self) -> (PeerId, PeerId, SocketId, SocketId) {
            let listening = PeerId::next();
            self.command(Command::Accept { peer_id: listening, port: 0, max_connections: 4 }).await;
            let port = self.directory.local_addr(listening).unwrap().port();

            let connecting = PeerId::next();
            let socket_id = SocketId::next();
            self.directory.insert_connection(Arc::new(ConnectionShared::new(socket_id, connecting, ConnectionStatus::Connecting, None)));
            self.command(Command::Open { peer_id: connecting, socket_id, address: "127.0.0.1".to_string(), port }).await;

            self.tick_until(|f| {
                f.event_socket(connecting, TransportEvent::ConnectionRequestAccepted).is_some()
                    && f.event_socket(listening, TransportEvent::NewIncomingConnection).is_some()
            }).await;
            let accepted = self.event_socket(listening, TransportEvent::NewIncomingConnection).unwrap();
            (listening, connecting, socket_id, accepted)
        }
    }

    fn run(f: impl std::future::Future<Output = ()>) {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f);
    }

    #[test]
    fn test_peer_reference_counting() {
        run(async {
            let mut config = NetConfig::default();
            config.peer_shutdown_grace = Duration::from_millis(100);
            let mut fx = Fixture::new(config);

            let (listening, connecting, socket_id, accepted) = fx.connected_pair().await;
            assert_eq!(fx.references(listening), Some(2));
            assert_eq!(fx.references(connecting), Some(1));
            assert!(fx.thread.peers[&listening].listening);
            assert!(fx.directory.connection(accepted).is_some());

            fx.command(Command::RemovePeerReference { peer_id: listening, socket_id: None }).await;
            assert_eq!(fx.references(listening), Some(1));
            assert!(!fx.thread.peers[&listening].listening);
            assert!(fx.thread.closing.is_empty());

            fx.command(Command::RemovePeerReference { peer_id: listening, socket_id: Some(accepted) }).await;
            assert_eq!(fx.references(listening), None);
            assert_eq!(fx.thread.closing.len(), 1);
            assert!(fx.directory.local_addr(listening).is_none());
            assert!(fx.directory.connection(accepted).is_none());
            assert!(!fx.thread.routes.contains_key(&accepted));

            let shared = fx.directory.connection(socket_id).unwrap();
            fx.command(Command::RemovePeerReference { peer_id: connecting, socket_id: Some(socket_id) }).await;
            assert_eq!(fx.references(connecting), None);
            assert_eq!(fx.thread.closing.len(), 2);
            assert_eq!(shared.status(), ConnectionStatus::Disconnected);

            // removing a reference to a peer that is gone has no effect
            fx.command(Command::RemovePeerReference { peer_id: connecting, socket_id: None }).await;
            assert_eq!(fx.thread.closing.len(), 2);
        });
    }

    #[test]
    fn test_closing_peers_expire_after_grace_period() {
        run(async {
            let mut config = NetConfig::default();
            config.peer_shutdown_grace = Duration::from_millis(100);
            let mut fx = Fixture::new(config);

            let peer_id = PeerId::next();
            fx.command(Command::Accept { peer_id, port: 0, max_connections: 1 }).await;
            fx.command(Command::RemovePeerReference { peer_id, socket_id: None }).await;
            assert!(fx.thread.peers.is_empty());
            assert_eq!(fx.thread.closing.len(), 1);

            let released_at = fx.thread.closing[0].0;
            fx.thread.expire_closing_peers(released_at + Duration::from_millis(99));
            assert_eq!(fx.thread.closing.len(), 1);

            fx.thread.expire_closing_peers(released_at + Duration::from_millis(100));
            assert!(fx.thread.closing.is_empty());
        });
    }

    #[test]
    fn test_harvest_is_capped_per_peer() {
        run(async {
            let mut config = NetConfig::default();
            config.max_incoming_per_peer_update = 2;
            let mut fx = Fixture::new(config);

            let (listening, _, socket_id, _) = fx.connected_pair().await;
            fx.received.clear();

            for i in 0..5u8 {
                fx.outbound.send(OutboundPacket {
                    socket_id,
                    payload: Bytes::from(vec![200, i]),
                    priority: Priority::High,
                    reliability: Reliability::ReliableOrdered,
                    channel: 0,
                }).unwrap();
            }
            fx.thread.drain_outbound();

            for _ in 0..500 {
                fx.thread.update_peers(Instant::now()).await;
                if fx.thread.peers[&listening].peer.num_received() >= 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(fx.thread.peers[&listening].peer.num_received(), 5);

            let payloads = |fx: &Fixture| fx.received.iter().filter(|m| m.tag() == Some(200)).count();
            for expected in [2, 4, 5] {
                fx.thread.harvest();
                fx.collect_messages();
                assert_eq!(payloads(&fx), expected);
            }
        });
    }

    #[test]
    fn test_accept_on_used_port_is_reported() {
        run(async {
            let mut fx = Fixture::new(NetConfig::default());

            let first = PeerId::next();
            fx.command(Command::Accept { peer_id: first, port: 0, max_connections: 1 }).await;
            let port = fx.directory.local_addr(first).unwrap().port();

            let second = PeerId::next();
            fx.command(Command::Accept { peer_id: second, port, max_connections: 1 }).await;
            assert!(fx.thread.peers.contains_key(&first));
            assert!(!fx.thread.peers.contains_key(&second));

            fx.collect_messages();
            assert_eq!(fx.received.len(), 1);
            assert_eq!(fx.received[0].peer_id, second);
            assert_eq!(fx.received[0].socket_id, None);
            assert_eq!(fx.received[0].tag(), Some(u8::from(TransportEvent::ConnectionAttemptFailed)));
        });
    }
}
