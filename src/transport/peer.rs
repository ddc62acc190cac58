use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};
use crate::config::TransportConfig;
use crate::transport::event::TransportEvent;
use crate::transport::frame::{DataFrame, Frame};
use crate::transport::link::{Link, LinkDirection, LinkEvent, LinkState};
use crate::transport::{Priority, Reliability, USER_PACKET_START};

/// upper bound for datagrams read from the socket in a single update, so that a flood of
///  incoming traffic can not stall the caller indefinitely
const MAX_DATAGRAMS_PER_UPDATE: usize = 1024;

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// A received application payload or a link event, see [TransportEvent]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub remote: SocketAddr,
    pub data: Bytes,
}

impl Packet {
    fn event(remote: SocketAddr, event: TransportEvent) -> Packet {
        Packet {
            remote,
            data: Bytes::copy_from_slice(&[event.into()]),
        }
    }
}

/// One UDP socket with all links going through it. A Peer is driven by calling [Peer::update]
///  periodically, which does all socket I/O. Received payloads and link events are then
///  available through [Peer::receive].
pub struct Peer {
    socket: UdpSocket,
    config: Arc<TransportConfig>,
    links: FxHashMap<SocketAddr, Link>,
    max_incoming: usize,
    offline_ping_response: Option<Bytes>,
    unconnected_outbox: VecDeque<(SocketAddr, Frame)>,
    inbox: VecDeque<Packet>,
    recv_buf: Vec<u8>,
    send_buf: BytesMut,
}

impl Peer {
    pub async fn bind(addr: SocketAddr, config: Arc<TransportConfig>) -> anyhow::Result<Peer> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound peer socket to {:?}", socket.local_addr()?);

        Ok(Peer {
            socket,
            config,
            links: Default::default(),
            max_incoming: 0,
            offline_ping_response: None,
            unconnected_outbox: Default::default(),
            inbox: Default::default(),
            recv_buf: vec![0u8; RECEIVE_BUFFER_SIZE],
            send_buf: BytesMut::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The number of incoming connections this peer accepts. Zero (the default) refuses all
    ///  incoming connection requests.
    pub fn set_max_incoming(&mut self, max_incoming: usize) {
        self.max_incoming = max_incoming;
    }

    /// If set, unconnected pings are answered with this descriptor
    pub fn set_offline_ping_response(&mut self, response: Option<Bytes>) {
        self.offline_ping_response = response;
    }

    pub fn connect(&mut self, remote: SocketAddr, now: Instant) {
        if let Some(link) = self.links.get(&remote) {
            if link.state() != LinkState::Closed {
                debug!("there is already a link to {:?}", remote);
                self.inbox.push_back(Packet::event(remote, TransportEvent::AlreadyConnected));
                return;
            }
        }

        debug!("connecting to {:?}", remote);
        self.links.insert(remote, Link::outgoing(remote, self.config.clone(), now));
    }

    pub fn ping_unconnected(&mut self, remote: SocketAddr) {
        self.unconnected_outbox.push_back((remote, Frame::UnconnectedPing));
    }

    /// Queues a payload for sending on the next [Peer::update]. Payloads that do not fit into
    ///  a single datagram are rejected.
    pub fn send(&mut self, remote: SocketAddr, payload: Bytes, priority: Priority, reliability: Reliability, channel: u8) -> bool {
        if payload.len() + DataFrame::MAX_HEADER_LEN > self.config.max_datagram_size {
            warn!("payload of {} bytes to {:?} exceeds the maximum datagram size of {} - dropping", payload.len(), remote, self.config.max_datagram_size);
            return false;
        }

        match self.links.get_mut(&remote) {
            Some(link) => link.queue_data(payload, priority, reliability, channel),
            None => {
                debug!("no link to {:?} - dropping payload", remote);
                false
            }
        }
    }

    pub fn close_link(&mut self, remote: SocketAddr) {
        if let Some(link) = self.links.get_mut(&remote) {
            link.close();
        }
    }

    /// Closes all links, refusing further incoming connections
    pub fn shutdown(&mut self) {
        self.max_incoming = 0;
        self.offline_ping_response = None;
        for link in self.links.values_mut() {
            link.close();
        }
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    #[cfg(test)]
    pub(crate) fn num_received(&self) -> usize {
        self.inbox.len()
    }

    pub fn receive(&mut self) -> Option<Packet> {
        self.inbox.pop_front()
    }

    /// Does all pending socket I/O: reads available datagrams, advances the links' timers and
    ///  sends everything that is due
    pub async fn update(&mut self, now: Instant) {
        self.receive_datagrams(now);

        let mut outgoing: Vec<(SocketAddr, Frame)> = self.unconnected_outbox.drain(..).collect();
        let mut frames = Vec::new();
        for link in self.links.values_mut() {
            link.on_timer(now);
            link.poll_transmit(now, &mut frames);
            outgoing.extend(frames.drain(..).map(|f| (link.remote(), f)));

            while let Some(evt) = link.poll_event() {
                let packet = match evt {
                    LinkEvent::Connected => Packet::event(link.remote(), TransportEvent::ConnectionRequestAccepted),
                    LinkEvent::IncomingConnected => Packet::event(link.remote(), TransportEvent::NewIncomingConnection),
                    LinkEvent::AttemptFailed => Packet::event(link.remote(), TransportEvent::ConnectionAttemptFailed),
                    LinkEvent::Refused => Packet::event(link.remote(), TransportEvent::NoFreeIncomingConnections),
                    LinkEvent::RemoteDisconnected => Packet::event(link.remote(), TransportEvent::DisconnectionNotification),
                    LinkEvent::Lost => Packet::event(link.remote(), TransportEvent::ConnectionLost),
                    LinkEvent::Payload(data) => {
                        if data.first().map(|&b| b < USER_PACKET_START).unwrap_or(true) {
                            debug!("payload from {:?} does not start with an application message id - dropping", link.remote());
                            continue;
                        }
                        Packet { remote: link.remote(), data }
                    }
                };
                self.inbox.push_back(packet);
            }
        }
        self.links.retain(|_, link| !link.is_finished());

        for (to, frame) in outgoing {
            self.send_frame(to, &frame).await;
        }
    }

    async fn send_frame(&mut self, to: SocketAddr, frame: &Frame) {
        self.send_buf.clear();
        frame.ser(&mut self.send_buf);

        trace!("sending {:?} to {:?}", frame, to);
        if let Err(e) = self.socket.send_to(&self.send_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn receive_datagrams(&mut self, now: Instant) {
        for _ in 0..MAX_DATAGRAMS_PER_UPDATE {
            match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok((num_read, from)) => {
                    let data = Bytes::copy_from_slice(&self.recv_buf[..num_read]);
                    self.on_datagram(from, data, now);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return;
                }
                Err(e) => {
                    // e.g. ICMP 'port unreachable' reported on the next read on some platforms
                    debug!("socket error: {}", e);
                }
            }
        }
    }

    fn on_datagram(&mut self, from: SocketAddr, data: Bytes, now: Instant) {
        let frame = match Frame::deser(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("received unparsable datagram from {:?}: {} - dropping", from, e);
                return;
            }
        };

        match frame {
            Frame::UnconnectedPing => {
                if let Some(response) = &self.offline_ping_response {
                    trace!("answering unconnected ping from {:?}", from);
                    self.unconnected_outbox.push_back((from, Frame::UnconnectedPong(response.clone())));
                }
            }
            Frame::UnconnectedPong(descriptor) => {
                let mut data = BytesMut::with_capacity(descriptor.len() + 1);
                data.extend_from_slice(&[TransportEvent::UnconnectedPong.into()]);
                data.extend_from_slice(&descriptor);
                self.inbox.push_back(Packet { remote: from, data: data.freeze() });
            }
            Frame::ConnectRequest if !self.links.contains_key(&from) => {
                self.on_connect_request(from, now);
            }
            frame => {
                match self.links.get_mut(&from) {
                    Some(link) => link.on_frame(frame, now),
                    None => trace!("received {:?} from {:?} without a link - dropping", frame, from),
                }
            }
        }
    }

    fn on_connect_request(&mut self, from: SocketAddr, now: Instant) {
        let num_incoming = self.links.values()
            .filter(|l| l.direction() == LinkDirection::Incoming && l.state() != LinkState::Closed)
            .count();

        if num_incoming < self.max_incoming {
            debug!("accepting incoming connection from {:?}", from);
            self.links.insert(from, Link::incoming(from, self.config.clone(), now));
        }
        else {
            debug!("refusing incoming connection from {:?}: {} of {} incoming slots are used", from, num_incoming, self.max_incoming);
            self.unconnected_outbox.push_back((from, Frame::ConnectRefused));
        }
    }
}
