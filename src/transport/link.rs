use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};
use crate::config::TransportConfig;
use crate::transport::frame::{DataFrame, Frame, MAX_ACKS_PER_FRAME};
use crate::transport::{is_newer, Priority, Reliability, NUM_ORDERING_CHANNELS};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkDirection {
    Outgoing,
    Incoming,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    /// the remote peer accepted our connection request
    Connected,
    /// a remote peer connected to us
    IncomingConnected,
    /// all connection requests went unanswered
    AttemptFailed,
    /// the remote peer has no free slots for incoming connections
    Refused,
    RemoteDisconnected,
    Lost,
    Payload(Bytes),
}

struct InFlight {
    frame: DataFrame,
    last_sent: Instant,
}

#[derive(Default)]
struct OrderingChannel {
    next_send_ordered: u32,
    next_send_sequenced: u32,
    next_recv_ordered: u32,
    holdback: FxHashMap<u32, Bytes>,
    newest_recv_sequenced: Option<u32>,
}

/// Tracks which reliable sequence numbers were received to filter duplicates: everything before
///  `base` was received, and `above` holds received numbers beyond the first gap.
#[derive(Default)]
struct ReceiveWindow {
    base: u32,
    above: FxHashSet<u32>,
}

impl ReceiveWindow {
    /// `seq` is `window_size` or more ahead of the first missing sequence number
    fn is_beyond(&self, seq: u32, window_size: u32) -> bool {
        !is_newer(self.base, seq) && seq.wrapping_sub(self.base) >= window_size
    }

    /// returns `true` if `seq` was not received before
    fn register(&mut self, seq: u32) -> bool {
        if is_newer(self.base, seq) {
            return false;
        }
        if !self.above.insert(seq) {
            return false;
        }
        while self.above.remove(&self.base) {
            self.base = self.base.wrapping_add(1);
        }
        true
    }
}

/// The protocol state of the connection to one remote address. A Link does no I/O itself, it is
///  fed received frames and the current time, and it produces frames to send and [LinkEvent]s.
pub struct Link {
    remote: SocketAddr,
    direction: LinkDirection,
    state: LinkState,
    config: Arc<TransportConfig>,

    connect_requests_sent: u32,
    last_connect_request: Option<Instant>,
    last_received: Instant,
    last_sent: Instant,

    control: VecDeque<Frame>,
    send_queues: [VecDeque<DataFrame>; 4],
    in_flight: FxHashMap<u32, InFlight>,
    next_reliable_seq: u32,
    pending_acks: Vec<u32>,
    received: ReceiveWindow,
    channels: Vec<OrderingChannel>,
    disconnect_pending: bool,

    events: VecDeque<LinkEvent>,
}

impl Link {
    fn new(remote: SocketAddr, direction: LinkDirection, state: LinkState, config: Arc<TransportConfig>, now: Instant) -> Link {
        Link {
            remote,
            direction,
            state,
            config,
            connect_requests_sent: 0,
            last_connect_request: None,
            last_received: now,
            last_sent: now,
            control: Default::default(),
            send_queues: Default::default(),
            in_flight: Default::default(),
            next_reliable_seq: 0,
            pending_acks: Default::default(),
            received: Default::default(),
            channels: (0..NUM_ORDERING_CHANNELS).map(|_| OrderingChannel::default()).collect(),
            disconnect_pending: false,
            events: Default::default(),
        }
    }

    /// A link that starts sending connection requests to `remote`
    pub fn outgoing(remote: SocketAddr, config: Arc<TransportConfig>, now: Instant) -> Link {
        Self::new(remote, LinkDirection::Outgoing, LinkState::Connecting, config, now)
    }

    /// A link created in response to a connection request from `remote`
    pub fn incoming(remote: SocketAddr, config: Arc<TransportConfig>, now: Instant) -> Link {
        let mut result = Self::new(remote, LinkDirection::Incoming, LinkState::Connected, config, now);
        result.control.push_back(Frame::ConnectAccept);
        result.events.push_back(LinkEvent::IncomingConnected);
        result
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// A closed link that has nothing left to send can be discarded
    pub fn is_finished(&self) -> bool {
        self.state == LinkState::Closed
            && !self.disconnect_pending
            && self.control.is_empty()
            && self.pending_acks.is_empty()
            && self.send_queues.iter().all(|q| q.is_empty())
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    pub fn queue_data(&mut self, payload: Bytes, priority: Priority, reliability: Reliability, channel: u8) -> bool {
        if self.state != LinkState::Connected {
            debug!("link to {:?} is not connected - dropping payload", self.remote);
            return false;
        }
        let Some(ordering_channel) = self.channels.get_mut(channel as usize) else {
            debug!("invalid ordering channel {} - dropping payload", channel);
            return false;
        };

        let reliable_seq = if reliability.is_reliable() {
            let seq = self.next_reliable_seq;
            self.next_reliable_seq = seq.wrapping_add(1);
            Some(seq)
        }
        else {
            None
        };

        let order_index = if reliability.is_ordered() {
            let idx = ordering_channel.next_send_ordered;
            ordering_channel.next_send_ordered = idx.wrapping_add(1);
            Some(idx)
        }
        else if reliability.is_sequenced() {
            let idx = ordering_channel.next_send_sequenced;
            ordering_channel.next_send_sequenced = idx.wrapping_add(1);
            Some(idx)
        }
        else {
            None
        };

        self.send_queues[u8::from(priority) as usize].push_back(DataFrame {
            reliability,
            channel,
            reliable_seq,
            order_index,
            payload,
        });
        true
    }

    /// Closes the link locally. Payloads queued before are still sent, followed by a disconnect
    ///  notification to the remote peer.
    pub fn close(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        debug!("closing link to {:?}", self.remote);
        self.state = LinkState::Closed;
        self.disconnect_pending = true;
    }

    fn terminate(&mut self, event: LinkEvent) {
        self.state = LinkState::Closed;
        self.control.clear();
        self.send_queues.iter_mut().for_each(|q| q.clear());
        self.in_flight.clear();
        self.pending_acks.clear();
        self.events.push_back(event);
    }

    pub fn on_frame(&mut self, frame: Frame, now: Instant) {
        if self.state == LinkState::Closed {
            trace!("link to {:?} is closed - ignoring {:?}", self.remote, frame);
            return;
        }
        self.last_received = now;

        match frame {
            Frame::ConnectRequest => {
                if self.direction == LinkDirection::Incoming {
                    // our accept got lost
                    self.control.push_back(Frame::ConnectAccept);
                }
            }
            Frame::ConnectAccept => {
                self.on_accepted();
            }
            Frame::ConnectRefused => {
                if self.state == LinkState::Connecting {
                    debug!("connection to {:?} was refused", self.remote);
                    self.terminate(LinkEvent::Refused);
                }
            }
            Frame::Data(data) => {
                // data from the remote peer implies that it accepted our request
                self.on_accepted();
                self.on_data(data);
            }
            Frame::Ack(seqs) => {
                for seq in seqs {
                    self.in_flight.remove(&seq);
                }
            }
            Frame::Disconnect => {
                debug!("remote peer {:?} disconnected", self.remote);
                self.terminate(LinkEvent::RemoteDisconnected);
            }
            Frame::Ping => {
                self.control.push_back(Frame::Pong);
            }
            Frame::Pong => {}
            Frame::UnconnectedPing | Frame::UnconnectedPong(_) => {
                debug!("unconnected frame routed to link {:?} - ignoring", self.remote);
            }
        }
    }

    fn on_accepted(&mut self) {
        if self.state == LinkState::Connecting {
            debug!("connected to {:?}", self.remote);
            self.state = LinkState::Connected;
            self.events.push_back(LinkEvent::Connected);
        }
    }

    fn on_data(&mut self, data: DataFrame) {
        let window_size = self.config.receive_window_size;
        if let Some(seq) = data.reliable_seq {
            if self.received.is_beyond(seq, window_size) {
                debug!("frame #{} from {:?} is beyond the receive window - dropping", seq, self.remote);
                return;
            }
            self.pending_acks.push(seq);
            if !self.received.register(seq) {
                trace!("duplicate frame #{} from {:?}", seq, self.remote);
                return;
            }
        }

        let channel = &mut self.channels[data.channel as usize];
        match (data.reliability, data.order_index) {
            (Reliability::Unreliable, _) | (Reliability::Reliable, _) => {
                self.events.push_back(LinkEvent::Payload(data.payload));
            }
            (Reliability::UnreliableSequenced, Some(idx)) | (Reliability::ReliableSequenced, Some(idx)) => {
                let is_newest = channel.newest_recv_sequenced
                    .map(|newest| is_newer(idx, newest))
                    .unwrap_or(true);
                if is_newest {
                    channel.newest_recv_sequenced = Some(idx);
                    self.events.push_back(LinkEvent::Payload(data.payload));
                }
                else {
                    trace!("dropping outdated sequenced payload #{} on channel {}", idx, data.channel);
                }
            }
            (Reliability::ReliableOrdered, Some(idx)) => {
                if idx == channel.next_recv_ordered {
                    self.events.push_back(LinkEvent::Payload(data.payload));
                    channel.next_recv_ordered = idx.wrapping_add(1);
                    while let Some(payload) = channel.holdback.remove(&channel.next_recv_ordered) {
                        self.events.push_back(LinkEvent::Payload(payload));
                        channel.next_recv_ordered = channel.next_recv_ordered.wrapping_add(1);
                    }
                }
                else if idx.wrapping_sub(channel.next_recv_ordered) >= window_size && is_newer(idx, channel.next_recv_ordered) {
                    debug!("ordered payload #{} on channel {} is beyond the receive window - dropping", idx, data.channel);
                }
                else if is_newer(idx, channel.next_recv_ordered) {
                    trace!("holding back ordered payload #{} on channel {}", idx, data.channel);
                    channel.holdback.insert(idx, data.payload);
                }
            }
            (reliability, None) => {
                debug!("{:?} payload without ordering index - dropping", reliability);
            }
        }
    }

    /// Advances timers: connection attempts, link timeout and keepalive
    pub fn on_timer(&mut self, now: Instant) {
        match self.state {
            LinkState::Connecting => {
                let retry_due = self.last_connect_request
                    .map(|t| now.saturating_duration_since(t) >= self.config.connect_retry_interval)
                    .unwrap_or(false);
                if retry_due && self.connect_requests_sent >= self.config.connect_attempts {
                    debug!("no response from {:?} after {} connection requests", self.remote, self.connect_requests_sent);
                    self.terminate(LinkEvent::AttemptFailed);
                }
            }
            LinkState::Connected => {
                if now.saturating_duration_since(self.last_received) > self.config.link_timeout {
                    debug!("link to {:?} timed out", self.remote);
                    self.terminate(LinkEvent::Lost);
                }
                else if now.saturating_duration_since(self.last_sent) >= self.config.keepalive_interval
                    && !self.control.contains(&Frame::Ping)
                {
                    self.control.push_back(Frame::Ping);
                }
            }
            LinkState::Closed => {}
        }
    }

    /// Collects all frames that are due for sending: connection requests, control frames, ACKs,
    ///  queued payloads in priority order and finally re-sends of unacknowledged payloads
    pub fn poll_transmit(&mut self, now: Instant, out: &mut Vec<Frame>) {
        let initial_len = out.len();

        if self.state == LinkState::Connecting && self.direction == LinkDirection::Outgoing {
            let request_due = self.last_connect_request
                .map(|t| now.saturating_duration_since(t) >= self.config.connect_retry_interval)
                .unwrap_or(true);
            if request_due && self.connect_requests_sent < self.config.connect_attempts {
                trace!("sending connection request #{} to {:?}", self.connect_requests_sent + 1, self.remote);
                out.push(Frame::ConnectRequest);
                self.connect_requests_sent += 1;
                self.last_connect_request = Some(now);
            }
        }

        out.extend(self.control.drain(..));

        for chunk in self.pending_acks.chunks(MAX_ACKS_PER_FRAME) {
            out.push(Frame::Ack(chunk.to_vec()));
        }
        self.pending_acks.clear();

        for queue in self.send_queues.iter_mut() {
            for data in queue.drain(..) {
                if let Some(seq) = data.reliable_seq {
                    self.in_flight.insert(seq, InFlight { frame: data.clone(), last_sent: now });
                }
                out.push(Frame::Data(data));
            }
        }

        if self.state == LinkState::Connected {
            for in_flight in self.in_flight.values_mut() {
                if now.saturating_duration_since(in_flight.last_sent) >= self.config.resend_interval {
                    trace!("re-sending unacknowledged frame {:?} to {:?}", in_flight.frame.reliable_seq, self.remote);
                    in_flight.last_sent = now;
                    out.push(Frame::Data(in_flight.frame.clone()));
                }
            }
        }

        if self.disconnect_pending {
            out.push(Frame::Disconnect);
            self.disconnect_pending = false;
            self.in_flight.clear();
        }

        if out.len() > initial_len {
            self.last_sent = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> Arc<TransportConfig> {
        Arc::new(TransportConfig::default())
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn transmit(link: &mut Link, now: Instant) -> Vec<Frame> {
        let mut out = Vec::new();
        link.poll_transmit(now, &mut out);
        out
    }

    fn events(link: &mut Link) -> Vec<LinkEvent> {
        let mut result = Vec::new();
        while let Some(evt) = link.poll_event() {
            result.push(evt);
        }
        result
    }

    fn payloads(link: &mut Link) -> Vec<Bytes> {
        events(link).into_iter()
            .filter_map(|e| match e {
                LinkEvent::Payload(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn deliver(frames: Vec<Frame>, to: &mut Link, now: Instant) {
        for frame in frames {
            to.on_frame(frame, now);
        }
    }

    fn connected_pair(now: Instant) -> (Link, Link) {
        let mut client = Link::outgoing(addr(2), config(), now);
        let mut server = Link::incoming(addr(1), config(), now);

        assert_eq!(transmit(&mut client, now), vec![Frame::ConnectRequest]);
        assert_eq!(transmit(&mut server, now), vec![Frame::ConnectAccept]);
        client.on_frame(Frame::ConnectAccept, now);

        assert_eq!(events(&mut client), vec![LinkEvent::Connected]);
        assert_eq!(events(&mut server), vec![LinkEvent::IncomingConnected]);
        (client, server)
    }

    #[test]
    fn test_connect() {
        let now = Instant::now();
        let (client, server) = connected_pair(now);
        assert_eq!(client.state(), LinkState::Connected);
        assert_eq!(client.direction(), LinkDirection::Outgoing);
        assert_eq!(server.state(), LinkState::Connected);
        assert_eq!(server.direction(), LinkDirection::Incoming);
    }

    #[test]
    fn test_connect_attempts_exhausted() {
        let start = Instant::now();
        let mut client = Link::outgoing(addr(2), config(), start);

        for i in 0..6 {
            let now = start + Duration::from_millis(500 * i);
            client.on_timer(now);
            assert_eq!(transmit(&mut client, now), vec![Frame::ConnectRequest]);
        }

        let now = start + Duration::from_millis(2999);
        client.on_timer(now);
        assert!(transmit(&mut client, now).is_empty());
        assert_eq!(client.state(), LinkState::Connecting);

        client.on_timer(start + Duration::from_millis(3000));
        assert_eq!(client.state(), LinkState::Closed);
        assert_eq!(events(&mut client), vec![LinkEvent::AttemptFailed]);
        assert!(client.is_finished());
    }

    #[test]
    fn test_connect_request_is_not_repeated_early() {
        let now = Instant::now();
        let mut client = Link::outgoing(addr(2), config(), now);
        assert_eq!(transmit(&mut client, now), vec![Frame::ConnectRequest]);
        assert!(transmit(&mut client, now + Duration::from_millis(499)).is_empty());
        assert_eq!(transmit(&mut client, now + Duration::from_millis(500)), vec![Frame::ConnectRequest]);
    }

    #[test]
    fn test_refused() {
        let now = Instant::now();
        let mut client = Link::outgoing(addr(2), config(), now);
        transmit(&mut client, now);
        client.on_frame(Frame::ConnectRefused, now);
        assert_eq!(client.state(), LinkState::Closed);
        assert_eq!(events(&mut client), vec![LinkEvent::Refused]);
    }

    #[test]
    fn test_lost_accept_is_repeated() {
        let now = Instant::now();
        let mut server = Link::incoming(addr(1), config(), now);
        assert_eq!(transmit(&mut server, now), vec![Frame::ConnectAccept]);

        server.on_frame(Frame::ConnectRequest, now);
        assert_eq!(transmit(&mut server, now), vec![Frame::ConnectAccept]);
    }

    #[test]
    fn test_data_implies_accept() {
        let now = Instant::now();
        let (_, mut server) = connected_pair(now);

        let mut late_client = Link::outgoing(addr(2), config(), now);
        transmit(&mut late_client, now);

        assert!(server.queue_data(Bytes::from_static(&[200]), Priority::High, Reliability::Reliable, 0));
        deliver(transmit(&mut server, now), &mut late_client, now);
        assert_eq!(events(&mut late_client), vec![LinkEvent::Connected, LinkEvent::Payload(Bytes::from_static(&[200]))]);
    }

    #[test]
    fn test_not_connected_rejects_data() {
        let now = Instant::now();
        let mut client = Link::outgoing(addr(2), config(), now);
        assert!(!client.queue_data(Bytes::from_static(&[200]), Priority::High, Reliability::Reliable, 0));
    }

    #[test]
    fn test_invalid_channel_rejects_data() {
        let now = Instant::now();
        let (mut client, _) = connected_pair(now);
        assert!(!client.queue_data(Bytes::from_static(&[200]), Priority::High, Reliability::Reliable, 32));
    }

    #[test]
    fn test_reliable_resend_until_ack() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        assert!(client.queue_data(Bytes::from_static(&[200, 1]), Priority::Medium, Reliability::Reliable, 0));
        let sent = transmit(&mut client, now);
        assert_eq!(sent.len(), 1);

        // not yet due for resending
        assert!(transmit(&mut client, now + Duration::from_millis(99)).is_empty());

        let t1 = now + Duration::from_millis(100);
        let resent = transmit(&mut client, t1);
        assert_eq!(resent, sent);

        deliver(resent, &mut server, t1);
        assert_eq!(payloads(&mut server), vec![Bytes::from_static(&[200, 1])]);

        let acks = transmit(&mut server, t1);
        assert_eq!(acks, vec![Frame::Ack(vec![0])]);
        deliver(acks, &mut client, t1);

        assert!(transmit(&mut client, t1 + Duration::from_millis(500)).is_empty());
    }

    #[test]
    fn test_duplicates_are_filtered_and_acked() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        client.queue_data(Bytes::from_static(&[200]), Priority::High, Reliability::Reliable, 0);
        let sent = transmit(&mut client, now);

        deliver(sent.clone(), &mut server, now);
        deliver(sent, &mut server, now);

        assert_eq!(payloads(&mut server), vec![Bytes::from_static(&[200])]);
        assert_eq!(transmit(&mut server, now), vec![Frame::Ack(vec![0, 0])]);
    }

    #[test]
    fn test_unreliable_is_not_resent() {
        let now = Instant::now();
        let (mut client, _) = connected_pair(now);

        client.queue_data(Bytes::from_static(&[200]), Priority::High, Reliability::Unreliable, 0);
        assert_eq!(transmit(&mut client, now).len(), 1);
        assert!(transmit(&mut client, now + Duration::from_millis(150)).is_empty());
    }

    #[test]
    fn test_ordered_holdback() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        for i in 0..3u8 {
            client.queue_data(Bytes::from(vec![200, i]), Priority::High, Reliability::ReliableOrdered, 5);
        }
        let mut sent = transmit(&mut client, now);
        assert_eq!(sent.len(), 3);

        let first = sent.remove(0);
        deliver(sent, &mut server, now);
        assert!(payloads(&mut server).is_empty());

        server.on_frame(first, now);
        assert_eq!(payloads(&mut server), vec![
            Bytes::from_static(&[200, 0]),
            Bytes::from_static(&[200, 1]),
            Bytes::from_static(&[200, 2]),
        ]);
    }

    #[test]
    fn test_ordering_is_per_channel() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        client.queue_data(Bytes::from_static(&[200, 0]), Priority::High, Reliability::ReliableOrdered, 1);
        client.queue_data(Bytes::from_static(&[200, 1]), Priority::High, Reliability::ReliableOrdered, 2);
        let mut sent = transmit(&mut client, now);

        // the second payload is on a different channel, so it is not held back
        server.on_frame(sent.remove(1), now);
        assert_eq!(payloads(&mut server), vec![Bytes::from_static(&[200, 1])]);
    }

    #[test]
    fn test_sequenced_drops_outdated() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        for i in 0..3u8 {
            client.queue_data(Bytes::from(vec![200, i]), Priority::High, Reliability::UnreliableSequenced, 0);
        }
        let sent = transmit(&mut client, now);

        server.on_frame(sent[0].clone(), now);
        server.on_frame(sent[2].clone(), now);
        server.on_frame(sent[1].clone(), now);

        assert_eq!(payloads(&mut server), vec![
            Bytes::from_static(&[200, 0]),
            Bytes::from_static(&[200, 2]),
        ]);
    }

    #[test]
    fn test_priority_order() {
        let now = Instant::now();
        let (mut client, _) = connected_pair(now);

        client.queue_data(Bytes::from_static(&[200, 3]), Priority::Low, Reliability::Unreliable, 0);
        client.queue_data(Bytes::from_static(&[200, 2]), Priority::Medium, Reliability::Unreliable, 0);
        client.queue_data(Bytes::from_static(&[200, 0]), Priority::Immediate, Reliability::Unreliable, 0);
        client.queue_data(Bytes::from_static(&[200, 1]), Priority::High, Reliability::Unreliable, 0);

        let order = transmit(&mut client, now).into_iter()
            .map(|f| match f {
                Frame::Data(d) => d.payload[1],
                f => panic!("unexpected frame {:?}", f),
            })
            .collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_keepalive_and_pong() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        let t1 = now + Duration::from_secs(1);
        client.on_timer(t1);
        let pings = transmit(&mut client, t1);
        assert_eq!(pings, vec![Frame::Ping]);

        deliver(pings, &mut server, t1);
        assert_eq!(transmit(&mut server, t1), vec![Frame::Pong]);
    }

    #[test]
    fn test_timeout() {
        let now = Instant::now();
        let (mut client, _) = connected_pair(now);

        client.on_timer(now + Duration::from_secs(10));
        assert_eq!(client.state(), LinkState::Connected);

        client.on_timer(now + Duration::from_millis(10_001));
        assert_eq!(client.state(), LinkState::Closed);
        assert_eq!(events(&mut client), vec![LinkEvent::Lost]);
    }

    #[test]
    fn test_close_flushes_then_disconnects() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        client.queue_data(Bytes::from_static(&[200]), Priority::Low, Reliability::ReliableOrdered, 0);
        client.close();
        assert_eq!(client.state(), LinkState::Closed);
        assert!(!client.is_finished());
        assert!(!client.queue_data(Bytes::from_static(&[201]), Priority::Low, Reliability::Reliable, 0));

        let sent = transmit(&mut client, now);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], Frame::Disconnect);
        assert!(client.is_finished());

        deliver(sent, &mut server, now);
        assert_eq!(events(&mut server), vec![
            LinkEvent::Payload(Bytes::from_static(&[200])),
            LinkEvent::RemoteDisconnected,
        ]);
        assert_eq!(server.state(), LinkState::Closed);
    }

    #[test]
    fn test_closed_link_ignores_frames() {
        let now = Instant::now();
        let (mut client, mut server) = connected_pair(now);

        client.queue_data(Bytes::from_static(&[200]), Priority::Low, Reliability::Reliable, 0);
        let sent = transmit(&mut client, now);

        server.close();
        deliver(sent, &mut server, now);
        assert!(events(&mut server).is_empty());
    }

    #[test]
    fn test_receive_window() {
        let mut window = ReceiveWindow::default();
        assert!(window.register(1));
        assert!(!window.register(1));
        assert_eq!(window.base, 0);

        assert!(window.register(0));
        assert_eq!(window.base, 2);
        assert!(window.above.is_empty());
        assert!(!window.register(0));
    }

    #[test]
    fn test_receive_window_bounds() {
        let mut window = ReceiveWindow::default();
        assert!(window.register(5));
        assert!(!window.is_beyond(1023, 1024));
        assert!(window.is_beyond(1024, 1024));
        assert!(window.is_beyond(0x7fff_ffff, 1024));
        // already received, i.e. a duplicate rather than too far ahead
        assert!(!window.is_beyond(u32::MAX, 1024));
    }

    fn data_frame(reliability: Reliability, reliable_seq: Option<u32>, order_index: Option<u32>, payload: &'static [u8]) -> Frame {
        Frame::Data(DataFrame {
            reliability,
            channel: 0,
            reliable_seq,
            order_index,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn test_frames_beyond_receive_window_are_dropped() {
        let now = Instant::now();
        let (_, mut server) = connected_pair(now);

        server.on_frame(data_frame(Reliability::Reliable, Some(1024), None, &[200, 1]), now);
        server.on_frame(data_frame(Reliability::Reliable, Some(0x4000_0000), None, &[200, 2]), now);
        assert!(payloads(&mut server).is_empty());
        assert!(server.received.above.is_empty());
        assert!(transmit(&mut server, now).is_empty());

        server.on_frame(data_frame(Reliability::Reliable, Some(1023), None, &[200, 3]), now);
        assert_eq!(payloads(&mut server), vec![Bytes::from_static(&[200, 3])]);
        assert_eq!(transmit(&mut server, now), vec![Frame::Ack(vec![1023])]);
    }

    #[test]
    fn test_holdback_is_bounded_by_receive_window() {
        let now = Instant::now();
        let (_, mut server) = connected_pair(now);

        server.on_frame(data_frame(Reliability::ReliableOrdered, Some(0), Some(5000), &[200, 1]), now);
        server.on_frame(data_frame(Reliability::ReliableOrdered, Some(1), Some(3), &[200, 2]), now);
        assert!(payloads(&mut server).is_empty());
        assert_eq!(server.channels[0].holdback.len(), 1);
        assert!(server.channels[0].holdback.contains_key(&3));
    }
}
