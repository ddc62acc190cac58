use std::time::Duration;
use anyhow::bail;

/// Maximum length of the name that a peer answering discovery pings returns in its descriptor
pub const DISCOVERY_NAME_LEN: usize = 128;

#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Capacity in bytes of the queue carrying commands from the application thread to the
    ///  network thread. Commands are small, and the producer retries rather than failing if the
    ///  queue is full, so this does not need to be big.
    pub command_queue_size: usize,

    /// Capacity in bytes of the queue carrying received messages from the network thread to the
    ///  application thread. Messages that do not fit are buffered on the network thread, so
    ///  this is about avoiding allocations in the common case rather than about correctness.
    pub message_queue_size: usize,

    /// The maximum number of messages that a single call to `update()` dispatches, to bound the
    ///  time spent in `update()` under load
    pub max_messages_per_update: usize,

    /// The maximum number of received packets the network thread harvests from a single peer
    ///  per tick, so that a single noisy peer can not starve the others
    pub max_incoming_per_peer_update: usize,

    /// The network thread wakes up at least this often even if there are no commands to process
    pub network_tick: Duration,

    /// A peer that is no longer referenced is kept alive for this long to give data in flight a
    ///  chance to be sent before the socket is closed
    pub peer_shutdown_grace: Duration,

    /// This is the number of out-message buffers that will be pooled at a given time - buffers in
    ///  excess of this number are discarded when they are returned.
    pub message_pool_size: usize,

    /// The name returned to discovery pings, at most [DISCOVERY_NAME_LEN] bytes
    pub discovery_name: String,

    pub transport: TransportConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            command_queue_size: 64 * 1024,
            message_queue_size: 3 * 1024 * 1024,
            max_messages_per_update: 200,
            max_incoming_per_peer_update: 50,
            network_tick: Duration::from_millis(10),
            peer_shutdown_grace: Duration::from_millis(300),
            message_pool_size: 128,
            discovery_name: "sharing".to_string(),
            transport: TransportConfig::default(),
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command_queue_size < 1024 {
            bail!("command queue size must be at least 1024 bytes");
        }
        if self.message_queue_size < 4 * self.transport.max_datagram_size {
            bail!("message queue must be able to hold at least four datagrams");
        }
        if self.max_messages_per_update == 0 {
            bail!("max messages per update must not be zero");
        }
        if self.max_incoming_per_peer_update == 0 {
            bail!("max incoming packets per peer and update must not be zero");
        }
        if self.network_tick.is_zero() {
            bail!("network tick must not be zero");
        }
        if self.discovery_name.len() > DISCOVERY_NAME_LEN {
            bail!("discovery name must not be longer than {} bytes", DISCOVERY_NAME_LEN);
        }

        self.transport.validate()
    }
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// This is the payload size inside UDP packets that the transport assumes. Payloads are never
    ///  fragmented, so sending a message that does not fit into a single datagram (including
    ///  the transport's frame header) fails.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    pub max_datagram_size: usize,

    /// Interval between re-sending connection requests while connecting
    pub connect_retry_interval: Duration,

    /// Number of connection requests to send before giving up
    pub connect_attempts: u32,

    /// A connected link sends a ping if nothing was sent for this long
    pub keepalive_interval: Duration,

    /// A connected link is considered lost if nothing was received for this long
    pub link_timeout: Duration,

    /// Reliable frames are re-sent if they were not acknowledged after this interval
    pub resend_interval: Duration,

    /// Received frames whose sequence number (or ordering index) is this far or further ahead of
    ///  the first missing one are dropped without acknowledgement. This bounds the memory a
    ///  remote peer can make us hold on to.
    pub receive_window_size: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_datagram_size: 1472,
            connect_retry_interval: Duration::from_millis(500),
            connect_attempts: 6,
            keepalive_interval: Duration::from_secs(1),
            link_timeout: Duration::from_secs(10),
            resend_interval: Duration::from_millis(100),
            receive_window_size: 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 100 {
            bail!("datagram size is too small");
        }
        if self.max_datagram_size > 65507 {
            bail!("datagram size exceeds the maximum UDP payload");
        }
        if self.connect_attempts == 0 {
            bail!("there must be at least one connection attempt");
        }
        if self.receive_window_size == 0 {
            bail!("receive window size must not be zero");
        }
        if self.link_timeout <= self.keepalive_interval {
            bail!("link timeout must be longer than the keepalive interval");
        }

        Ok(())
    }
}
