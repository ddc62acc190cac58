use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Link events, delivered as single-byte packets. All ids are below
///  [crate::transport::USER_PACKET_START].
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum TransportEvent {
    /// An outgoing connection attempt was accepted by the remote peer
    ConnectionRequestAccepted = 16,
    /// An outgoing connection attempt got no response
    ConnectionAttemptFailed = 17,
    /// There already is a link to the remote address
    AlreadyConnected = 18,
    /// A remote peer connected to a listening peer
    NewIncomingConnection = 19,
    /// The remote peer refused a connection attempt because it has no free incoming slots
    NoFreeIncomingConnections = 20,
    /// The remote peer closed the link
    DisconnectionNotification = 21,
    /// The remote peer did not respond for too long
    ConnectionLost = 22,
    /// Response to an unconnected ping, followed by the remote peer's discovery descriptor
    UnconnectedPong = 28,
}
