use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::transport;

/// Message type tags. Every application message starts with one of these bytes. Values below
///  [MessageId::Start] are reserved for the transport's own events.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MessageId {
    /// Listeners registered for this tag receive connection status callbacks only
    StatusOnly = 134,
    Broadcast,
    SendTo,
    SessionControl,
    MouseXToClient,
    MouseXToServer,
    SyncMessage,
    Tunnel,
    TunnelControl,
    AudioSamples,
    Handshake,
    UserPresenceChange,
    AvatarBroadcast,
    TestAutomation,
    Profiling,
    InternalSyncMessage,
    RoomAnchor,
}

impl MessageId {
    /// The first tag available for application messages. Tags below this are transport events.
    pub const START: u8 = 134;

    /// Tags from here on are free for applications built on top of the core
    pub const USER_MESSAGE_ID_START: u8 = 184;
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessagePriority {
    Immediate = 0,
    High,
    Medium,
    Low,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageReliability {
    Unreliable = 0,
    UnreliableSequenced,
    Reliable,
    ReliableOrdered,
    ReliableSequenced,
}

/// Ordering lanes: ordered and sequenced messages are ordered only relative to other messages
///  on the same channel
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MessageChannel(u8);

impl MessageChannel {
    pub const DEFAULT: MessageChannel = MessageChannel(0);
    pub const MOUSE: MessageChannel = MessageChannel(1);
    pub const AVATAR: MessageChannel = MessageChannel(2);
    pub const AUDIO: MessageChannel = MessageChannel(3);
    pub const PROFILE: MessageChannel = MessageChannel(4);
    pub const ROOM_ANCHOR: MessageChannel = MessageChannel(5);
    pub const USER_MESSAGE_CHANNEL_START: MessageChannel = MessageChannel(16);
    pub const MAX: MessageChannel = MessageChannel(31);

    pub fn new(raw: u8) -> Option<MessageChannel> {
        if raw <= Self::MAX.0 {
            Some(MessageChannel(raw))
        }
        else {
            None
        }
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for MessageChannel {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageChannel::new(value)
            .ok_or_else(|| anyhow::anyhow!("invalid message channel {}", value))
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ClientRole {
    Primary = 0,
    Secondary = 1,
    Unspecified = 255,
}

/// Control messages a tunnel bridge sends to each of its sides
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum TunnelMsgType {
    RemotePeerConnected = 0,
    RemotePeerDisconnected = 1,
}

pub fn to_transport_priority(priority: MessagePriority) -> transport::Priority {
    match priority {
        MessagePriority::Immediate => transport::Priority::Immediate,
        MessagePriority::High => transport::Priority::High,
        MessagePriority::Medium => transport::Priority::Medium,
        MessagePriority::Low => transport::Priority::Low,
    }
}

pub fn to_transport_reliability(reliability: MessageReliability) -> transport::Reliability {
    match reliability {
        MessageReliability::Unreliable => transport::Reliability::Unreliable,
        MessageReliability::UnreliableSequenced => transport::Reliability::UnreliableSequenced,
        MessageReliability::Reliable => transport::Reliability::Reliable,
        MessageReliability::ReliableOrdered => transport::Reliability::ReliableOrdered,
        MessageReliability::ReliableSequenced => transport::Reliability::ReliableSequenced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MessageId::StatusOnly, 134)]
    #[case(MessageId::Broadcast, 135)]
    #[case(MessageId::SendTo, 136)]
    #[case(MessageId::Tunnel, 141)]
    #[case(MessageId::TunnelControl, 142)]
    #[case(MessageId::Handshake, 144)]
    #[case(MessageId::RoomAnchor, 150)]
    fn test_message_id_values(#[case] id: MessageId, #[case] expected: u8) {
        assert_eq!(u8::from(id), expected);
        assert_eq!(MessageId::try_from(expected).unwrap(), id);
    }

    #[test]
    fn test_message_id_start_matches_transport() {
        assert_eq!(MessageId::START, transport::USER_PACKET_START);
        assert_eq!(u8::from(MessageId::StatusOnly), MessageId::START);
        assert!(MessageId::try_from(133u8).is_err());
        assert!(MessageId::try_from(MessageId::USER_MESSAGE_ID_START).is_err());
    }

    #[rstest]
    #[case(MessagePriority::Immediate, transport::Priority::Immediate)]
    #[case(MessagePriority::High, transport::Priority::High)]
    #[case(MessagePriority::Medium, transport::Priority::Medium)]
    #[case(MessagePriority::Low, transport::Priority::Low)]
    fn test_priority_mapping(#[case] priority: MessagePriority, #[case] expected: transport::Priority) {
        assert_eq!(to_transport_priority(priority), expected);
    }

    #[rstest]
    #[case(MessageReliability::Unreliable, transport::Reliability::Unreliable)]
    #[case(MessageReliability::UnreliableSequenced, transport::Reliability::UnreliableSequenced)]
    #[case(MessageReliability::Reliable, transport::Reliability::Reliable)]
    #[case(MessageReliability::ReliableOrdered, transport::Reliability::ReliableOrdered)]
    #[case(MessageReliability::ReliableSequenced, transport::Reliability::ReliableSequenced)]
    fn test_reliability_mapping(#[case] reliability: MessageReliability, #[case] expected: transport::Reliability) {
        assert_eq!(to_transport_reliability(reliability), expected);
    }

    #[rstest]
    #[case(0, true)]
    #[case(31, true)]
    #[case(32, false)]
    #[case(255, false)]
    fn test_channel_range(#[case] raw: u8, #[case] valid: bool) {
        assert_eq!(MessageChannel::new(raw).is_some(), valid);
        assert_eq!(MessageChannel::try_from(raw).is_ok(), valid);
    }

    #[test]
    fn test_client_role() {
        assert_eq!(ClientRole::try_from(255u8).unwrap(), ClientRole::Unspecified);
        assert!(ClientRole::try_from(2u8).is_err());
    }
}
