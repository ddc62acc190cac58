//! A minimal reliable-UDP transport: a [peer::Peer] owns one UDP socket and multiplexes any
//!  number of [link::Link]s (one per remote address) over it.
//!
//! ## Frames
//!
//! Every datagram carries exactly one frame:
//!
//! ```ascii
//! 0: protocol version (u8)
//! 1: frame kind (u8)
//! 2: kind specific body
//! ```
//!
//! Data frames carry the reliability mode and ordering channel of their payload, a sequence
//!  number for reliable modes (acknowledged by the receiver, re-sent until acknowledged), and an
//!  ordering index for ordered and sequenced modes. Ordered payloads are held back until all
//!  predecessors on their channel were delivered, sequenced payloads older than the newest one
//!  delivered on their channel are dropped.
//!
//! Payloads are never fragmented: a payload that does not fit into a single datagram is rejected.
//!
//! ## Events
//!
//! Received payloads and link events are delivered as [peer::Packet]s. Link events are packets
//!  consisting of a single byte below [USER_PACKET_START] (see [event::TransportEvent]), while
//!  application payloads start with a byte at or above it.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod event;
pub mod frame;
pub mod link;
pub mod peer;

/// The first packet id available to applications. Lower ids are transport events.
pub const USER_PACKET_START: u8 = 134;

/// Number of independent ordering channels per link
pub const NUM_ORDERING_CHANNELS: usize = 32;

/// Send order within a single network tick
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Priority {
    Immediate = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
}

impl Reliability {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Reliability::Reliable | Reliability::ReliableOrdered | Reliability::ReliableSequenced)
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, Reliability::ReliableOrdered)
    }

    pub fn is_sequenced(&self) -> bool {
        matches!(self, Reliability::UnreliableSequenced | Reliability::ReliableSequenced)
    }

    pub fn has_order_index(&self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }
}

/// `a` is newer than `b` in wrapping u32 arithmetic
pub(crate) fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
