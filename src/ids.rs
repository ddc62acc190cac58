use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_PEER_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_SOCKET_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies one transport endpoint (i.e. one UDP socket owned by the network thread). Ids are
///  unique for the lifetime of the process and never reused.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerId(u32);

impl PeerId {
    pub fn next() -> PeerId {
        PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u32) -> PeerId {
        PeerId(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Identifies one logical connection. Unique for the lifetime of the process.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SocketId(u32);

impl SocketId {
    pub fn next() -> SocketId {
        SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u32) -> SocketId {
        SocketId(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Debug for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl Display for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a [crate::network_connection::NetworkConnection] independently of the socket it
///  currently wraps, so higher layers can recognize it across socket replacement
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionGuid(pub u64);

impl ConnectionGuid {
    pub fn random() -> ConnectionGuid {
        ConnectionGuid(rand::random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = PeerId::next();
        let b = PeerId::next();
        assert!(b > a);

        let s1 = SocketId::next();
        let s2 = SocketId::next();
        assert!(s2 > s1);
        assert_ne!(s1.raw(), 0);
    }

    #[test]
    fn test_raw_roundtrip() {
        assert_eq!(PeerId::from_raw(17).raw(), 17);
        assert_eq!(SocketId::from_raw(18), SocketId::from_raw(18));
        assert_eq!(format!("{:?}", SocketId::from_raw(5)), "S5");
    }

    #[test]
    fn test_guids_differ() {
        assert_ne!(ConnectionGuid::random(), ConnectionGuid::random());
    }
}
