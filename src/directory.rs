use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use crate::connection::ConnectionShared;
use crate::ids::{PeerId, SocketId};

/// The registry of live connections and the peers' local addresses, shared by the application
///  thread and the network thread. The lock is held only for map access, never while calling
///  out to listeners.
#[derive(Default)]
pub(crate) struct Directory {
    inner: Mutex<DirectoryInner>,
}

#[derive(Default)]
struct DirectoryInner {
    connections: FxHashMap<SocketId, Arc<ConnectionShared>>,
    local_addrs: FxHashMap<PeerId, SocketAddr>,
}

impl Directory {
    pub fn insert_connection(&self, connection: Arc<ConnectionShared>) {
        self.inner.lock().unwrap()
            .connections.insert(connection.id(), connection);
    }

    pub fn connection(&self, socket_id: SocketId) -> Option<Arc<ConnectionShared>> {
        self.inner.lock().unwrap()
            .connections.get(&socket_id)
            .cloned()
    }

    pub fn remove_connection(&self, socket_id: SocketId) -> Option<Arc<ConnectionShared>> {
        self.inner.lock().unwrap()
            .connections.remove(&socket_id)
    }

    pub fn set_local_addr(&self, peer_id: PeerId, addr: SocketAddr) {
        self.inner.lock().unwrap()
            .local_addrs.insert(peer_id, addr);
    }

    pub fn remove_local_addr(&self, peer_id: PeerId) {
        self.inner.lock().unwrap()
            .local_addrs.remove(&peer_id);
    }

    pub fn local_addr(&self, peer_id: PeerId) -> Option<SocketAddr> {
        self.inner.lock().unwrap()
            .local_addrs.get(&peer_id)
            .copied()
    }

    #[cfg(test)]
    pub fn num_connections(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStatus;

    #[test]
    fn test_connections() {
        let directory = Directory::default();
        let shared = Arc::new(ConnectionShared::new(SocketId::from_raw(4), PeerId::from_raw(2), ConnectionStatus::Connecting, None));

        directory.insert_connection(shared.clone());
        assert!(Arc::ptr_eq(&directory.connection(SocketId::from_raw(4)).unwrap(), &shared));
        assert!(directory.connection(SocketId::from_raw(5)).is_none());

        assert!(directory.remove_connection(SocketId::from_raw(4)).is_some());
        assert!(directory.remove_connection(SocketId::from_raw(4)).is_none());
        assert_eq!(directory.num_connections(), 0);
    }

    #[test]
    fn test_local_addrs() {
        let directory = Directory::default();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        directory.set_local_addr(PeerId::from_raw(1), addr);
        assert_eq!(directory.local_addr(PeerId::from_raw(1)), Some(addr));
        assert_eq!(directory.local_addr(PeerId::from_raw(2)), None);

        directory.remove_local_addr(PeerId::from_raw(1));
        assert_eq!(directory.local_addr(PeerId::from_raw(1)), None);
    }
}
