use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::transport::connection::Connection;
use crate::wire::descriptor::ChannelId;

/// What a registered connection can be looked up by: a socket address it is
///  reachable at, or the channel identity its peer declared in the
///  handshake.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RegistryKey {
    Address(SocketAddr),
    Channel(ChannelId),
}

/// Maps peer addresses and peer-declared identities to live connections.
///
/// One mapping-wide lock guards registration, lookup and removal only - the
///  data path of a connection never touches it, so unrelated connections'
///  traffic is never serialized against each other.
///
/// At most one live connection is kept per peer channel identity. When both
///  sides dial concurrently, whoever registers second loses:
///  [ConnectionRegistry::register] refuses the newcomer and hands back the
///  surviving entry for the caller to fall back to.
pub struct ConnectionRegistry {
    connections: Mutex<FxHashMap<RegistryKey, Arc<Connection>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            connections: Mutex::new(Default::default()),
        }
    }

    /// Registers `connection` under its peer identity and every address the
    ///  peer is known by. Returns the already-registered connection instead
    ///  if the peer identity is taken - the duplicate-connection condition.
    pub fn register(&self, connection: &Arc<Connection>) -> Result<(), Arc<Connection>> {
        let peer_id = connection.peer().channel_id;
        let mut connections = self.connections.lock().unwrap();

        if let Some(existing) = connections.get(&RegistryKey::Channel(peer_id)) {
            if !existing.is_closed() {
                debug!(peer = ?peer_id, "duplicate connection for peer identity");
                return Err(existing.clone());
            }
        }

        connections.insert(RegistryKey::Channel(peer_id), connection.clone());
        for addr in connection.remote_addresses() {
            connections.insert(RegistryKey::Address(addr), connection.clone());
        }
        debug!(peer = ?peer_id, "connection registered");
        Ok(())
    }

    pub fn lookup(&self, key: &RegistryKey) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap()
            .get(key)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    pub fn lookup_address(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.lookup(&RegistryKey::Address(addr))
    }

    pub fn lookup_channel(&self, channel_id: ChannelId) -> Option<Arc<Connection>> {
        self.lookup(&RegistryKey::Channel(channel_id))
    }

    /// Drops every key pointing at `connection`.
    pub fn remove(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .unwrap()
            .retain(|_, registered| !Arc::ptr_eq(registered, connection));
    }

    /// The distinct live connections, for shutdown.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let connections = self.connections.lock().unwrap();
        let mut result: Vec<Arc<Connection>> = Vec::new();
        for connection in connections.values() {
            if !result.iter().any(|c| Arc::ptr_eq(c, connection)) {
                result.push(connection.clone());
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::fault::Fault;
    use crate::wire::descriptor::ChannelDescriptor;

    async fn test_connection(peer_id: ChannelId, advertised: &[&str]) -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        let _far_end = accepted.unwrap().0;

        let peer_addresses = advertised
            .iter()
            .map(|a| SocketAddr::from_str(a).unwrap())
            .collect();
        Connection::new(
            ChannelDescriptor::new(ChannelId::new_unique(), vec![]),
            ChannelDescriptor::new(peer_id, peer_addresses),
            connected.unwrap(),
            Some(addr),
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup_by_every_key() {
        let registry = ConnectionRegistry::new();
        let peer_id = ChannelId::new_unique();
        let connection = test_connection(peer_id, &["10.1.2.3:9000"]).await;

        registry.register(&connection).unwrap();

        let by_channel = registry.lookup_channel(peer_id).unwrap();
        assert!(Arc::ptr_eq(&by_channel, &connection));

        for addr in connection.remote_addresses() {
            let by_addr = registry.lookup_address(addr).unwrap();
            assert!(Arc::ptr_eq(&by_addr, &connection));
        }
    }

    #[tokio::test]
    async fn test_second_connection_for_same_peer_is_refused() {
        let registry = ConnectionRegistry::new();
        let peer_id = ChannelId::new_unique();

        let first = test_connection(peer_id, &[]).await;
        let second = test_connection(peer_id, &[]).await;

        registry.register(&first).unwrap();
        let existing = registry.register(&second).unwrap_err();
        assert!(Arc::ptr_eq(&existing, &first));

        // the refused newcomer must not have displaced any key
        let registered = registry.lookup_channel(peer_id).unwrap();
        assert!(Arc::ptr_eq(&registered, &first));
    }

    #[tokio::test]
    async fn test_closed_connection_can_be_replaced() {
        let registry = ConnectionRegistry::new();
        let peer_id = ChannelId::new_unique();

        let first = test_connection(peer_id, &[]).await;
        registry.register(&first).unwrap();
        first.close(Fault::ConnectionClosed).await;

        let second = test_connection(peer_id, &[]).await;
        registry.register(&second).unwrap();

        let registered = registry.lookup_channel(peer_id).unwrap();
        assert!(Arc::ptr_eq(&registered, &second));
    }

    #[tokio::test]
    async fn test_remove_drops_every_key() {
        let registry = ConnectionRegistry::new();
        let peer_id = ChannelId::new_unique();
        let connection = test_connection(peer_id, &["10.1.2.3:9000", "[::1]:9000"]).await;

        registry.register(&connection).unwrap();
        assert!(!registry.is_empty());

        registry.remove(&connection);
        assert!(registry.is_empty());
        assert!(registry.lookup_channel(peer_id).is_none());
    }

    #[tokio::test]
    async fn test_connections_deduplicates_multi_key_entries() {
        let registry = ConnectionRegistry::new();
        let connection =
            test_connection(ChannelId::new_unique(), &["10.1.2.3:9000", "10.1.2.4:9000"]).await;

        registry.register(&connection).unwrap();
        assert!(registry.len() >= 3);
        assert_eq!(registry.connections().len(), 1);
    }
}
