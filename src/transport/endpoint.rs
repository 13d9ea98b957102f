use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::CoreConfig;
use crate::fault::Fault;
use crate::transport::connection::{exchange_handshake, Connection};
use crate::transport::registry::ConnectionRegistry;
use crate::transport::router::CorrelationKey;
use crate::wire::descriptor::{ChannelDescriptor, ChannelId};
use crate::wire::envelope::Envelope;

/// Where the transport hands inbound calls: the server-role dispatcher, or
///  the client's callback host. Returning an envelope sends it back as the
///  reply; `None` means the request wants no answer.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_envelope(&self, connection: &Arc<Connection>, envelope: Envelope) -> Option<Envelope>;
}

/// One process's end of the duplex transport: its channel identity, its
///  connection registry, and - for servers - a listening socket. Clients run
///  an endpoint without a listener; callbacks reach them over the
///  connections they opened.
pub struct Endpoint {
    local: ChannelDescriptor,
    config: CoreConfig,
    registry: ConnectionRegistry,
    inbound: Arc<dyn InboundHandler>,
    /// serializes concurrent dials to the same address
    dial_locks: tokio::sync::Mutex<FxHashMap<SocketAddr, Arc<tokio::sync::Mutex<()>>>>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// An endpoint without a listening socket. It can only dial out, and the
    ///  far side reaches it over connections it opened.
    pub fn client(inbound: Arc<dyn InboundHandler>, config: CoreConfig) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            local: ChannelDescriptor::new(ChannelId::new_unique(), vec![]),
            config,
            registry: ConnectionRegistry::new(),
            inbound,
            dial_locks: Default::default(),
            accept_task: std::sync::Mutex::new(None),
        })
    }

    /// Binds a listener and starts accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        inbound: Arc<dyn InboundHandler>,
        config: CoreConfig,
    ) -> anyhow::Result<Arc<Endpoint>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let endpoint = Arc::new(Endpoint {
            local: ChannelDescriptor::new(ChannelId::new_unique(), vec![local_addr]),
            config,
            registry: ConnectionRegistry::new(),
            inbound,
            dial_locks: Default::default(),
            accept_task: std::sync::Mutex::new(None),
        });

        let accept_endpoint = endpoint.clone();
        let task = tokio::spawn(async move {
            accept_endpoint.accept_loop(listener).await;
        });
        *endpoint.accept_task.lock().unwrap() = Some(task);

        Ok(endpoint)
    }

    pub fn local(&self) -> &ChannelDescriptor {
        &self.local
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local.addresses.first().copied()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Returns the registered connection for `addr`, or dials one. Exactly
    ///  one dial to a given address runs at a time; losers of that race get
    ///  the winner's connection. If the handshake reveals a peer identity
    ///  that is already registered - both sides dialed concurrently - the
    ///  fresh socket is closed and the existing connection is returned.
    pub async fn get_or_connect(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        if let Some(connection) = self.registry.lookup_address(addr) {
            return Ok(connection);
        }

        let dial_lock = {
            let mut locks = self.dial_locks.lock().await;
            locks.entry(addr).or_default().clone()
        };
        let _dialing = dial_lock.lock().await;

        // a concurrent dial may have won while this one queued
        if let Some(connection) = self.registry.lookup_address(addr) {
            return Ok(connection);
        }

        debug!("dialing {}", addr);
        let mut stream = TcpStream::connect(addr).await?;
        let peer = exchange_handshake(&mut stream, &self.local, self.config.max_handshake_size).await?;
        let connection = Connection::new(self.local.clone(), peer, stream, Some(addr));

        match self.registry.register(&connection) {
            Ok(()) => {
                self.adopt(&connection);
                Ok(connection)
            }
            Err(existing) => {
                // not an error: both ends dialed at once, one socket has to go
                debug!(peer = ?connection.peer().channel_id, "duplicate connection - falling back to the existing one");
                connection.close(Fault::DuplicateConnection).await;
                Ok(existing)
            }
        }
    }

    /// Sends `envelope` to `addr` and resolves with the matching response.
    pub async fn request(self: &Arc<Self>, addr: SocketAddr, envelope: Envelope) -> Result<Envelope, Fault> {
        let connection = self.get_or_connect(addr).await.map_err(|e| {
            warn!("connect to {} failed: {}", addr, e);
            Fault::ConnectionClosed
        })?;
        connection.request(envelope).await
    }

    /// Closes the listener and every registered connection. Outstanding
    ///  waiters complete with a connection-closed fault.
    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        for connection in self.registry.connections() {
            self.registry.remove(&connection);
            connection.close(Fault::ConnectionClosed).await;
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let endpoint = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = endpoint.handle_accepted(stream, addr).await {
                            warn!("connection from {} broke during setup: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                }
            }
        }
    }

    #[instrument(name = "accepted_connection", skip_all, fields(addr = %addr))]
    async fn handle_accepted(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> anyhow::Result<()> {
        debug!("received connection request");
        let peer = exchange_handshake(&mut stream, &self.local, self.config.max_handshake_size).await?;
        let connection = Connection::new(self.local.clone(), peer, stream, None);

        match self.registry.register(&connection) {
            Ok(()) => {
                debug!("handshake complete, connection registered");
                self.adopt(&connection);
            }
            Err(_existing) => {
                debug!("duplicate connection for already-registered peer - closing the new socket");
                connection.close(Fault::DuplicateConnection).await;
            }
        }
        Ok(())
    }

    /// Starts the reader task and the one-time claim of the first inbound
    ///  call for a freshly registered connection.
    fn adopt(self: &Arc<Self>, connection: &Arc<Connection>) {
        // The first inbound call on a fresh connection is claimed through
        //  the router under the peer's channel key. The claim task races the
        //  reader; the router's stash covers the case where the envelope
        //  arrives first.
        let claim_endpoint = self.clone();
        let claim_connection = connection.clone();
        tokio::spawn(async move {
            let key = CorrelationKey::Channel(claim_connection.peer().channel_id);
            match claim_connection.router().begin_await(key).await {
                Ok(envelope) => {
                    claim_endpoint.handle_request(claim_connection.clone(), envelope).await;
                }
                Err(_) => {
                    // connection went down before the peer initiated anything
                }
            }
        });

        let endpoint = self.clone();
        let read_connection = connection.clone();
        tokio::spawn(async move {
            endpoint.read_loop(read_connection).await;
        });
    }

    async fn read_loop(self: Arc<Self>, connection: Arc<Connection>) {
        let fault = connection
            .receive_loop(self.config.max_envelope_size, |envelope| {
                match envelope.kind() {
                    Some(kind) if kind.is_response() => {
                        // responses complete their waiter on the reader task
                        connection
                            .router()
                            .offer(CorrelationKey::Call(envelope.correlation_id), envelope);
                    }
                    _ => {
                        if connection.claim_first_inbound() {
                            let key = CorrelationKey::Channel(connection.peer().channel_id);
                            connection.router().offer(key, envelope);
                        }
                        else {
                            // the next read is re-armed before this request
                            //  is processed
                            let endpoint = self.clone();
                            let request_connection = connection.clone();
                            tokio::spawn(async move {
                                endpoint.handle_request(request_connection, envelope).await;
                            });
                        }
                    }
                }
            })
            .await;

        debug!(peer = ?connection.peer().channel_id, "reader finished: {}", fault);
        self.registry.remove(&connection);
        connection.close(fault).await;
    }

    async fn handle_request(&self, connection: Arc<Connection>, envelope: Envelope) {
        if let Some(reply) = self.inbound.on_envelope(&connection, envelope).await {
            if let Err(fault) = connection.send(&reply).await {
                warn!(peer = ?connection.peer().channel_id, "could not send reply: {}", fault);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::wire::correlation_id::CorrelationId;
    use crate::wire::header::MessageKind;

    /// answers every request with its own body
    struct EchoHandler;

    #[async_trait]
    impl InboundHandler for EchoHandler {
        async fn on_envelope(&self, _connection: &Arc<Connection>, envelope: Envelope) -> Option<Envelope> {
            let body = envelope.body.clone();
            Some(Envelope::reply_to(&envelope, MessageKind::Response, body))
        }
    }

    /// answers every request with each body byte doubled
    struct DoublingHandler;

    #[async_trait]
    impl InboundHandler for DoublingHandler {
        async fn on_envelope(&self, _connection: &Arc<Connection>, envelope: Envelope) -> Option<Envelope> {
            let body = envelope.body.iter().map(|b| b.wrapping_mul(2)).collect();
            Some(Envelope::reply_to(&envelope, MessageKind::Response, body))
        }
    }

    /// swallows every request
    struct NoReplyHandler;

    #[async_trait]
    impl InboundHandler for NoReplyHandler {
        async fn on_envelope(&self, _connection: &Arc<Connection>, _envelope: Envelope) -> Option<Envelope> {
            None
        }
    }

    /// calls back over the connection the request arrived on, then answers
    ///  the original request with whatever the callback returned
    struct CallingBackHandler;

    #[async_trait]
    impl InboundHandler for CallingBackHandler {
        async fn on_envelope(&self, connection: &Arc<Connection>, envelope: Envelope) -> Option<Envelope> {
            let probe = Envelope::new(MessageKind::Request, CorrelationId::new_unique(), vec![21]);
            let answer = connection.request(probe).await.expect("callback over client connection");
            Some(Envelope::reply_to(&envelope, MessageKind::Response, answer.body))
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {}", what);
    }

    fn request_envelope(body: Vec<u8>) -> Envelope {
        Envelope::new(MessageKind::Request, CorrelationId::new_unique(), body)
    }

    #[tokio::test]
    async fn test_request_response_over_loopback() {
        let server = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(EchoHandler),
            CoreConfig::new(),
        )
        .await
        .unwrap();
        let client = Endpoint::client(Arc::new(NoReplyHandler), CoreConfig::new());

        let response = client
            .request(server.local_addr().unwrap(), request_envelope(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(response.body, vec![1, 2, 3]);

        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dials_collapse_to_one_connection() {
        let server = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(EchoHandler),
            CoreConfig::new(),
        )
        .await
        .unwrap();
        let client = Endpoint::client(Arc::new(NoReplyHandler), CoreConfig::new());
        let addr = server.local_addr().unwrap();

        let mut dials = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            dials.push(tokio::spawn(async move { client.get_or_connect(addr).await.unwrap() }));
        }

        let mut connections = Vec::new();
        for dial in dials {
            connections.push(dial.await.unwrap());
        }
        for connection in &connections {
            assert!(Arc::ptr_eq(connection, &connections[0]));
        }

        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_get_their_own_responses() {
        let server = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(EchoHandler),
            CoreConfig::new(),
        )
        .await
        .unwrap();
        let client = Endpoint::client(Arc::new(NoReplyHandler), CoreConfig::new());
        let addr = server.local_addr().unwrap();

        let mut calls = Vec::new();
        for i in 0..16u8 {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                let response = client.request(addr, request_envelope(vec![i; 4])).await.unwrap();
                // every caller sees exactly its own payload, never another's
                assert_eq!(response.body, vec![i; 4]);
            }));
        }
        for call in calls {
            call.await.unwrap();
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_initiated_call_rides_the_client_connection() {
        let server = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(CallingBackHandler),
            CoreConfig::new(),
        )
        .await
        .unwrap();
        // the client never opened a listening socket, yet the server can
        //  call it: its request arrives on the connection the client dialed
        let client = Endpoint::client(Arc::new(DoublingHandler), CoreConfig::new());

        let response = client
            .request(server.local_addr().unwrap(), request_envelope(vec![0]))
            .await
            .unwrap();
        assert_eq!(response.body, vec![42]);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_outstanding_waiters() {
        let server = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(NoReplyHandler),
            CoreConfig::new(),
        )
        .await
        .unwrap();
        let client = Endpoint::client(Arc::new(NoReplyHandler), CoreConfig::new());
        let addr = server.local_addr().unwrap();

        let connection = client.get_or_connect(addr).await.unwrap();
        let pending = tokio::spawn(async move {
            connection.request(request_envelope(vec![7])).await
        });

        // let the request reach the server before tearing it down
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown().await;

        assert_eq!(pending.await.unwrap(), Err(Fault::ConnectionClosed));
        eventually("client registry drained", || client.registry.is_empty()).await;
    }

    #[tokio::test]
    async fn test_framing_fault_drops_the_connection() {
        let server = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(EchoHandler),
            CoreConfig::new(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        // raw client doing a proper handshake and then writing garbage
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let descriptor = ChannelDescriptor::new(ChannelId::new_unique(), vec![]);
        let mut buf = BytesMut::new();
        descriptor.ser(&mut buf);
        stream.write_all(&(buf.len() as u32).to_le_bytes()).await.unwrap();
        stream.write_all(&buf).await.unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut peer_buf = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        stream.read_exact(&mut peer_buf).await.unwrap();

        eventually("raw connection registered", || !server.registry.is_empty()).await;

        // a correlation id followed by an absurd header length
        stream.write_all(&[0xab; 16]).await.unwrap();
        stream.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

        eventually("broken connection dropped", || server.registry.is_empty()).await;
        server.shutdown().await;
    }
}
