use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashSet;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::fault::Fault;
use crate::transport::router::{CorrelationKey, CorrelationRouter};
use crate::wire::correlation_id::CorrelationId;
use crate::wire::descriptor::ChannelDescriptor;
use crate::wire::envelope::Envelope;

/// One live duplex connection to a peer. Both sides send calls over it; the
///  write lock serializes senders, the read half is drained by exactly one
///  reader task that holds the read lock for the connection's lifetime.
pub struct Connection {
    local: ChannelDescriptor,
    peer: ChannelDescriptor,
    /// held once, by the reader task
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    router: CorrelationRouter,
    remote_addresses: std::sync::Mutex<FxHashSet<SocketAddr>>,
    /// gates the one-time channel-key claim of the first inbound call
    first_inbound_claimed: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        local: ChannelDescriptor,
        peer: ChannelDescriptor,
        stream: TcpStream,
        dialed: Option<SocketAddr>,
    ) -> Arc<Connection> {
        let mut remote_addresses: FxHashSet<SocketAddr> = peer.addresses.iter().copied().collect();
        if let Some(addr) = dialed {
            remote_addresses.insert(addr);
        }
        if let Ok(addr) = stream.peer_addr() {
            remote_addresses.insert(addr);
        }

        let (read_half, write_half) = stream.into_split();
        Arc::new(Connection {
            local,
            peer,
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            router: CorrelationRouter::new(),
            remote_addresses: std::sync::Mutex::new(remote_addresses),
            first_inbound_claimed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local(&self) -> &ChannelDescriptor {
        &self.local
    }

    pub fn peer(&self) -> &ChannelDescriptor {
        &self.peer
    }

    pub fn router(&self) -> &CorrelationRouter {
        &self.router
    }

    /// every address this connection's peer is known by
    pub fn remote_addresses(&self) -> Vec<SocketAddr> {
        self.remote_addresses.lock().unwrap().iter().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn claim_first_inbound(&self) -> bool {
        !self.first_inbound_claimed.swap(true, Ordering::AcqRel)
    }

    /// Writes one envelope. Concurrent senders serialize on the write lock;
    ///  exactly one envelope is on the wire at a time.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), Fault> {
        if self.is_closed() {
            return Err(Fault::ConnectionClosed);
        }

        let mut buf = BytesMut::new();
        envelope.write(&mut buf);

        trace!(correlation_id = ?envelope.correlation_id, len = buf.len(), "sending envelope");
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&buf)
            .await
            .map_err(|_| Fault::ConnectionClosed)
    }

    /// Sends a call envelope and resolves when the matching response
    ///  arrives. The waiter is registered before the first byte goes out, so
    ///  a response can never race past its own registration.
    pub async fn request(&self, envelope: Envelope) -> Result<Envelope, Fault> {
        let pending = self
            .router
            .begin_await(CorrelationKey::Call(envelope.correlation_id));
        self.send(&envelope).await?;
        pending.await
    }

    /// Drains the socket until it closes or breaks, handing every envelope
    ///  to `on_envelope`. Takes the read lock once and keeps it - this is
    ///  the connection's one reader. Returns the fault that ended the loop:
    ///  an orderly close, or a framing fault.
    pub(crate) async fn receive_loop(
        &self,
        max_envelope_size: usize,
        mut on_envelope: impl FnMut(Envelope),
    ) -> Fault {
        let mut reader = self.reader.lock().await;
        loop {
            match read_envelope(&mut reader, max_envelope_size).await {
                Ok(Some(envelope)) => on_envelope(envelope),
                Ok(None) => return Fault::ConnectionClosed,
                Err(e) => return Fault::Framing(e.to_string()),
            }
        }
    }

    /// Shuts the socket down and completes every outstanding waiter with
    ///  `fault`. Idempotent.
    pub(crate) async fn close(&self, fault: Fault) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = ?self.peer.channel_id, "closing connection: {}", fault);
        self.writer.lock().await.shutdown().await.ok();
        self.router.fail_all(fault);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection{{local:{:?}, peer:{:?}}}",
            self.local.channel_id, self.peer.channel_id
        )
    }
}

/// Symmetric identity handshake on a fresh socket: write the local
///  descriptor, then read the peer's. Both sides write first, so neither
///  blocks the other, and no envelope crosses before identities are known.
pub(crate) async fn exchange_handshake(
    stream: &mut TcpStream,
    local: &ChannelDescriptor,
    max_handshake_size: usize,
) -> anyhow::Result<ChannelDescriptor> {
    let mut buf = BytesMut::new();
    local.ser(&mut buf);

    stream.write_all(&(buf.len() as u32).to_le_bytes()).await?;
    stream.write_all(&buf).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let peer_len = u32::from_le_bytes(len_buf) as usize;
    if peer_len > max_handshake_size {
        bail!(
            "peer announced a {} byte handshake descriptor, limit is {}",
            peer_len,
            max_handshake_size
        );
    }

    let mut peer_buf = vec![0u8; peer_len];
    stream.read_exact(&mut peer_buf).await?;
    let peer = ChannelDescriptor::try_deser(&mut peer_buf.as_slice())?;
    trace!(peer = ?peer.channel_id, "handshake complete");
    Ok(peer)
}

/// Reads one envelope off the socket. `Ok(None)` is an orderly close (the
///  peer shut down at a frame boundary); any short read inside a frame and
///  any oversized announcement is a framing fault.
pub(crate) async fn read_envelope(
    reader: &mut OwnedReadHalf,
    max_envelope_size: usize,
) -> anyhow::Result<Option<Envelope>> {
    let mut id_buf = [0u8; CorrelationId::WIRE_LEN];
    let mut filled = 0;
    while filled < id_buf.len() {
        let n = reader.read(&mut id_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            bail!("connection reset inside a correlation id ({} of 16 bytes)", filled);
        }
        filled += n;
    }
    let correlation_id = CorrelationId::from_bytes(id_buf);

    let header_block = read_length_prefixed(reader, max_envelope_size, "header block").await?;
    let mut header_slice = header_block.as_slice();
    let headers = crate::wire::header::HeaderMap::try_deser(&mut header_slice)?;
    if !header_slice.is_empty() {
        bail!("{} trailing bytes after the header entries", header_slice.len());
    }

    let body = read_length_prefixed(reader, max_envelope_size, "body").await?;

    Ok(Some(Envelope {
        correlation_id,
        headers,
        body,
    }))
}

async fn read_length_prefixed(
    reader: &mut OwnedReadHalf,
    max_size: usize,
    what: &str,
) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_size {
        bail!("{} of {} bytes announced, limit is {}", what, len, max_size);
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
