// Router/dealer socket adapter over TCP.
//!
//! The router side owns the listener, assigns an opaque identity frame per
//! connection and exposes one inbound queue; replies and notifications are
//! routed back by identity. Only the adapter's tasks touch the sockets.

pub mod codec;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::Authenticator;

/// Transport-level limits.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub max_parts: usize,
    pub send_queue_depth: usize,
    pub inbound_queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 4 * 1024 * 1024,
            max_parts: 16,
            send_queue_depth: 1024,
            inbound_queue_depth: 1024,
        }
    }
}

pub type SendResult = std::result::Result<(), SendError>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SendError {
    #[error("peer gone")]
    PeerGone,
}

type PeerMap = DashMap<Bytes, mpsc::Sender<Vec<Bytes>>>;

/// Server-side router socket.
///
/// `recv` yields messages with the peer's identity frame prepended, so a
/// five-part dealer message arrives as six parts; `RouterHandle::send`
/// expects the identity first and strips it for routing.
pub struct RouterSocket {
    inbound: mpsc::Receiver<Vec<Bytes>>,
    handle: RouterHandle,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RouterSocket {
    pub async fn bind(
        addr: SocketAddr,
        authenticator: Option<Arc<Authenticator>>,
        config: TransportConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind router endpoint {addr}"))?;
        let local_addr = listener.local_addr().context("read local address")?;
        let peers: Arc<PeerMap> = Arc::new(DashMap::new());
        let (inbound_tx, inbound) = mpsc::channel(config.inbound_queue_depth);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&peers),
            inbound_tx,
            authenticator,
            config,
        ));
        Ok(Self {
            inbound,
            handle: RouterHandle { peers },
            local_addr,
            accept_task,
        })
    }

    /// Next inbound message, identity frame first. `None` after close.
    pub async fn recv(&mut self) -> Option<Vec<Bytes>> {
        self.inbound.recv().await
    }

    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Cheap clonable send side of a router socket.
#[derive(Clone)]
pub struct RouterHandle {
    peers: Arc<PeerMap>,
}

impl RouterHandle {
    /// Enqueue a message whose first part is the destination identity.
    /// A full peer queue drops the message (slow-consumer policy); a missing
    /// or closed peer is `PeerGone`.
    pub fn send(&self, mut parts: Vec<Bytes>) -> SendResult {
        if parts.is_empty() {
            return Err(SendError::PeerGone);
        }
        let identity = parts.remove(0);
        let Some(sender) = self.peers.get(&identity) else {
            return Err(SendError::PeerGone);
        };
        match sender.try_send(parts) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("spire_replies_dropped_total").increment(1);
                tracing::warn!("peer send queue full, dropping message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::PeerGone),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: Arc<PeerMap>,
    inbound_tx: mpsc::Sender<Vec<Bytes>>,
    authenticator: Option<Arc<Authenticator>>,
    config: TransportConfig,
) {
    let mut counter: u32 = 0;
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        counter = counter.wrapping_add(1);
        // Router-style identity: a zero byte plus a connection counter.
        let mut identity = Vec::with_capacity(5);
        identity.push(0x00);
        identity.extend_from_slice(&counter.to_be_bytes());
        let identity = Bytes::from(identity);

        tracing::debug!(%peer_addr, "connection accepted");
        tokio::spawn(serve_connection(
            stream,
            identity,
            Arc::clone(&peers),
            inbound_tx.clone(),
            authenticator.clone(),
            config.clone(),
        ));
    }
}

async fn serve_connection(
    stream: TcpStream,
    identity: Bytes,
    peers: Arc<PeerMap>,
    inbound_tx: mpsc::Sender<Vec<Bytes>>,
    authenticator: Option<Arc<Authenticator>>,
    config: TransportConfig,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    // Secure endpoints require a one-part greeting carrying the client key;
    // unlisted clients are dropped without a reply.
    if let Some(authenticator) = authenticator {
        let greeting =
            codec::read_multipart(&mut read_half, config.max_parts, config.max_frame_bytes).await;
        match greeting {
            Ok(Some(parts)) if parts.len() == 1 && authenticator.authorize(&parts[0]) => {
                tracing::debug!("client authorized");
            }
            Ok(_) => {
                tracing::info!("rejecting unauthorized client");
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "greeting failed");
                return;
            }
        }
    }

    let (send_tx, mut send_rx) = mpsc::channel::<Vec<Bytes>>(config.send_queue_depth);
    peers.insert(identity.clone(), send_tx);

    let writer = tokio::spawn(async move {
        while let Some(parts) = send_rx.recv().await {
            if let Err(err) = codec::write_multipart(&mut write_half, &parts).await {
                tracing::debug!(error = %err, "peer write failed");
                break;
            }
        }
    });

    loop {
        match codec::read_multipart(&mut read_half, config.max_parts, config.max_frame_bytes).await
        {
            Ok(Some(parts)) => {
                let mut message = Vec::with_capacity(parts.len() + 1);
                message.push(identity.clone());
                message.extend(parts);
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "dropping connection on framing error");
                break;
            }
        }
    }

    peers.remove(&identity);
    writer.abort();
    tracing::debug!("connection closed");
}

/// Client-side dealer socket; the counterpart used by wallets and the test
/// suites. No identity frame is visible on this side.
pub struct DealerSocket {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    config: TransportConfig,
}

impl DealerSocket {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect dealer to {addr}"))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            read,
            write,
            config: TransportConfig::default(),
        })
    }

    /// Connect to a secure endpoint, presenting the client key as the
    /// greeting frame.
    pub async fn connect_secure(addr: SocketAddr, client_key: &[u8]) -> Result<Self> {
        let mut socket = Self::connect(addr).await?;
        socket
            .send(&[Bytes::copy_from_slice(client_key)])
            .await
            .context("send greeting")?;
        Ok(socket)
    }

    pub async fn send(&mut self, parts: &[Bytes]) -> Result<()> {
        codec::write_multipart(&mut self.write, parts).await
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<Bytes>>> {
        codec::read_multipart(&mut self.read, self.config.max_parts, self.config.max_frame_bytes)
            .await
    }
}
