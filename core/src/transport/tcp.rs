use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    owned_peers, Inbox, RunFlag, SenderId, Transport, TransportError, POLL_TIMEOUT, READ_CHUNK,
};

pub const SERVER_PEER: &str = "server";

enum Endpoint {
    Listen(TcpListener),
    Connect(TcpStream),
}

/// Stream sockets. A listening transport numbers its peers `1, 2, ...`; a
/// connecting one has a single peer named [`SERVER_PEER`].
pub struct TcpTransport {
    channel: String,
    local_addr: SocketAddr,
    endpoint: Mutex<Option<Endpoint>>,
    peers: Mutex<HashMap<Arc<str>, mpsc::UnboundedSender<Bytes>>>,
    next_peer: AtomicU64,
    running: RunFlag,
}

impl TcpTransport {
    pub async fn bind(
        channel: impl Into<String>,
        addr: impl ToSocketAddrs,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self::with_endpoint(
            channel.into(),
            local_addr,
            Endpoint::Listen(listener),
        ))
    }

    pub async fn connect(
        channel: impl Into<String>,
        addr: impl ToSocketAddrs,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let transport = Self::with_endpoint(channel.into(), local_addr, Endpoint::Connect(stream));
        Ok(transport)
    }

    fn with_endpoint(channel: String, local_addr: SocketAddr, endpoint: Endpoint) -> Self {
        Self {
            channel,
            local_addr,
            endpoint: Mutex::new(Some(endpoint)),
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            running: RunFlag::default(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }

    pub fn server(&self) -> SenderId {
        SenderId::new(self.channel.as_str(), SERVER_PEER)
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<Arc<str>, mpsc::UnboundedSender<Bytes>>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn has_peer(&self, peer: &str) -> bool {
        self.peers().contains_key(peer)
    }

    fn register(&self, peer: Arc<str>) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers().insert(peer, tx);
        rx
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        inbox: Inbox,
    ) -> Result<(), TransportError> {
        info!("listening on {}", self.local_addr);
        let mut connections = JoinSet::new();
        while self.running.is_running() {
            let (stream, addr) = match timeout(POLL_TIMEOUT, listener.accept()).await {
                Err(_) => continue,
                Ok(Ok(accepted)) => accepted,
                Ok(Err(err)) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {addr}: {err}");
            }
            let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
            let peer: Arc<str> = Arc::from(id.to_string());
            info!("peer connected (peer={peer} addr={addr})");
            let queue = self.register(Arc::clone(&peer));
            let span = info_span!("peer", channel = %self.channel, peer = %peer);
            connections.spawn(
                Arc::clone(&self)
                    .serve(peer, stream, inbox.clone(), queue)
                    .instrument(span),
            );
        }
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    async fn serve(
        self: Arc<Self>,
        peer: Arc<str>,
        stream: TcpStream,
        inbox: Inbox,
        mut queue: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        tokio::spawn(
            async move {
                while let Some(bytes) = queue.recv().await {
                    if let Err(err) = writer.write_all(&bytes).await {
                        debug!("write failed: {err}");
                        break;
                    }
                }
                // queue ends once the peer is unregistered; flush and hang up
                let _ = writer.shutdown().await;
            }
            .in_current_span(),
        );

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if !self.running.is_running() || !self.has_peer(&peer) {
                break;
            }
            match timeout(POLL_TIMEOUT, reader.read(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if !inbox.received(&peer, Bytes::copy_from_slice(&buf[..n])) {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    debug!("read failed: {err}");
                    break;
                }
            }
        }
        self.peers().remove(&peer);
        info!("peer disconnected");
        inbox.closed(&peer);
    }
}

impl Transport for TcpTransport {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn send(&self, bytes: Bytes, receivers: Option<&[SenderId]>) -> Result<(), TransportError> {
        let peers = self.peers();
        let Some(receivers) = receivers else {
            for queue in peers.values() {
                let _ = queue.send(bytes.clone());
            }
            return Ok(());
        };
        let mut missing = None;
        for peer in owned_peers(&self.channel, receivers) {
            match peers.get(peer) {
                Some(queue) if queue.send(bytes.clone()).is_ok() => {}
                _ => missing = Some(SenderId::new(self.channel.as_str(), peer)),
            }
        }
        match missing {
            Some(id) => Err(TransportError::UnknownPeer(id)),
            None => Ok(()),
        }
    }

    fn close(&self, peer: &SenderId) {
        if peer.channel() == self.channel && self.peers().remove(peer.peer()).is_some() {
            debug!("closing peer {peer}");
        }
    }

    fn run(self: Arc<Self>, inbox: Inbox) -> BoxFuture<'static, Result<(), TransportError>> {
        async move {
            let endpoint = self
                .endpoint
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
                .ok_or_else(|| TransportError::NotRunning(self.channel.clone()))?;
            self.running.start();
            let result = match endpoint {
                Endpoint::Listen(listener) => Arc::clone(&self).accept_loop(listener, inbox).await,
                Endpoint::Connect(stream) => {
                    let peer: Arc<str> = Arc::from(SERVER_PEER);
                    let queue = self.register(Arc::clone(&peer));
                    Arc::clone(&self).serve(peer, stream, inbox, queue).await;
                    Ok(())
                }
            };
            self.running.stop();
            result
        }
        .boxed()
    }

    fn stop(&self) {
        self.running.stop();
    }
}
