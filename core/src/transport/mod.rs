use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod mux;
pub mod stdio;
pub mod tcp;

pub use memory::{MemoryTransport, Sent};
pub use mux::Multiplexer;
pub use stdio::StdioTransport;
pub use tcp::TcpTransport;

pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub const LOCAL_CHANNEL: &str = "stdio";
pub const LOCAL_PEER: &str = "stdio";

pub const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel name `{0}` is used by more than one transport")]
    DuplicateChannel(String),
    #[error("no transport owns channel `{0}`")]
    UnknownChannel(String),
    #[error("peer {0} is not connected")]
    UnknownPeer(SenderId),
    #[error("transport `{0}` is not running")]
    NotRunning(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId {
    channel: Arc<str>,
    peer: Arc<str>,
}

impl SenderId {
    pub fn new(channel: impl Into<Arc<str>>, peer: impl Into<Arc<str>>) -> Self {
        Self {
            channel: channel.into(),
            peer: peer.into(),
        }
    }

    /// The local-control identity; administrative calls are accepted only
    /// from it.
    pub fn local() -> Self {
        Self::new(LOCAL_CHANNEL, LOCAL_PEER)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_local(&self) -> bool {
        &*self.channel == LOCAL_CHANNEL && &*self.peer == LOCAL_PEER
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.peer)
    }
}

impl fmt::Debug for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SenderId({self})")
    }
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Data { sender: SenderId, bytes: Bytes },
    Closed { sender: SenderId },
}

#[derive(Debug, Clone)]
pub struct Inbox {
    channel: Arc<str>,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl Inbox {
    pub fn new(channel: impl Into<Arc<str>>, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self {
            channel: channel.into(),
            tx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn with_channel(&self, channel: impl Into<Arc<str>>) -> Self {
        Self {
            channel: channel.into(),
            tx: self.tx.clone(),
        }
    }

    pub fn sender(&self, peer: &str) -> SenderId {
        SenderId::new(Arc::clone(&self.channel), peer)
    }

    pub fn received(&self, peer: &str, bytes: Bytes) -> bool {
        let sender = self.sender(peer);
        self.tx.send(Inbound::Data { sender, bytes }).is_ok()
    }

    pub fn closed(&self, peer: &str) -> bool {
        let sender = self.sender(peer);
        self.tx.send(Inbound::Closed { sender }).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A named byte channel to one or more peers.
///
/// `send` must not block: implementations queue the bytes for a writer task.
/// `run` drives the read side until `stop` is called; read loops poll with
/// [`POLL_TIMEOUT`] so stopping is cooperative.
pub trait Transport: Send + Sync + 'static {
    fn channel(&self) -> &str;

    fn send(&self, bytes: Bytes, receivers: Option<&[SenderId]>) -> Result<(), TransportError>;

    fn close(&self, _peer: &SenderId) {}

    fn run(self: Arc<Self>, inbox: Inbox) -> BoxFuture<'static, Result<(), TransportError>>;

    fn stop(&self);
}

#[derive(Debug, Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn start(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) fn owned_peers<'a>(
    channel: &'a str,
    receivers: &'a [SenderId],
) -> impl Iterator<Item = &'a str> + 'a {
    receivers
        .iter()
        .filter(move |id| id.channel() == channel)
        .map(SenderId::peer)
}
