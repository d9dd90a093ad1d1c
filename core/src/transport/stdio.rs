use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    owned_peers, Inbox, RunFlag, SenderId, Transport, TransportError, LOCAL_CHANNEL, LOCAL_PEER,
    POLL_TIMEOUT, READ_CHUNK,
};

pub struct StdioTransport {
    outgoing: mpsc::UnboundedSender<Bytes>,
    writer: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    running: RunFlag,
}

impl StdioTransport {
    pub fn new() -> Self {
        let (outgoing, writer) = mpsc::unbounded_channel();
        Self {
            outgoing,
            writer: Mutex::new(Some(writer)),
            running: RunFlag::default(),
        }
    }

    fn take_writer(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_stdout(mut queue: mpsc::UnboundedReceiver<Bytes>) {
    let mut stdout = tokio::io::stdout();
    while let Some(bytes) = queue.recv().await {
        if let Err(err) = stdout.write_all(&bytes).await {
            warn!("stdout write failed: {err}");
            break;
        }
        if let Err(err) = stdout.flush().await {
            warn!("stdout flush failed: {err}");
            break;
        }
    }
}

impl Transport for StdioTransport {
    fn channel(&self) -> &str {
        LOCAL_CHANNEL
    }

    fn send(&self, bytes: Bytes, receivers: Option<&[SenderId]>) -> Result<(), TransportError> {
        if let Some(receivers) = receivers {
            if !owned_peers(LOCAL_CHANNEL, receivers).any(|peer| peer == LOCAL_PEER) {
                return Ok(());
            }
        }
        self.outgoing
            .send(bytes)
            .map_err(|_| TransportError::NotRunning(LOCAL_CHANNEL.to_string()))
    }

    fn run(self: Arc<Self>, inbox: Inbox) -> BoxFuture<'static, Result<(), TransportError>> {
        async move {
            let writer = self
                .take_writer()
                .map(|queue| tokio::spawn(write_stdout(queue)));
            self.running.start();
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; READ_CHUNK];
            let result = loop {
                if !self.running.is_running() {
                    break Ok(());
                }
                match timeout(POLL_TIMEOUT, stdin.read(&mut buf)).await {
                    Err(_) => continue,
                    Ok(Ok(0)) => {
                        info!("stdin closed");
                        break Ok(());
                    }
                    Ok(Ok(n)) => {
                        if !inbox.received(LOCAL_PEER, Bytes::copy_from_slice(&buf[..n])) {
                            debug!("stdin reader stopping: inbox closed");
                            break Ok(());
                        }
                    }
                    Ok(Err(err)) => break Err(TransportError::Io(err)),
                }
            };
            self.running.stop();
            // the writer keeps draining until the last sender handle drops
            drop(writer);
            result
        }
        .boxed()
    }

    fn stop(&self) {
        self.running.stop();
    }
}
