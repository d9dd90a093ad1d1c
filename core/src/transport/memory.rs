use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::Notify;

use super::{Inbox, RunFlag, SenderId, Transport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub receivers: Option<Vec<SenderId>>,
    pub bytes: Bytes,
}

#[derive(Default)]
struct MemoryState {
    sent: Vec<Sent>,
    closed: Vec<SenderId>,
    inbox: Option<Inbox>,
}

pub struct MemoryTransport {
    channel: String,
    state: Mutex<MemoryState>,
    running: RunFlag,
    stopped: Notify,
}

impl MemoryTransport {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            state: Mutex::new(MemoryState::default()),
            running: RunFlag::default(),
            stopped: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sender(&self, peer: &str) -> SenderId {
        SenderId::new(self.channel.as_str(), peer)
    }

    pub fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut self.state().sent)
    }

    pub fn closed_peers(&self) -> Vec<SenderId> {
        self.state().closed.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    pub fn inject(&self, peer: &str, bytes: impl Into<Bytes>) -> Result<(), TransportError> {
        let state = self.state();
        let inbox = state
            .inbox
            .as_ref()
            .ok_or_else(|| TransportError::NotRunning(self.channel.clone()))?;
        if inbox.received(peer, bytes.into()) {
            Ok(())
        } else {
            Err(TransportError::NotRunning(self.channel.clone()))
        }
    }

    pub fn hang_up(&self, peer: &str) -> Result<(), TransportError> {
        let state = self.state();
        match state.inbox.as_ref() {
            Some(inbox) if inbox.closed(peer) => Ok(()),
            _ => Err(TransportError::NotRunning(self.channel.clone())),
        }
    }
}

impl Transport for MemoryTransport {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn send(&self, bytes: Bytes, receivers: Option<&[SenderId]>) -> Result<(), TransportError> {
        let receivers = receivers.map(|ids| {
            ids.iter()
                .filter(|id| id.channel() == self.channel)
                .cloned()
                .collect::<Vec<_>>()
        });
        if matches!(&receivers, Some(ids) if ids.is_empty()) {
            return Ok(());
        }
        self.state().sent.push(Sent { receivers, bytes });
        Ok(())
    }

    fn close(&self, peer: &SenderId) {
        self.state().closed.push(peer.clone());
    }

    fn run(self: Arc<Self>, inbox: Inbox) -> BoxFuture<'static, Result<(), TransportError>> {
        async move {
            let stopped = self.stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            self.state().inbox = Some(inbox);
            self.running.start();
            stopped.await;
            self.state().inbox = None;
            Ok(())
        }
        .boxed()
    }

    fn stop(&self) {
        self.running.stop();
        self.stopped.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Inbound;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn injects_and_records() {
        let transport = Arc::new(MemoryTransport::new("mem"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Arc::clone(&transport).run(Inbox::new("mem", tx)));
        while !transport.is_running() {
            tokio::task::yield_now().await;
        }
        transport.inject("a", &b"hello"[..]).unwrap();
        match rx.recv().await.unwrap() {
            Inbound::Data { sender, bytes } => {
                assert_eq!(sender, transport.sender("a"));
                assert_eq!(&bytes[..], b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }

        let elsewhere = SenderId::new("tcp", "a");
        transport
            .send(Bytes::from_static(b"x"), Some(&[elsewhere]))
            .unwrap();
        transport.send(Bytes::from_static(b"y"), None).unwrap();
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].receivers, None);

        transport.stop();
        task.await.unwrap().unwrap();
        assert!(transport.inject("a", &b"late"[..]).is_err());
    }
}
