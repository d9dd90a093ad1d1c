use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use tracing::{debug, warn};

use super::{Inbox, SenderId, Transport, TransportError};

/// Presents several transports as one. Channel names must be unique, so a
/// [`SenderId`] always routes back to the transport that produced it.
pub struct Multiplexer {
    channel: String,
    transports: Vec<Arc<dyn Transport>>,
}

impl Multiplexer {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            transports: Vec::new(),
        }
    }

    pub fn with_transports(
        channel: impl Into<String>,
        transports: impl IntoIterator<Item = Arc<dyn Transport>>,
    ) -> Result<Self, TransportError> {
        let mut mux = Self::new(channel);
        for transport in transports {
            mux.add(transport)?;
        }
        Ok(mux)
    }

    pub fn add(&mut self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        let name = transport.channel();
        if self.transports.iter().any(|t| t.channel() == name) {
            return Err(TransportError::DuplicateChannel(name.to_string()));
        }
        self.transports.push(transport);
        Ok(())
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.transports.iter().map(|t| t.channel())
    }

    fn owner(&self, channel: &str) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.channel() == channel)
    }
}

impl Transport for Multiplexer {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn send(&self, bytes: Bytes, receivers: Option<&[SenderId]>) -> Result<(), TransportError> {
        let Some(receivers) = receivers else {
            let mut result = Ok(());
            for transport in &self.transports {
                if let Err(err) = transport.send(bytes.clone(), None) {
                    warn!("broadcast failed on {}: {err}", transport.channel());
                    result = Err(err);
                }
            }
            return result;
        };

        let mut by_channel: HashMap<&str, Vec<SenderId>> = HashMap::new();
        for id in receivers {
            by_channel.entry(id.channel()).or_default().push(id.clone());
        }
        let mut result = Ok(());
        for (channel, ids) in by_channel {
            let Some(transport) = self.owner(channel) else {
                debug!("send dropped: unknown channel (channel={channel})");
                result = Err(TransportError::UnknownChannel(channel.to_string()));
                continue;
            };
            if let Err(err) = transport.send(bytes.clone(), Some(&ids)) {
                warn!("send failed on {channel}: {err}");
                result = Err(err);
            }
        }
        result
    }

    fn close(&self, peer: &SenderId) {
        if let Some(transport) = self.owner(peer.channel()) {
            transport.close(peer);
        }
    }

    fn run(self: Arc<Self>, inbox: Inbox) -> BoxFuture<'static, Result<(), TransportError>> {
        let runs = self
            .transports
            .iter()
            .map(|transport| {
                let inbox = inbox.with_channel(transport.channel());
                Arc::clone(transport).run(inbox)
            })
            .collect::<Vec<_>>();
        async move {
            let results = join_all(runs).await;
            results.into_iter().collect::<Result<Vec<()>, _>>().map(|_| ())
        }
        .boxed()
    }

    fn stop(&self) {
        for transport in &self.transports {
            transport.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>, Multiplexer) {
        let a = Arc::new(MemoryTransport::new("a"));
        let b = Arc::new(MemoryTransport::new("b"));
        let mux = Multiplexer::with_transports(
            "mux",
            [
                Arc::clone(&a) as Arc<dyn Transport>,
                Arc::clone(&b) as Arc<dyn Transport>,
            ],
        )
        .unwrap();
        (a, b, mux)
    }

    #[test]
    fn rejects_duplicate_channels() {
        let (_, _, mut mux) = pair();
        let err = mux.add(Arc::new(MemoryTransport::new("a"))).unwrap_err();
        assert!(matches!(err, TransportError::DuplicateChannel(name) if name == "a"));
    }

    #[test]
    fn routes_by_channel() {
        let (a, b, mux) = pair();
        mux.send(Bytes::from_static(b"hi"), Some(&[SenderId::new("b", "1")]))
            .unwrap();
        assert!(a.take_sent().is_empty());
        let sent = b.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].receivers, Some(vec![SenderId::new("b", "1")]));

        mux.send(Bytes::from_static(b"all"), None).unwrap();
        assert_eq!(a.take_sent().len(), 1);
        assert_eq!(b.take_sent().len(), 1);

        mux.close(&SenderId::new("a", "9"));
        assert_eq!(a.closed_peers(), vec![SenderId::new("a", "9")]);
        assert!(b.closed_peers().is_empty());
    }

    #[test]
    fn unknown_channel_is_reported() {
        let (_, _, mux) = pair();
        let err = mux
            .send(Bytes::from_static(b"x"), Some(&[SenderId::new("zz", "1")]))
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownChannel(_)));
    }
}
