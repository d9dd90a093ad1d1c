use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::codec::{Codec, CodecError, MAX_FRAME_BYTES};
use crate::protocol::{Call, CallSpec, Direction, CALLS};
use crate::transport::{SenderId, Transport};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("call `{0}` is not declared")]
    UnknownCall(String),
    #[error("call `{0}` is not incoming for this role")]
    NotIncoming(String),
    #[error("call `{0}` is not outgoing for this role")]
    NotOutgoing(String),
    #[error("handler for `{0}` registered twice")]
    DuplicateHandler(String),
    #[error("incoming call `{0}` has no handler")]
    MissingHandler(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone)]
pub struct CallTable {
    calls: Vec<CallSpec>,
}

impl CallTable {
    pub fn new(calls: &[CallSpec]) -> Self {
        Self {
            calls: calls.to_vec(),
        }
    }

    pub fn server() -> Self {
        Self::new(CALLS)
    }

    pub fn client() -> Self {
        Self::server().invert()
    }

    pub fn invert(&self) -> Self {
        Self {
            calls: self
                .calls
                .iter()
                .map(|spec| CallSpec {
                    direction: spec.direction.invert(),
                    ..*spec
                })
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CallSpec> {
        self.calls.iter().find(|spec| spec.name == name)
    }

    pub fn incoming(&self) -> impl Iterator<Item = &CallSpec> {
        self.calls
            .iter()
            .filter(|spec| spec.direction == Direction::Incoming)
    }

    pub fn outgoing(&self) -> impl Iterator<Item = &CallSpec> {
        self.calls
            .iter()
            .filter(|spec| spec.direction == Direction::Outgoing)
    }

    fn check(&self, name: &str, direction: Direction) -> Result<(), DispatchError> {
        match self.get(name) {
            None => Err(DispatchError::UnknownCall(name.to_string())),
            Some(spec) if spec.direction == direction => Ok(()),
            Some(_) => Err(match direction {
                Direction::Incoming => DispatchError::NotIncoming(name.to_string()),
                Direction::Outgoing => DispatchError::NotOutgoing(name.to_string()),
            }),
        }
    }
}

pub type Handler<S, I, E> = fn(&mut S, &SenderId, I) -> Result<(), E>;

/// Turns inbound bytes into handler invocations on `S`.
///
/// Partial frames are kept per sender until the rest arrives. Calls that
/// decode but have no handler are counted and dropped. Only handler errors
/// escape `received`.
pub struct Dispatcher<S, I, C, E> {
    table: CallTable,
    codec: C,
    handlers: HashMap<&'static str, Handler<S, I, E>>,
    leftovers: HashMap<SenderId, Vec<u8>>,
    unhandled: BTreeMap<&'static str, usize>,
}

impl<S, I, C, E> Dispatcher<S, I, C, E>
where
    I: Call,
    C: Codec,
{
    pub fn new(table: CallTable, codec: C) -> Self {
        Self {
            table,
            codec,
            handlers: HashMap::new(),
            leftovers: HashMap::new(),
            unhandled: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &CallTable {
        &self.table
    }

    pub fn register(
        &mut self,
        name: &'static str,
        handler: Handler<S, I, E>,
    ) -> Result<(), DispatchError> {
        self.table.check(name, Direction::Incoming)?;
        if self.handlers.insert(name, handler).is_some() {
            return Err(DispatchError::DuplicateHandler(name.to_string()));
        }
        Ok(())
    }

    pub fn missing_handlers(&self) -> Vec<&'static str> {
        self.table
            .incoming()
            .map(|spec| spec.name)
            .filter(|name| !self.handlers.contains_key(name))
            .collect()
    }

    pub fn ensure_complete(&self) -> Result<(), DispatchError> {
        match self.missing_handlers().first() {
            Some(name) => Err(DispatchError::MissingHandler(name.to_string())),
            None => Ok(()),
        }
    }

    pub fn unhandled(&self) -> &BTreeMap<&'static str, usize> {
        &self.unhandled
    }

    pub fn forget(&mut self, sender: &SenderId) {
        self.leftovers.remove(sender);
    }

    pub fn pending(&self, sender: &SenderId) -> usize {
        self.leftovers.get(sender).map_or(0, Vec::len)
    }

    pub fn received(&mut self, state: &mut S, sender: &SenderId, bytes: &[u8]) -> Result<usize, E> {
        let mut buf = self.leftovers.remove(sender).unwrap_or_default();
        buf.extend_from_slice(bytes);

        let decoded = self.codec.decode::<I>(&buf);
        for err in &decoded.errors {
            warn!("dropping frame from {sender}: {err}");
        }
        let rest = &buf[decoded.consumed..];
        if rest.len() > MAX_FRAME_BYTES {
            warn!(
                "dropping {} buffered bytes from {sender}: frame too large",
                rest.len()
            );
        } else if !rest.is_empty() {
            self.leftovers.insert(sender.clone(), rest.to_vec());
        }

        let mut handled = 0;
        for call in decoded.calls {
            let name = call.name();
            if let Err(err) = self.table.check(name, Direction::Incoming) {
                warn!("call from {sender} ignored: {err}");
                continue;
            }
            let Some(handler) = self.handlers.get(name).copied() else {
                debug!("no handler for {name} (sender={sender})");
                *self.unhandled.entry(name).or_default() += 1;
                continue;
            };
            trace!("dispatch {name} from {sender}");
            handler(state, sender, call)?;
            handled += 1;
        }
        Ok(handled)
    }
}

pub struct Remote<O, C> {
    transport: Arc<dyn Transport>,
    codec: C,
    table: CallTable,
    _calls: PhantomData<fn(&O)>,
}

impl<O, C: Clone> Clone for Remote<O, C> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            codec: self.codec.clone(),
            table: self.table.clone(),
            _calls: PhantomData,
        }
    }
}

impl<O, C> Remote<O, C>
where
    O: Call,
    C: Codec,
{
    pub fn new(transport: Arc<dyn Transport>, codec: C, table: CallTable) -> Self {
        Self {
            transport,
            codec,
            table,
            _calls: PhantomData,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Encodes `call` and sends it to `receivers`, or to every peer when
    /// `None`. An empty receiver list sends nothing. Delivery failures are
    /// logged; only a call that cannot be encoded is an error.
    pub fn invoke(&self, call: &O, receivers: Option<&[SenderId]>) -> Result<(), DispatchError> {
        let name = call.name();
        self.table.check(name, Direction::Outgoing)?;
        if matches!(receivers, Some([])) {
            return Ok(());
        }
        let bytes = Bytes::from(self.codec.encode(call)?);
        if let Err(err) = self.transport.send(bytes, receivers) {
            warn!("{name} not delivered: {err}");
        }
        Ok(())
    }

    pub fn broadcast(&self, call: &O) -> Result<(), DispatchError> {
        self.invoke(call, None)
    }

    pub fn send_to(&self, receiver: &SenderId, call: &O) -> Result<(), DispatchError> {
        self.invoke(call, Some(std::slice::from_ref(receiver)))
    }

    pub fn close(&self, peer: &SenderId) {
        self.transport.close(peer);
    }

    pub fn stop(&self) {
        self.transport.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonLinesCodec;
    use crate::protocol::{ClientMsg, ServerMsg};
    use crate::transport::MemoryTransport;

    #[derive(Default)]
    struct Log {
        seen: Vec<(String, String)>,
    }

    fn record(log: &mut Log, sender: &SenderId, call: ClientMsg) -> Result<(), String> {
        log.seen.push((sender.to_string(), call.name().to_string()));
        Ok(())
    }

    fn refuse(_: &mut Log, _: &SenderId, _: ClientMsg) -> Result<(), String> {
        Err("refused".into())
    }

    fn dispatcher() -> Dispatcher<Log, ClientMsg, JsonLinesCodec, String> {
        Dispatcher::new(CallTable::server(), JsonLinesCodec)
    }

    #[test]
    fn client_table_is_inverted() {
        let server = CallTable::server();
        let client = CallTable::client();
        for spec in server.incoming() {
            assert_eq!(client.get(spec.name).unwrap().direction, Direction::Outgoing);
        }
        assert_eq!(server.incoming().count(), client.outgoing().count());
        assert_eq!(client.invert().incoming().count(), server.incoming().count());
    }

    #[test]
    fn register_checks_direction() {
        let mut d = dispatcher();
        assert!(d.register("grab", record).is_ok());
        assert!(matches!(
            d.register("grab", record),
            Err(DispatchError::DuplicateHandler(_))
        ));
        assert!(matches!(
            d.register("grabbed", record),
            Err(DispatchError::NotIncoming(_))
        ));
        assert!(matches!(
            d.register("fly", record),
            Err(DispatchError::UnknownCall(_))
        ));
        assert!(d.missing_handlers().contains(&"drop"));
        assert!(!d.missing_handlers().contains(&"grab"));
        assert!(matches!(
            d.ensure_complete(),
            Err(DispatchError::MissingHandler(_))
        ));
    }

    #[test]
    fn buffers_partial_frames_per_sender() {
        let mut d = dispatcher();
        d.register("grab", record).unwrap();
        let a = SenderId::new("tcp", "1");
        let b = SenderId::new("tcp", "2");
        let mut log = Log::default();

        let frame = br#"{"call":"grab","args":{"clusters":[1]}}"#;
        assert_eq!(d.received(&mut log, &a, &frame[..10]).unwrap(), 0);
        assert_eq!(d.pending(&a), 10);
        // another sender's bytes never splice into a's frame
        assert_eq!(d.received(&mut log, &b, b"{\"call\":\"grab\",\"args\":{\"clusters\":[2]}}\n").unwrap(), 1);
        let mut tail = frame[10..].to_vec();
        tail.push(b'\n');
        assert_eq!(d.received(&mut log, &a, &tail).unwrap(), 1);
        assert_eq!(d.pending(&a), 0);
        assert_eq!(
            log.seen,
            vec![
                ("tcp/2".to_string(), "grab".to_string()),
                ("tcp/1".to_string(), "grab".to_string()),
            ]
        );

        d.received(&mut log, &a, b"{\"call\"").unwrap();
        d.forget(&a);
        assert_eq!(d.pending(&a), 0);
    }

    #[test]
    fn malformed_and_unhandled_calls_are_dropped() {
        let mut d = dispatcher();
        d.register("grab", record).unwrap();
        let a = SenderId::local();
        let mut log = Log::default();
        let bytes = b"garbage\n{\"call\":\"fly\"}\n{\"call\":\"get_puzzle\"}\n{\"call\":\"grab\",\"args\":{\"clusters\":[]}}\n";
        assert_eq!(d.received(&mut log, &a, bytes).unwrap(), 1);
        assert_eq!(d.unhandled().get("get_puzzle"), Some(&1));
        assert_eq!(d.pending(&a), 0);
    }

    #[test]
    fn handler_errors_propagate() {
        let mut d = dispatcher();
        d.register("quit", refuse).unwrap();
        let mut log = Log::default();
        let err = d
            .received(&mut log, &SenderId::local(), b"{\"call\":\"quit\"}\n")
            .unwrap_err();
        assert_eq!(err, "refused");
    }

    #[test]
    fn remote_only_sends_outgoing_calls() {
        let transport = Arc::new(MemoryTransport::new("mem"));
        let remote: Remote<ServerMsg, _> =
            Remote::new(transport.clone(), JsonLinesCodec, CallTable::server());
        remote.broadcast(&ServerMsg::Solved).unwrap();
        remote
            .invoke(&ServerMsg::Dropped { clusters: vec![1] }, Some(&[]))
            .unwrap();
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].bytes[..], b"{\"call\":\"solved\"}\n");

        let inverted: Remote<ServerMsg, _> =
            Remote::new(transport.clone(), JsonLinesCodec, CallTable::client());
        assert!(matches!(
            inverted.broadcast(&ServerMsg::Solved),
            Err(DispatchError::NotOutgoing(_))
        ));

        let client: Remote<ClientMsg, _> =
            Remote::new(transport.clone(), JsonLinesCodec, CallTable::client());
        client
            .send_to(&transport.sender("server"), &ClientMsg::GetPuzzle)
            .unwrap();
        assert_eq!(transport.take_sent()[0].receivers, Some(vec![transport.sender("server")]));
    }
}
