use std::sync::Arc;
use std::time::Duration;

use jigboard_core::transport::TcpTransport;
use jigboard_core::{
    CallTable, ClientMsg, Dispatcher, Handler, Inbound, Inbox, Remote, ServerMsg, Transport,
    TransportError, WireFormat,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

pub(crate) type PeerError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type PeerHandler<S> = Handler<S, ServerMsg, PeerError>;

const CHANNEL: &str = "tcp";
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// One connection to a server, driven from the player side of the call
/// table. Server calls are dispatched into `S` only while the caller pumps.
pub(crate) struct Session<S> {
    transport: Arc<TcpTransport>,
    remote: Remote<ClientMsg, WireFormat>,
    dispatcher: Dispatcher<S, ServerMsg, WireFormat, PeerError>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    task: JoinHandle<Result<(), TransportError>>,
    open: bool,
}

impl<S> Session<S> {
    pub(crate) async fn connect(
        addr: &str,
        wire: WireFormat,
        handlers: &[(&'static str, PeerHandler<S>)],
    ) -> Result<Self, PeerError> {
        let table = CallTable::client();
        let mut dispatcher = Dispatcher::new(table.clone(), wire);
        for &(name, handler) in handlers {
            dispatcher.register(name, handler)?;
        }

        let transport = Arc::new(TcpTransport::connect(CHANNEL, addr).await?);
        let remote = Remote::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            wire,
            table,
        );
        let (tx, inbound) = mpsc::unbounded_channel();
        let task = tokio::spawn(Arc::clone(&transport).run(Inbox::new(CHANNEL, tx)));

        let ready_by = Instant::now() + READY_TIMEOUT;
        while transport.peer_count() == 0 {
            if task.is_finished() || Instant::now() >= ready_by {
                transport.stop();
                return Err(format!("connection to {addr} did not come up").into());
            }
            sleep(Duration::from_millis(5)).await;
        }
        info!("connected to {addr} (local={})", transport.local_addr());
        Ok(Self {
            transport,
            remote,
            dispatcher,
            inbound,
            task,
            open: true,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn call(&self, call: ClientMsg) -> Result<(), PeerError> {
        self.remote.send_to(&self.transport.server(), &call)?;
        Ok(())
    }

    /// Handles server calls for `wait`. Returns whether the connection is
    /// still up.
    pub(crate) async fn pump(&mut self, state: &mut S, wait: Duration) -> Result<bool, PeerError> {
        self.pump_until(state, wait, |_| false).await?;
        Ok(self.open)
    }

    /// Handles server calls until `done` holds, `wait` runs out or the
    /// connection ends. Returns whether `done` was reached.
    pub(crate) async fn pump_until(
        &mut self,
        state: &mut S,
        wait: Duration,
        done: impl Fn(&S) -> bool,
    ) -> Result<bool, PeerError> {
        let deadline = Instant::now() + wait;
        while self.open {
            if done(state) {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.inbound.recv()).await {
                Err(_) => break,
                Ok(Some(event)) => self.handle(state, event)?,
                Ok(None) => self.open = false,
            }
        }
        Ok(done(state))
    }

    fn handle(&mut self, state: &mut S, event: Inbound) -> Result<(), PeerError> {
        match event {
            Inbound::Data { sender, bytes } => {
                self.dispatcher.received(state, &sender, &bytes)?;
            }
            Inbound::Closed { sender } => {
                info!("server hung up ({sender})");
                self.dispatcher.forget(&sender);
                self.open = false;
            }
        }
        Ok(())
    }

    /// Says goodbye if still connected and waits for the transport to wind
    /// down.
    pub(crate) async fn finish(self) -> Result<(), PeerError> {
        if self.open {
            self.call(ClientMsg::Disconnect)?;
        }
        self.transport.stop();
        self.task.await??;
        debug!("session closed; unhandled calls: {:?}", self.dispatcher.unhandled());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jigboard_core::SenderId;

    #[derive(Default)]
    struct Seen {
        solved: bool,
    }

    fn on_solved(seen: &mut Seen, _: &SenderId, _: ServerMsg) -> Result<(), PeerError> {
        seen.solved = true;
        Ok(())
    }

    #[tokio::test]
    async fn session_talks_to_a_listener() {
        let server = Arc::new(TcpTransport::bind("tcp", "127.0.0.1:0").await.unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server_task = tokio::spawn(Arc::clone(&server).run(Inbox::new("tcp", tx)));

        let addr = server.local_addr().to_string();
        let handlers: [(&'static str, PeerHandler<Seen>); 1] = [("solved", on_solved)];
        let mut session = Session::connect(&addr, WireFormat::JsonLines, &handlers)
            .await
            .unwrap();
        session
            .call(ClientMsg::Connect { name: "ann".into() })
            .unwrap();

        let peer = match rx.recv().await.unwrap() {
            Inbound::Data { sender, bytes } => {
                assert_eq!(&bytes[..], b"{\"call\":\"connect\",\"args\":{\"name\":\"ann\"}}\n");
                sender
            }
            other => panic!("unexpected {other:?}"),
        };
        server
            .send(b"{\"call\":\"solved\"}\n".to_vec().into(), Some(&[peer]))
            .unwrap();

        let mut seen = Seen::default();
        let reached = session
            .pump_until(&mut seen, Duration::from_secs(5), |seen| seen.solved)
            .await
            .unwrap();
        assert!(reached);

        session.finish().await.unwrap();
        server.stop();
        server_task.await.unwrap().unwrap();
    }
}
