use jigboard_core::codec::Codec;
use jigboard_core::dispatch::{DispatchError, Dispatcher};
use jigboard_core::protocol::ClientMsg;
use jigboard_core::transport::Inbound;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::service::{PuzzleService, ServiceError};

/// Sole owner of the service. Inbound events are handled strictly in queue
/// order, so no two calls ever interleave.
pub struct Actor<C: Codec> {
    service: PuzzleService<C>,
    dispatcher: Dispatcher<PuzzleService<C>, ClientMsg, C, ServiceError>,
}

impl<C: Codec> Actor<C> {
    pub fn new(service: PuzzleService<C>, codec: C) -> Result<Self, DispatchError> {
        Ok(Self {
            service,
            dispatcher: PuzzleService::dispatcher(codec)?,
        })
    }

    pub fn service(&self) -> &PuzzleService<C> {
        &self.service
    }

    pub fn into_service(self) -> PuzzleService<C> {
        self.service
    }

    pub fn handle(&mut self, event: Inbound) -> Result<(), ServiceError> {
        let span = self.service.span().clone();
        let _entered = span.enter();
        match event {
            Inbound::Data { sender, bytes } => {
                self.dispatcher
                    .received(&mut self.service, &sender, &bytes)?;
            }
            Inbound::Closed { sender } => {
                self.dispatcher.forget(&sender);
                self.service.connection_closed(&sender)?;
            }
        }
        Ok(())
    }

    /// Runs until every transport has stopped and the queue is drained.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Result<PuzzleService<C>, ServiceError> {
        while let Some(event) = inbound.recv().await {
            if let Err(err) = self.handle(event) {
                error!(fatal = true, "dispatch loop failed: {err}");
                return Err(err);
            }
        }
        debug!(
            "inbound queue closed; unhandled calls: {:?}",
            self.dispatcher.unhandled()
        );
        Ok(self.service)
    }
}
