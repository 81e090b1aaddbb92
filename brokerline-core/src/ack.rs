use crate::errors::SettleError;
use brokerline_transport::{AckHandle, Transport};
use log::debug;
use std::sync::Arc;

/// Lets a manually acking handler settle its own delivery.
///
/// Shares the consumed flag with the dispatcher's copy of the handle, so a
/// delivery is settled at most once no matter who gets there first.
#[derive(Clone)]
pub struct Acker {
    handle: AckHandle,
    transport: Arc<dyn Transport>,
}

impl Acker {
    pub(crate) fn new(handle: AckHandle, transport: Arc<dyn Transport>) -> Self {
        Self { handle, transport }
    }

    pub async fn ack(&self) -> Result<(), SettleError> {
        let token = self.handle.consume()?;
        debug!("handler acked delivery {}", token.delivery_id());
        self.transport.ack(token).await?;
        Ok(())
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), SettleError> {
        let token = self.handle.consume()?;
        debug!(
            "handler nacked delivery {} (requeue: {})",
            token.delivery_id(),
            requeue
        );
        self.transport.nack(token, requeue).await?;
        Ok(())
    }

    pub fn is_settled(&self) -> bool {
        self.handle.is_consumed()
    }
}
