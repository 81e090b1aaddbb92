pub mod http;
pub mod in_memory;
mod errors;
mod types;

pub use errors::{AckError, TransportError};
pub use types::{
    AckHandle, Capabilities, DeliveryModel, DeliveryToken, Destination, Envelope, Headers,
    OutboundMessage,
};

use async_trait::async_trait;
use std::time::Duration;

/// Broker-specific I/O behind the dispatch engine.
///
/// One transport value is shared by every subscription and publisher of a
/// broker, so implementations must tolerate concurrent calls.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivery model and settlement features of this backend.
    fn capabilities(&self) -> Capabilities;

    /// Open the underlying connection. Called once before any other operation.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Release the connection. Further calls fail with `NotConnected`.
    async fn close(&self) -> Result<(), TransportError>;

    /// Declare or validate a destination a subscription is about to consume.
    async fn bind(&self, destination: &Destination) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next delivery; `Ok(None)` on timeout.
    ///
    /// Dropping the returned future must not lose or settle a delivery.
    async fn receive(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError>;

    /// Acknowledge successful processing of a delivery.
    async fn ack(&self, token: DeliveryToken) -> Result<(), TransportError>;

    /// Reject a delivery, optionally returning it to the destination.
    async fn nack(&self, token: DeliveryToken, requeue: bool) -> Result<(), TransportError>;

    /// Hand an encoded message to the broker.
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;
}
