use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("destination {0} was rejected by the transport")]
    Rejected(String),
    #[error("delivery not found: {0}")]
    UnknownDelivery(uuid::Uuid),
    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("internal transport error: {0}")]
    Internal(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AckError {
    #[error("ack handle for delivery {0} was already consumed")]
    AlreadyConsumed(uuid::Uuid),
}
