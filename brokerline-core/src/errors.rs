use brokerline_transport::{AckError, TransportError};
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Category attached to every reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Decode,
    Resolution,
    HandlerRecoverable,
    HandlerTerminal,
    Transport,
    Publish,
    ReplyTimeout,
    AckFault,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed {content_type} payload: {message}")]
    Malformed {
        content_type: String,
        message: String,
    },
    #[error("payload is not a valid {expected}: {message}")]
    Type {
        expected: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("required header '{0}' is missing")]
    MissingHeader(String),
    #[error("message carries no correlation id")]
    MissingCorrelationId,
    #[error("no provider registered for {0}")]
    MissingProvider(&'static str),
    #[error("provider for {type_name} failed: {message}")]
    Provider {
        type_name: &'static str,
        message: String,
    },
    #[error("no route accepted message {0}")]
    NoRoute(String),
}

/// Whether a failed message is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Recoverable,
    Terminal,
}

/// Failure raised by user handler code.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    disposition: Disposition,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl HandlerError {
    /// The message may succeed on redelivery.
    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            disposition: Disposition::Recoverable,
            message: message.into(),
            source: None,
        }
    }

    /// The message must never be redelivered.
    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            disposition: Disposition::Terminal,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn is_recoverable(&self) -> bool {
        self.disposition == Disposition::Recoverable
    }
}

/// Failure settling a delivery from inside a handler.
#[derive(Debug, Error)]
pub enum SettleError {
    #[error(transparent)]
    AlreadyConsumed(#[from] AckError),
    #[error("transport refused settlement: {0}")]
    Transport(#[from] TransportError),
}

impl From<SettleError> for HandlerError {
    fn from(err: SettleError) -> Self {
        match err {
            SettleError::AlreadyConsumed(_) => HandlerError::reject(err.to_string()),
            SettleError::Transport(_) => HandlerError::retry(err.to_string()),
        }
    }
}

/// Everything that can go wrong between receiving an envelope and the
/// handler returning.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("failed to publish handler result: {0}")]
    Reply(#[source] PublishError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Decode(_) => ErrorKind::Decode,
            DispatchError::Resolution(_) => ErrorKind::Resolution,
            DispatchError::Handler(err) if err.is_recoverable() => ErrorKind::HandlerRecoverable,
            DispatchError::Handler(_) => ErrorKind::HandlerTerminal,
            DispatchError::Reply(_) => ErrorKind::Publish,
        }
    }

    /// Decode and resolution failures never heal on redelivery; a reply that
    /// could not be published may.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DispatchError::Handler(err) => err.is_recoverable(),
            DispatchError::Reply(_) => true,
            DispatchError::Decode(_) | DispatchError::Resolution(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker is not running; publishing to {0} requires start()")]
    NotConnected(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("transport failed to publish to {destination}: {source}")]
    Transport {
        destination: String,
        #[source]
        source: TransportError,
    },
    #[error("no reply from {destination} within {timeout:?}")]
    ReplyTimeout {
        destination: String,
        timeout: Duration,
    },
    #[error("reply listener stopped before a reply arrived")]
    ReplyDropped,
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PublishError::ReplyTimeout { .. } => ErrorKind::ReplyTimeout,
            _ => ErrorKind::Publish,
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is already running")]
    AlreadyRunning,
    #[error("subscription '{0}' is declared twice")]
    DuplicateSubscription(String),
    #[error("subscription '{0}' has no handler")]
    NoHandler(String),
    #[error("subscription '{subscription}' needs {type_name} but no provider is registered")]
    MissingProvider {
        subscription: String,
        type_name: &'static str,
    },
    #[error("failed to connect transport: {0}")]
    Connect(#[source] TransportError),
    #[error("failed to bind {destination}: {source}")]
    Bind {
        destination: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to close transport: {0}")]
    Close(#[source] TransportError),
    #[error("{stage} hook failed: {message}")]
    Hook {
        stage: &'static str,
        message: String,
    },
}
