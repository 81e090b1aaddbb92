use crate::errors::ErrorKind;
use brokerline_transport::Envelope;
use log::{error, warn};

/// One reported failure.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub subscription: Option<String>,
    pub destination: Option<String>,
    pub message_id: Option<String>,
    pub error: String,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, error: impl ToString) -> Self {
        Self {
            kind,
            subscription: None,
            destination: None,
            message_id: None,
            error: error.to_string(),
        }
    }

    pub fn for_subscription(mut self, name: &str) -> Self {
        self.subscription = Some(name.to_string());
        self
    }

    pub fn for_destination(mut self, destination: impl ToString) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn for_envelope(mut self, envelope: &Envelope) -> Self {
        self.destination = Some(envelope.destination().name.clone());
        self.message_id = Some(envelope.message_id().to_string());
        self
    }
}

/// Receives every error the engine reports. Must not block.
pub trait ErrorObserver: Send + Sync + 'static {
    fn observe(&self, event: &ErrorEvent);
}

impl<F> ErrorObserver for F
where
    F: Fn(&ErrorEvent) + Send + Sync + 'static,
{
    fn observe(&self, event: &ErrorEvent) {
        self(event)
    }
}

/// Default observer: writes events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ErrorObserver for LogObserver {
    fn observe(&self, event: &ErrorEvent) {
        let subscription = event.subscription.as_deref().unwrap_or("-");
        let message_id = event.message_id.as_deref().unwrap_or("-");
        match event.kind {
            ErrorKind::HandlerRecoverable | ErrorKind::ReplyTimeout => warn!(
                "{:?} in subscription {} (message {}): {}",
                event.kind, subscription, message_id, event.error
            ),
            _ => error!(
                "{:?} in subscription {} (message {}): {}",
                event.kind, subscription, message_id, event.error
            ),
        }
    }
}
