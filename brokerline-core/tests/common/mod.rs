#![allow(dead_code)]

use async_trait::async_trait;
use brokerline_core::{ErrorEvent, ErrorKind, ErrorObserver};
use brokerline_transport::in_memory::InMemoryTransport;
use brokerline_transport::{
    Capabilities, DeliveryToken, Destination, Envelope, OutboundMessage, Transport,
    TransportError,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<ErrorEvent>>>);

impl Events {
    pub fn observer(&self) -> impl ErrorObserver {
        let events = Arc::clone(&self.0);
        move |event: &ErrorEvent| events.lock().push(event.clone())
    }

    pub fn kinds(&self) -> Vec<ErrorKind> {
        self.0.lock().iter().map(|event| event.kind).collect()
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.0.lock().iter().filter(|event| event.kind == kind).count()
    }

    pub fn all(&self) -> Vec<ErrorEvent> {
        self.0.lock().clone()
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// In-memory transport whose publishes to chosen destinations fail or never
/// complete.
#[derive(Clone)]
pub struct OutboundFaults {
    inner: InMemoryTransport,
    failing: Arc<HashSet<String>>,
    stalled: Arc<HashSet<String>>,
}

impl OutboundFaults {
    pub fn new(inner: InMemoryTransport, failing: &[&str], stalled: &[&str]) -> Self {
        Self {
            inner,
            failing: Arc::new(failing.iter().map(|name| name.to_string()).collect()),
            stalled: Arc::new(stalled.iter().map(|name| name.to_string()).collect()),
        }
    }
}

#[async_trait]
impl Transport for OutboundFaults {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    async fn bind(&self, destination: &Destination) -> Result<(), TransportError> {
        self.inner.bind(destination).await
    }

    async fn receive(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError> {
        self.inner.receive(destination, timeout).await
    }

    async fn ack(&self, token: DeliveryToken) -> Result<(), TransportError> {
        self.inner.ack(token).await
    }

    async fn nack(&self, token: DeliveryToken, requeue: bool) -> Result<(), TransportError> {
        self.inner.nack(token, requeue).await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let name = &message.destination.name;
        if self.failing.contains(name) {
            return Err(TransportError::Connection(format!("{name} is unreachable")));
        }
        if self.stalled.contains(name) {
            std::future::pending::<()>().await;
        }
        self.inner.publish(message).await
    }
}
