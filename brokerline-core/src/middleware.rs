use crate::errors::{DispatchError, PublishError};
use async_trait::async_trait;
use brokerline_transport::{Envelope, OutboundMessage, Transport};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

pub type DispatchResult = Result<Option<Value>, DispatchError>;

/// Innermost step of a consume chain: route, resolve and invoke the handler.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, envelope: Envelope) -> DispatchResult;
}

/// Wraps message handling.
///
/// The first middleware registered is the outermost: it sees the envelope
/// first and the result last. A middleware may hand `next` a modified copy of
/// the envelope, skip `next` entirely, or turn an error into a result.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn around(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult;
}

/// Remainder of a consume chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(self, envelope: Envelope) -> DispatchResult {
        match self.chain.split_first() {
            Some((current, rest)) => {
                current
                    .around(envelope, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.call(envelope).await,
        }
    }
}

/// Wraps outbound publishing, including replies and dead letters.
#[async_trait]
pub trait PublishMiddleware: Send + Sync + 'static {
    async fn around_publish(
        &self,
        message: OutboundMessage,
        next: PublishNext<'_>,
    ) -> Result<(), PublishError>;
}

/// Remainder of a publish chain; ends at the transport.
pub struct PublishNext<'a> {
    chain: &'a [Arc<dyn PublishMiddleware>],
    transport: &'a dyn Transport,
}

impl<'a> PublishNext<'a> {
    pub fn new(chain: &'a [Arc<dyn PublishMiddleware>], transport: &'a dyn Transport) -> Self {
        Self { chain, transport }
    }

    pub async fn run(self, message: OutboundMessage) -> Result<(), PublishError> {
        match self.chain.split_first() {
            Some((current, rest)) => {
                current
                    .around_publish(message, PublishNext::new(rest, self.transport))
                    .await
            }
            None => {
                let destination = message.destination.to_string();
                self.transport
                    .publish(message)
                    .await
                    .map_err(|source| PublishError::Transport {
                        destination,
                        source,
                    })
            }
        }
    }
}

/// Logs every message with its outcome and processing time.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn around(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        let message_id = envelope.message_id().to_string();
        let destination = envelope.destination().to_string();
        let started = Instant::now();
        debug!(
            "received {} on {} (delivery {})",
            message_id,
            destination,
            envelope.delivery_count()
        );

        let result = next.run(envelope).await;
        match &result {
            Ok(_) => info!(
                "processed {} on {} in {:?}",
                message_id,
                destination,
                started.elapsed()
            ),
            Err(err) => warn!(
                "failed {} on {} after {:?}: {}",
                message_id,
                destination,
                started.elapsed(),
                err
            ),
        }
        result
    }
}

#[async_trait]
impl PublishMiddleware for LoggingMiddleware {
    async fn around_publish(
        &self,
        message: OutboundMessage,
        next: PublishNext<'_>,
    ) -> Result<(), PublishError> {
        let message_id = message.message_id.clone();
        let destination = message.destination.to_string();
        let result = next.run(message).await;
        match &result {
            Ok(_) => debug!("published {} to {}", message_id, destination),
            Err(err) => warn!("publish of {} to {} failed: {}", message_id, destination, err),
        }
        result
    }
}

/// Skips messages whose correlation id (or message id, when there is none)
/// was already processed successfully.
///
/// Remembers at most `capacity` keys; the oldest are forgotten first.
pub struct Deduplicate {
    capacity: usize,
    seen: Mutex<Seen>,
}

#[derive(Default)]
struct Seen {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl Deduplicate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: Mutex::new(Seen::default()),
        }
    }

    fn key(envelope: &Envelope) -> String {
        envelope
            .correlation_id()
            .unwrap_or_else(|| envelope.message_id())
            .to_string()
    }

    fn remember(&self, key: String) {
        let mut seen = self.seen.lock();
        if !seen.keys.insert(key.clone()) {
            return;
        }
        seen.order.push_back(key);
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.keys.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl Middleware for Deduplicate {
    async fn around(&self, envelope: Envelope, next: Next<'_>) -> DispatchResult {
        let key = Self::key(&envelope);
        if self.seen.lock().keys.contains(&key) {
            debug!("skipping duplicate {} ({})", envelope.message_id(), key);
            return Ok(None);
        }

        let result = next.run(envelope).await;
        if result.is_ok() {
            self.remember(key);
        }
        result
    }
}
