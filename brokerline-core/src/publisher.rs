use crate::codec::{to_payload, Codec};
use crate::dispatcher::stopped;
use crate::errors::{ErrorKind, PublishError};
use crate::middleware::{PublishMiddleware, PublishNext};
use crate::observer::{ErrorEvent, ErrorObserver};
use crate::policy::DispatchSettings;
use brokerline_transport::{Destination, Envelope, Headers, OutboundMessage, Transport};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// State shared by a broker, its publishers and its dispatchers.
pub(crate) struct BrokerLink {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) observer: Arc<dyn ErrorObserver>,
    pub(crate) middleware: Vec<Arc<dyn PublishMiddleware>>,
    pub(crate) replies: ReplyRouter,
    open: AtomicBool,
}

impl BrokerLink {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        observer: Arc<dyn ErrorObserver>,
        middleware: Vec<Arc<dyn PublishMiddleware>>,
        reply_destination: Destination,
    ) -> Self {
        Self {
            transport,
            codec,
            observer,
            middleware,
            replies: ReplyRouter::new(reply_destination),
            open: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn report(&self, event: ErrorEvent) {
        self.observer.observe(&event);
    }

    /// Publish through the broker-level outbound chain.
    pub(crate) async fn send(&self, message: OutboundMessage) -> Result<(), PublishError> {
        PublishNext::new(&self.middleware, self.transport.as_ref())
            .run(message)
            .await
    }
}

/// Per-message publish settings.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub routing_key: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishOptions {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn reply_to(mut self, destination: impl Into<String>) -> Self {
        self.reply_to = Some(destination.into());
        self
    }
}

/// Sends messages to one destination.
///
/// Cheap to clone. Usable between `Broker::start` and `Broker::stop`;
/// outside that window every call fails with `PublishError::NotConnected`.
#[derive(Clone)]
pub struct Publisher {
    destination: Destination,
    chain: Arc<[Arc<dyn PublishMiddleware>]>,
    link: Arc<BrokerLink>,
}

impl Publisher {
    pub(crate) fn new(
        link: Arc<BrokerLink>,
        destination: Destination,
        middleware: Vec<Arc<dyn PublishMiddleware>>,
    ) -> Self {
        let chain: Vec<_> = link.middleware.iter().cloned().chain(middleware).collect();
        Self {
            destination,
            chain: chain.into(),
            link,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Publish `payload`, returning the new message id.
    pub async fn publish<T>(&self, payload: &T) -> Result<String, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with(payload, PublishOptions::default()).await
    }

    pub async fn publish_with<T>(
        &self,
        payload: &T,
        options: PublishOptions,
    ) -> Result<String, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let result = self.encode_and_send(payload, options).await;
        self.observe(result)
    }

    /// Publish an already encoded body, bypassing the codec.
    pub async fn publish_raw(
        &self,
        body: Vec<u8>,
        content_type: Option<String>,
        options: PublishOptions,
    ) -> Result<String, PublishError> {
        let result = self.send(body, content_type, options).await;
        self.observe(result)
    }

    /// Publish `payload` and wait for the reply correlated with it.
    pub async fn request<T>(&self, payload: &T, timeout: Duration) -> Result<Envelope, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.request_with(payload, PublishOptions::default(), timeout)
            .await
    }

    pub async fn request_with<T>(
        &self,
        payload: &T,
        options: PublishOptions,
        timeout: Duration,
    ) -> Result<Envelope, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let options = PublishOptions {
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(self.link.replies.destination().name.clone()),
            ..options
        };

        let pending = self.link.replies.register(&correlation_id);
        if let Err(err) = self.publish_with(payload, options).await {
            self.link.replies.cancel(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, pending).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(PublishError::ReplyDropped),
            Err(_) => {
                self.link.replies.cancel(&correlation_id);
                let err = PublishError::ReplyTimeout {
                    destination: self.destination.to_string(),
                    timeout,
                };
                self.link.report(
                    ErrorEvent::new(ErrorKind::ReplyTimeout, &err)
                        .for_destination(&self.destination),
                );
                Err(err)
            }
        }
    }

    async fn encode_and_send<T>(
        &self,
        payload: &T,
        options: PublishOptions,
    ) -> Result<String, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let value = to_payload(payload)?;
        let encoded = self.link.codec.encode(&value)?;
        self.send(encoded.body, encoded.content_type, options).await
    }

    async fn send(
        &self,
        body: Vec<u8>,
        content_type: Option<String>,
        options: PublishOptions,
    ) -> Result<String, PublishError> {
        if !self.link.is_open() {
            return Err(PublishError::NotConnected(self.destination.to_string()));
        }

        let mut destination = self.destination.clone();
        if let Some(key) = options.routing_key {
            destination.routing_key = Some(key);
        }
        let mut message = OutboundMessage::new(destination, body);
        message.headers = options.headers;
        message.content_type = content_type;
        message.correlation_id = options.correlation_id;
        message.reply_to = options.reply_to;

        let message_id = message.message_id.clone();
        PublishNext::new(&self.chain, self.link.transport.as_ref())
            .run(message)
            .await?;
        Ok(message_id)
    }

    fn observe(&self, result: Result<String, PublishError>) -> Result<String, PublishError> {
        if let Err(err) = &result {
            self.link.report(
                ErrorEvent::new(err.kind(), err).for_destination(&self.destination),
            );
        }
        result
    }
}

/// Handle handlers and application code use to publish while the broker runs.
///
/// Registered as a dependency on every subscription, so a handler can ask for
/// it with `Requirement::dependency::<BrokerHandle>()`.
#[derive(Clone)]
pub struct BrokerHandle {
    link: Arc<BrokerLink>,
}

impl BrokerHandle {
    pub(crate) fn new(link: Arc<BrokerLink>) -> Self {
        Self { link }
    }

    pub fn publisher(&self, destination: impl Into<Destination>) -> Publisher {
        Publisher::new(Arc::clone(&self.link), destination.into(), Vec::new())
    }

    pub async fn publish<T>(
        &self,
        destination: impl Into<Destination>,
        payload: &T,
        options: PublishOptions,
    ) -> Result<String, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher(destination)
            .publish_with(payload, options)
            .await
    }

    pub fn is_running(&self) -> bool {
        self.link.is_open()
    }
}

/// Matches replies on the broker's private destination to waiting requests.
pub(crate) struct ReplyRouter {
    destination: Destination,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl ReplyRouter {
    fn new(destination: Destination) -> Self {
        Self {
            destination,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn destination(&self) -> &Destination {
        &self.destination
    }

    fn register(&self, correlation_id: &str) -> oneshot::Receiver<Envelope> {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(correlation_id.to_string(), sender);
        receiver
    }

    fn cancel(&self, correlation_id: &str) {
        self.pending.lock().remove(correlation_id);
    }

    fn deliver(&self, envelope: Envelope) -> bool {
        let Some(correlation_id) = envelope.correlation_id() else {
            return false;
        };
        let waiting = self.pending.lock().remove(correlation_id);
        match waiting {
            Some(sender) => sender.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Wake every waiting request with `ReplyDropped`.
    fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// Consume the reply destination until shutdown.
pub(crate) async fn listen_for_replies(
    link: Arc<BrokerLink>,
    settings: DispatchSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let destination = link.replies.destination().clone();
    let mut failures = 0u32;

    loop {
        let received = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            received = link.transport.receive(&destination, settings.receive_timeout) => received,
        };

        match received {
            Ok(Some(envelope)) => {
                failures = 0;
                let handle = envelope.ack_handle().clone();
                let message_id = envelope.message_id().to_string();
                if !link.replies.deliver(envelope) {
                    debug!("dropping reply {} nobody is waiting for", message_id);
                }
                if let Ok(token) = handle.consume() {
                    if let Err(err) = link.transport.ack(token).await {
                        link.report(
                            ErrorEvent::new(ErrorKind::Transport, err).for_destination(&destination),
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                failures = failures.saturating_add(1);
                link.report(ErrorEvent::new(ErrorKind::Transport, &err).for_destination(&destination));
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    _ = tokio::time::sleep(settings.reconnect.delay(failures)) => {}
                }
                if let Err(err) = link.transport.connect().await {
                    warn!("reconnecting reply listener failed: {}", err);
                }
            }
        }
    }

    link.replies.clear();
    debug!("reply listener on {} stopped", destination);
}
