use crate::ack::Acker;
use crate::codec::Codec;
use crate::errors::{
    BrokerError, DispatchError, ErrorKind, HandlerError, PublishError, ResolutionError,
};
use crate::handler::Handler;
use crate::middleware::{DispatchResult, Endpoint, Middleware, Next};
use crate::observer::ErrorEvent;
use crate::policy::{AckPolicy, DispatchSettings, OrderingPolicy, RetryPolicy};
use crate::publisher::BrokerLink;
use crate::resolver::{ProviderRegistry, Resolver};
use crate::subscription::{Filter, Subscription};
use async_trait::async_trait;
use brokerline_transport::{AckHandle, Capabilities, Destination, Envelope, OutboundMessage};
use futures_util::FutureExt;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Header carrying the failure that sent a message to its dead-letter destination.
pub const DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
/// Header carrying the destination a dead-lettered message was consumed from.
pub const ORIGINAL_DESTINATION: &str = "x-original-destination";

/// Lifecycle of one subscription's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Declared, not consuming yet.
    Idle,
    /// Waiting on the transport for the next delivery.
    Receiving,
    /// Every in-flight slot is taken; receiving is paused.
    Saturated,
    /// Shut down through `Broker::stop`.
    Stopped,
    /// Gave up after repeated settlement failures. Other subscriptions keep
    /// running.
    Failed,
}

impl DispatcherState {
    pub fn is_active(self) -> bool {
        matches!(self, DispatcherState::Receiving | DispatcherState::Saturated)
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Processing,
    Faulted,
    Finalizing,
}

enum Outcome {
    Success,
    Requeue(Duration),
    Reject(Option<DispatchError>),
}

struct CompiledRoute {
    filter: Option<Filter>,
    handler: Arc<dyn Handler>,
    resolver: Resolver,
}

impl CompiledRoute {
    fn accepts(&self, envelope: &Envelope) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(envelope))
    }
}

/// A subscription frozen for running: routes compiled, policies resolved
/// against the transport's capabilities.
pub(crate) struct SubscriptionRuntime {
    pub(crate) name: String,
    pub(crate) destination: Destination,
    routes: Vec<CompiledRoute>,
    middleware: Vec<Arc<dyn Middleware>>,
    ack_policy: AckPolicy,
    retry: RetryPolicy,
    ordering: OrderingPolicy,
    settings: DispatchSettings,
    dead_letter: Option<Destination>,
    respond_to: Vec<Destination>,
    codec: Arc<dyn Codec>,
    capabilities: Capabilities,
    link: Arc<BrokerLink>,
    in_flight: Mutex<HashMap<Uuid, AckHandle>>,
    settle_failures: AtomicU32,
    publish_failures: AtomicU32,
    failed: AtomicBool,
    fail_signal: Notify,
}

impl SubscriptionRuntime {
    pub(crate) fn compile(
        subscription: &Subscription,
        broker_middleware: &[Arc<dyn Middleware>],
        broker_providers: &ProviderRegistry,
        defaults: &DispatchSettings,
        capabilities: Capabilities,
        link: Arc<BrokerLink>,
    ) -> Result<Self, BrokerError> {
        if subscription.routes.is_empty() {
            return Err(BrokerError::NoHandler(subscription.name.clone()));
        }

        let providers = broker_providers.merged(&subscription.providers);
        let routes = subscription
            .routes
            .iter()
            .map(|route| {
                let mut requirements = route.handler.requirements();
                requirements.extend(subscription.requirements.iter().cloned());
                let resolver = Resolver::new(requirements, providers.clone());
                match resolver.missing_providers().first().copied() {
                    Some(type_name) => Err(BrokerError::MissingProvider {
                        subscription: subscription.name.clone(),
                        type_name,
                    }),
                    None => Ok(CompiledRoute {
                        filter: route.filter.clone(),
                        handler: Arc::clone(&route.handler),
                        resolver,
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let codec = subscription
            .codec
            .clone()
            .unwrap_or_else(|| Arc::clone(&link.codec));

        Ok(Self {
            name: subscription.name.clone(),
            destination: subscription.destination.clone(),
            routes,
            middleware: broker_middleware
                .iter()
                .chain(subscription.middleware.iter())
                .cloned()
                .collect(),
            ack_policy: subscription.ack_policy,
            retry: subscription
                .retry
                .clone()
                .unwrap_or_else(|| RetryPolicy::default_for(capabilities.model)),
            ordering: subscription.ordering,
            settings: subscription.settings(defaults),
            dead_letter: subscription.dead_letter.clone(),
            respond_to: subscription.respond_to.clone(),
            codec,
            capabilities,
            link,
            in_flight: Mutex::new(HashMap::new()),
            settle_failures: AtomicU32::new(0),
            publish_failures: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            fail_signal: Notify::new(),
        })
    }

    fn report(&self, kind: ErrorKind, error: impl ToString, envelope: Option<&Envelope>) {
        let event = ErrorEvent::new(kind, error).for_subscription(&self.name);
        let event = match envelope {
            Some(envelope) => event.for_envelope(envelope),
            None => event.for_destination(&self.destination),
        };
        self.link.report(event);
    }

    fn fail(&self, reason: &str) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!("subscription {} stopped: {}", self.name, reason);
            self.fail_signal.notify_one();
        }
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn track(&self, envelope: &Envelope) {
        let handle = envelope.ack_handle().clone();
        self.in_flight.lock().insert(handle.delivery_id(), handle);
    }

    /// Run one envelope through the chain, then settle it.
    async fn process(&self, envelope: Envelope) {
        let outcome = self.attempt(&envelope).await;
        self.finalize(&envelope, outcome).await;
        self.in_flight
            .lock()
            .remove(&envelope.ack_handle().delivery_id());
    }

    async fn attempt(&self, envelope: &Envelope) -> Outcome {
        let message_id = envelope.message_id();
        // Every earlier delivery of this message ended in a requeue.
        let mut failures = envelope.delivery_count().saturating_sub(1);
        loop {
            trace!("{}: {} {:?}", self.name, message_id, Stage::Processing);
            let result = AssertUnwindSafe(self.run_once(envelope))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(HandlerError::reject(format!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))
                    .into())
                });

            let err = match result {
                Ok(()) => return Outcome::Success,
                Err(err) => err,
            };

            trace!("{}: {} {:?}", self.name, message_id, Stage::Faulted);
            self.report(err.kind(), &err, Some(envelope));

            if !err.is_recoverable() || envelope.ack_handle().is_consumed() {
                return Outcome::Reject(Some(err));
            }

            failures = failures.saturating_add(1);
            if !self.retry.allows(failures - 1) {
                warn!(
                    "{}: giving up on {} after {} retries",
                    self.name,
                    message_id,
                    failures - 1
                );
                return Outcome::Reject(Some(err));
            }

            let delay = self.retry.backoff.delay(failures);
            if self.capabilities.requeue {
                return Outcome::Requeue(delay);
            }
            debug!(
                "{}: retrying {} in place in {:?} (retry {})",
                self.name, message_id, delay, failures
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_once(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let result = Next::new(&self.middleware, self)
            .run(envelope.clone())
            .await?;
        if let Some(value) = result {
            self.publish_result(envelope, value)
                .await
                .map_err(DispatchError::Reply)?;
        }
        Ok(())
    }

    /// Send a handler result to the message's reply-to and to every
    /// `respond_to` destination.
    async fn publish_result(&self, envelope: &Envelope, value: Value) -> Result<(), PublishError> {
        let mut targets = self.respond_to.clone();
        if let Some(reply_to) = envelope.reply_to() {
            targets.push(Destination::new(reply_to));
        }
        if targets.is_empty() {
            trace!("{}: no destination for result of {}", self.name, envelope.message_id());
            return Ok(());
        }

        let encoded = self.codec.encode(&value)?;
        for destination in targets {
            let mut message = OutboundMessage::new(destination, encoded.body.clone());
            message.content_type = encoded.content_type.clone();
            message.correlation_id = envelope.correlation_id().map(str::to_string);
            let result = self.link.send(message).await;
            self.record_publish(&result);
            result?;
        }
        Ok(())
    }

    /// Count consecutive transport failures on outbound publishes; the
    /// subscription fails once they reach `max_publish_failures`.
    fn record_publish(&self, result: &Result<(), PublishError>) {
        match result {
            Ok(()) => self.publish_failures.store(0, Ordering::Release),
            Err(PublishError::Transport { .. }) => {
                let failures = self.publish_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.settings.max_publish_failures {
                    self.fail(&format!("{failures} consecutive publish failures"));
                }
            }
            Err(_) => {}
        }
    }

    async fn finalize(&self, envelope: &Envelope, outcome: Outcome) {
        trace!("{}: {} {:?}", self.name, envelope.message_id(), Stage::Finalizing);
        let handle = envelope.ack_handle();

        let outcome = match (self.ack_policy, outcome) {
            (AckPolicy::Manual, _) if handle.is_consumed() => return,
            (AckPolicy::Manual, Outcome::Success) => {
                self.report(
                    ErrorKind::AckFault,
                    "handler returned without settling its delivery",
                    Some(envelope),
                );
                if self.capabilities.requeue {
                    Outcome::Requeue(Duration::ZERO)
                } else {
                    Outcome::Reject(None)
                }
            }
            (_, outcome) => outcome,
        };

        if let Outcome::Requeue(delay) = &outcome {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }
        }

        if handle.is_consumed() {
            self.report(
                ErrorKind::AckFault,
                "the delivery was settled outside the dispatcher",
                Some(envelope),
            );
            return;
        }

        // Anything that can suspend happens before the handle is consumed, so
        // a cancelled task leaves the delivery to `reject_in_flight`.
        let requeue = match outcome {
            Outcome::Success => None,
            Outcome::Requeue(_) => Some(true),
            Outcome::Reject(reason) => {
                let parked = self.dead_letter(envelope, reason.as_ref()).await;
                Some(!parked && self.capabilities.requeue)
            }
        };

        let token = match handle.consume() {
            Ok(token) => token,
            Err(err) => {
                self.report(ErrorKind::AckFault, err, Some(envelope));
                return;
            }
        };

        let transport = &self.link.transport;
        let result = match requeue {
            None => transport.ack(token).await,
            Some(requeue) => transport.nack(token, requeue).await,
        };

        match result {
            Ok(()) => self.settle_failures.store(0, Ordering::Release),
            Err(err) => {
                self.report(ErrorKind::Transport, &err, Some(envelope));
                let failures = self.settle_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.settings.max_settle_failures {
                    self.fail(&format!("{failures} consecutive settlement failures"));
                }
            }
        }
    }

    /// Copy a rejected message to the dead-letter destination.
    ///
    /// Returns false only when a configured dead-letter publish failed, in
    /// which case the message must not be dropped.
    async fn dead_letter(&self, envelope: &Envelope, reason: Option<&DispatchError>) -> bool {
        let Some(destination) = &self.dead_letter else {
            return true;
        };

        let mut message = envelope.message().clone();
        message.destination = destination.clone();
        message.headers.insert(
            DEAD_LETTER_REASON.to_string(),
            reason.map_or_else(|| "not settled by handler".to_string(), ToString::to_string),
        );
        message.headers.insert(
            ORIGINAL_DESTINATION.to_string(),
            envelope.destination().to_string(),
        );

        let result = self.link.send(message).await;
        self.record_publish(&result);
        match result {
            Ok(()) => {
                info!(
                    "{}: dead-lettered {} to {}",
                    self.name,
                    envelope.message_id(),
                    destination
                );
                true
            }
            Err(err) => {
                self.report(ErrorKind::Publish, &err, Some(envelope));
                false
            }
        }
    }

    /// Hand a delivery that cannot be processed back to the transport.
    async fn release(&self, envelope: &Envelope) {
        self.in_flight
            .lock()
            .remove(&envelope.ack_handle().delivery_id());
        let Ok(token) = envelope.ack_handle().consume() else {
            return;
        };
        if let Err(err) = self
            .link
            .transport
            .nack(token, self.capabilities.requeue)
            .await
        {
            self.report(ErrorKind::Transport, &err, Some(envelope));
        }
    }

    /// Reject every delivery still holding an unconsumed handle.
    pub(crate) async fn reject_in_flight(&self) {
        let handles: Vec<AckHandle> = self
            .in_flight
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in handles {
            let Ok(token) = handle.consume() else {
                continue;
            };
            warn!(
                "{}: rejecting delivery {} cancelled at shutdown",
                self.name,
                token.delivery_id()
            );
            if let Err(err) = self.link.transport.nack(token, false).await {
                self.report(ErrorKind::Transport, &err, None);
            }
        }
    }
}

#[async_trait]
impl Endpoint for SubscriptionRuntime {
    async fn call(&self, envelope: Envelope) -> DispatchResult {
        let route = self
            .routes
            .iter()
            .find(|route| route.accepts(&envelope))
            .ok_or_else(|| ResolutionError::NoRoute(envelope.message_id().to_string()))?;

        let acker = Acker::new(
            envelope.ack_handle().clone(),
            Arc::clone(&self.link.transport),
        );
        let context = route
            .resolver
            .resolve(envelope, self.codec.as_ref(), acker)
            .await?;
        Ok(route.handler.handle(context).await?)
    }
}

type Lane = mpsc::UnboundedSender<(Envelope, OwnedSemaphorePermit)>;

/// Receive loop of one subscription.
pub(crate) struct Dispatcher {
    runtime: Arc<SubscriptionRuntime>,
    state: watch::Sender<DispatcherState>,
    shutdown: watch::Receiver<bool>,
    grace_period: Duration,
}

impl Dispatcher {
    pub(crate) fn new(
        runtime: Arc<SubscriptionRuntime>,
        shutdown: watch::Receiver<bool>,
        grace_period: Duration,
    ) -> (Self, watch::Receiver<DispatcherState>) {
        let (state, state_rx) = watch::channel(DispatcherState::Idle);
        (
            Self {
                runtime,
                state,
                shutdown,
                grace_period,
            },
            state_rx,
        )
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub(crate) async fn run(mut self) {
        let runtime = Arc::clone(&self.runtime);
        let permits = Arc::new(Semaphore::new(runtime.settings.in_flight_limit()));
        let mut tasks = JoinSet::new();
        let lanes = match runtime.ordering {
            OrderingPolicy::PartitionPinned => spawn_lanes(&runtime, &mut tasks),
            OrderingPolicy::Unordered => Vec::new(),
        };
        let mut receive_failures = 0u32;

        info!(
            "subscription {} consuming {} (in-flight limit {})",
            runtime.name,
            runtime.destination,
            runtime.settings.in_flight_limit()
        );

        loop {
            reap(&mut tasks);
            if runtime.is_failed() {
                break;
            }

            if permits.available_permits() == 0 {
                self.set_state(DispatcherState::Saturated);
            }
            let permit = tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => break,
                _ = runtime.fail_signal.notified() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.set_state(DispatcherState::Receiving);
            let received = tokio::select! {
                biased;
                _ = stopped(&mut self.shutdown) => break,
                _ = runtime.fail_signal.notified() => break,
                received = runtime
                    .link
                    .transport
                    .receive(&runtime.destination, runtime.settings.receive_timeout) => received,
            };

            match received {
                Ok(Some(envelope)) => {
                    receive_failures = 0;
                    runtime.track(&envelope);
                    if lanes.is_empty() {
                        let runtime = Arc::clone(&runtime);
                        tasks.spawn(async move {
                            runtime.process(envelope).await;
                            drop(permit);
                        });
                    } else {
                        dispatch_to_lane(&runtime, &lanes, envelope, permit).await;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    drop(permit);
                    receive_failures = receive_failures.saturating_add(1);
                    runtime.report(ErrorKind::Transport, &err, None);
                    let delay = runtime.settings.reconnect.delay(receive_failures);
                    warn!(
                        "{}: receive failed ({}); reconnecting in {:?}",
                        runtime.name, err, delay
                    );
                    tokio::select! {
                        biased;
                        _ = stopped(&mut self.shutdown) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Err(err) = runtime.link.transport.connect().await {
                        warn!("{}: reconnect failed: {}", runtime.name, err);
                    }
                }
            }
        }

        drop(lanes);
        self.drain(tasks).await;

        let final_state = if runtime.is_failed() {
            DispatcherState::Failed
        } else {
            DispatcherState::Stopped
        };
        self.set_state(final_state);
        info!("subscription {} {:?}", runtime.name, final_state);
    }

    /// Let in-flight work finish within the grace period, then cancel it.
    async fn drain(&self, mut tasks: JoinSet<()>) {
        let runtime = &self.runtime;
        let finished = tokio::time::timeout(self.grace_period, join_all(&mut tasks))
            .await
            .is_ok();
        if !finished {
            warn!(
                "{}: in-flight work did not finish within {:?}; cancelling",
                runtime.name, self.grace_period
            );
            tasks.abort_all();
            join_all(&mut tasks).await;
        }
        runtime.reject_in_flight().await;
    }
}

/// Resolves once shutdown has been requested or the broker is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn spawn_lanes(runtime: &Arc<SubscriptionRuntime>, tasks: &mut JoinSet<()>) -> Vec<Lane> {
    (0..runtime.settings.workers())
        .map(|_| {
            let (lane, mut queue) = mpsc::unbounded_channel::<(Envelope, OwnedSemaphorePermit)>();
            let runtime = Arc::clone(runtime);
            tasks.spawn(async move {
                while let Some((envelope, _permit)) = queue.recv().await {
                    runtime.process(envelope).await;
                }
            });
            lane
        })
        .collect()
}

/// A closed lane means its worker is gone, so the subscription fails and
/// the envelope goes back to the transport.
async fn dispatch_to_lane(
    runtime: &SubscriptionRuntime,
    lanes: &[Lane],
    envelope: Envelope,
    permit: OwnedSemaphorePermit,
) {
    let lane = &lanes[lane_index(&envelope, lanes.len())];
    if let Err(mpsc::error::SendError((envelope, permit))) = lane.send((envelope, permit)) {
        drop(permit);
        runtime.fail("worker lane closed");
        runtime.release(&envelope).await;
    }
}

/// Envelopes with the same partition key always land on the same lane.
fn lane_index(envelope: &Envelope, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    envelope
        .partition_key()
        .unwrap_or_else(|| envelope.message_id())
        .hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(err) = result {
            if err.is_panic() {
                error!("dispatch task panicked: {}", err);
            }
        }
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
