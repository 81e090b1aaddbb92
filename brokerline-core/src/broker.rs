use crate::codec::{Codec, JsonCodec};
use crate::dispatcher::{Dispatcher, DispatcherState, SubscriptionRuntime};
use crate::errors::BrokerError;
use crate::handler::Handler;
use crate::middleware::{Middleware, PublishMiddleware};
use crate::observer::{ErrorObserver, LogObserver};
use crate::policy::BrokerSettings;
use crate::publisher::{listen_for_replies, BrokerHandle, BrokerLink, Publisher};
use crate::resolver::ProviderRegistry;
use crate::subscription::Subscription;
use brokerline_transport::{Destination, Transport};
use log::{error, info, warn};
use std::collections::HashMap;
use std::iter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Extra time `stop()` allows past the grace period before aborting a
/// dispatcher outright.
const STOP_MARGIN: Duration = Duration::from_secs(1);

pub struct BrokerBuilder {
    transport: Arc<dyn Transport>,
    settings: BrokerSettings,
    codec: Arc<dyn Codec>,
    observer: Arc<dyn ErrorObserver>,
    middleware: Vec<Arc<dyn Middleware>>,
    publish_middleware: Vec<Arc<dyn PublishMiddleware>>,
    providers: ProviderRegistry,
}

impl BrokerBuilder {
    pub fn settings(mut self, settings: BrokerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.settings.grace_period = grace_period;
        self
    }

    /// Default codec for publishers and for subscriptions without their own.
    pub fn codec<C: Codec>(mut self, codec: C) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn observer<O: ErrorObserver>(mut self, observer: O) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Consume middleware applied outside every subscription's own chain.
    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Publish middleware applied to every outbound message.
    pub fn publish_middleware<M: PublishMiddleware>(mut self, middleware: M) -> Self {
        self.publish_middleware.push(Arc::new(middleware));
        self
    }

    pub fn providers(mut self, configure: impl FnOnce(&mut ProviderRegistry)) -> Self {
        configure(&mut self.providers);
        self
    }

    pub fn build(self) -> Broker {
        let reply_destination = Destination::new(format!(
            "{}.{}",
            self.settings.reply_prefix,
            Uuid::new_v4().simple()
        ));
        let link = Arc::new(BrokerLink::new(
            self.transport,
            self.codec,
            self.observer,
            self.publish_middleware,
            reply_destination,
        ));

        let mut providers = self.providers;
        providers.value(BrokerHandle::new(Arc::clone(&link)));

        Broker {
            link,
            settings: self.settings,
            middleware: self.middleware,
            providers,
            subscriptions: Vec::new(),
            states: HashMap::new(),
            running: None,
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    dispatchers: Vec<(Arc<SubscriptionRuntime>, JoinHandle<()>)>,
    replies: JoinHandle<()>,
}

/// Owns a transport, the subscriptions consuming from it and the publishers
/// writing to it.
///
/// Brokers share nothing with each other; several may run in one process.
pub struct Broker {
    link: Arc<BrokerLink>,
    settings: BrokerSettings,
    middleware: Vec<Arc<dyn Middleware>>,
    providers: ProviderRegistry,
    subscriptions: Vec<Subscription>,
    states: HashMap<String, watch::Receiver<DispatcherState>>,
    running: Option<Running>,
}

impl Broker {
    pub fn builder<T: Transport>(transport: T) -> BrokerBuilder {
        Self::builder_shared(Arc::new(transport))
    }

    /// Builder for a transport that is also used elsewhere.
    pub fn builder_shared(transport: Arc<dyn Transport>) -> BrokerBuilder {
        BrokerBuilder {
            transport,
            settings: BrokerSettings::default(),
            codec: Arc::new(JsonCodec),
            observer: Arc::new(LogObserver),
            middleware: Vec::new(),
            publish_middleware: Vec::new(),
            providers: ProviderRegistry::new(),
        }
    }

    pub fn new<T: Transport>(transport: T) -> Self {
        Self::builder(transport).build()
    }

    /// Declare a subscription. Only allowed while the broker is stopped.
    pub fn subscribe(&mut self, subscription: Subscription) -> Result<(), BrokerError> {
        if self.running.is_some() {
            return Err(BrokerError::AlreadyRunning);
        }
        if subscription.routes.is_empty() {
            return Err(BrokerError::NoHandler(subscription.name.clone()));
        }
        if self
            .subscriptions
            .iter()
            .any(|existing| existing.name == subscription.name)
        {
            return Err(BrokerError::DuplicateSubscription(subscription.name.clone()));
        }

        info!(
            "declared subscription {} on {}",
            subscription.name, subscription.destination
        );
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Shorthand for a subscription with one handler and default policies.
    pub fn subscriber<H: Handler>(
        &mut self,
        destination: impl Into<Destination>,
        handler: H,
    ) -> Result<(), BrokerError> {
        self.subscribe(Subscription::builder(destination).handler(handler).build())
    }

    pub fn publisher(&self, destination: impl Into<Destination>) -> Publisher {
        Publisher::new(Arc::clone(&self.link), destination.into(), Vec::new())
    }

    /// Publisher with its own middleware inside the broker-level chain.
    pub fn publisher_with(
        &self,
        destination: impl Into<Destination>,
        middleware: Vec<Arc<dyn PublishMiddleware>>,
    ) -> Publisher {
        Publisher::new(Arc::clone(&self.link), destination.into(), middleware)
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::new(Arc::clone(&self.link))
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    /// Current dispatcher state of a declared subscription.
    pub fn subscription_state(&self, name: &str) -> Option<DispatcherState> {
        if let Some(state) = self.states.get(name) {
            return Some(*state.borrow());
        }
        self.subscriptions
            .iter()
            .any(|subscription| subscription.name == name)
            .then_some(DispatcherState::Idle)
    }

    /// Follow state changes of a subscription started by the last `start()`.
    pub fn watch_subscription(&self, name: &str) -> Option<watch::Receiver<DispatcherState>> {
        self.states.get(name).cloned()
    }

    /// Connect, bind every destination and start consuming.
    ///
    /// All or nothing: if any destination fails to bind, the transport is
    /// closed again and no dispatcher runs.
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        if self.running.is_some() {
            return Err(BrokerError::AlreadyRunning);
        }

        let transport = Arc::clone(&self.link.transport);
        let capabilities = transport.capabilities();
        let runtimes = self
            .subscriptions
            .iter()
            .map(|subscription| {
                SubscriptionRuntime::compile(
                    subscription,
                    &self.middleware,
                    &self.providers,
                    &self.settings.dispatch,
                    capabilities,
                    Arc::clone(&self.link),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        transport.connect().await.map_err(BrokerError::Connect)?;

        let destinations = runtimes
            .iter()
            .map(|runtime| runtime.destination.clone())
            .chain(iter::once(self.link.replies.destination().clone()));
        for destination in destinations {
            if let Err(source) = transport.bind(&destination).await {
                error!("binding {} failed: {}; start aborted", destination, source);
                if let Err(err) = transport.close().await {
                    warn!("closing transport after failed start: {}", err);
                }
                return Err(BrokerError::Bind {
                    destination: destination.to_string(),
                    source,
                });
            }
        }

        self.link.set_open(true);
        let (shutdown, shutdown_rx) = watch::channel(false);
        self.states.clear();
        let dispatchers = runtimes
            .into_iter()
            .map(|runtime| {
                let (dispatcher, state) = Dispatcher::new(
                    Arc::clone(&runtime),
                    shutdown_rx.clone(),
                    self.settings.grace_period,
                );
                self.states.insert(runtime.name.clone(), state);
                (runtime, tokio::spawn(dispatcher.run()))
            })
            .collect::<Vec<_>>();
        let replies = tokio::spawn(listen_for_replies(
            Arc::clone(&self.link),
            self.settings.dispatch.clone(),
            shutdown_rx,
        ));

        info!("broker started with {} subscription(s)", dispatchers.len());
        self.running = Some(Running {
            shutdown,
            dispatchers,
            replies,
        });
        Ok(())
    }

    /// Stop receiving, give in-flight work the grace period to finish,
    /// reject whatever is left and close the transport.
    pub async fn stop(&mut self) -> Result<(), BrokerError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        info!(
            "stopping broker; in-flight work has {:?}",
            self.settings.grace_period
        );
        running.shutdown.send_replace(true);

        let deadline = Instant::now() + self.settings.grace_period + STOP_MARGIN;
        for (runtime, mut handle) in running.dispatchers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("subscription {} did not stop in time; aborting", runtime.name);
                handle.abort();
                let _ = handle.await;
                runtime.reject_in_flight().await;
            }
        }
        let _ = running.replies.await;

        self.link.set_open(false);
        self.link
            .transport
            .close()
            .await
            .map_err(BrokerError::Close)?;
        info!("broker stopped");
        Ok(())
    }
}
