use crate::codec::Codec;
use crate::handler::Handler;
use crate::middleware::Middleware;
use crate::policy::{AckPolicy, DispatchSettings, OrderingPolicy, RetryPolicy};
use crate::resolver::{ProviderRegistry, Requirement};
use brokerline_transport::{Destination, Envelope};
use std::sync::Arc;

pub type Filter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

pub(crate) struct Route {
    pub(crate) filter: Option<Filter>,
    pub(crate) handler: Arc<dyn Handler>,
}

/// A declared consumer of one destination.
///
/// Built once through [`Subscription::builder`] and handed to
/// `Broker::subscribe`; the declaration does not change afterwards.
pub struct Subscription {
    pub(crate) name: String,
    pub(crate) destination: Destination,
    pub(crate) routes: Vec<Route>,
    pub(crate) requirements: Vec<Requirement>,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) ack_policy: AckPolicy,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) ordering: OrderingPolicy,
    pub(crate) dispatch: Option<DispatchSettings>,
    pub(crate) workers: Option<usize>,
    pub(crate) max_in_flight: Option<usize>,
    pub(crate) dead_letter: Option<Destination>,
    pub(crate) respond_to: Vec<Destination>,
    pub(crate) codec: Option<Arc<dyn Codec>>,
    pub(crate) providers: ProviderRegistry,
}

impl Subscription {
    pub fn builder(destination: impl Into<Destination>) -> SubscriptionBuilder {
        let destination = destination.into();
        SubscriptionBuilder {
            inner: Subscription {
                name: destination.name.clone(),
                destination,
                routes: Vec::new(),
                requirements: Vec::new(),
                middleware: Vec::new(),
                ack_policy: AckPolicy::default(),
                retry: None,
                ordering: OrderingPolicy::default(),
                dispatch: None,
                workers: None,
                max_in_flight: None,
                dead_letter: None,
                respond_to: Vec::new(),
                codec: None,
                providers: ProviderRegistry::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    /// Dispatch settings with per-subscription overrides applied.
    pub(crate) fn settings(&self, defaults: &DispatchSettings) -> DispatchSettings {
        let mut settings = self.dispatch.clone().unwrap_or_else(|| defaults.clone());
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(limit) = self.max_in_flight {
            settings.max_in_flight = Some(limit);
        }
        settings
    }
}

pub struct SubscriptionBuilder {
    inner: Subscription,
}

impl SubscriptionBuilder {
    /// Defaults to the destination name; must be unique per broker.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.inner.name = name.into();
        self
    }

    /// Handler for every message no filtered route claimed.
    pub fn handler<H: Handler>(mut self, handler: H) -> Self {
        self.inner.routes.push(Route {
            filter: None,
            handler: Arc::new(handler),
        });
        self
    }

    /// Handler for messages matching `filter`. Routes are tried in
    /// declaration order and the first match wins.
    pub fn route<F, H>(mut self, filter: F, handler: H) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
        H: Handler,
    {
        self.inner.routes.push(Route {
            filter: Some(Arc::new(filter)),
            handler: Arc::new(handler),
        });
        self
    }

    /// Extra input resolved for every route, e.g. a dependency the handler
    /// reads from its context.
    pub fn requires(mut self, requirement: Requirement) -> Self {
        self.inner.requirements.push(requirement);
        self
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.inner.middleware.push(Arc::new(middleware));
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.inner.ack_policy = policy;
        self
    }

    /// Overrides the transport's default retry behaviour.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.inner.retry = Some(policy);
        self
    }

    pub fn ordering(mut self, ordering: OrderingPolicy) -> Self {
        self.inner.ordering = ordering;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.inner.workers = Some(workers);
        self
    }

    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.inner.max_in_flight = Some(limit);
        self
    }

    pub fn dispatch(mut self, settings: DispatchSettings) -> Self {
        self.inner.dispatch = Some(settings);
        self
    }

    /// Where terminally failed messages are published before rejection.
    pub fn dead_letter(mut self, destination: impl Into<Destination>) -> Self {
        self.inner.dead_letter = Some(destination.into());
        self
    }

    /// Also publish handler results to `destination`.
    pub fn respond_to(mut self, destination: impl Into<Destination>) -> Self {
        self.inner.respond_to.push(destination.into());
        self
    }

    pub fn codec<C: Codec>(mut self, codec: C) -> Self {
        self.inner.codec = Some(Arc::new(codec));
        self
    }

    /// Subscription-local providers; they shadow broker-level ones.
    pub fn providers(mut self, configure: impl FnOnce(&mut ProviderRegistry)) -> Self {
        configure(&mut self.inner.providers);
        self
    }

    pub fn build(self) -> Subscription {
        self.inner
    }
}
