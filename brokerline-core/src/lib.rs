//! Broker-agnostic subscription and dispatch engine.
//!
//! A [`Broker`] owns one [`Transport`], a set of [`Subscription`]s consuming
//! from it and any number of [`Publisher`]s writing to it. Each subscription
//! gets its own dispatcher: receive, run the middleware chain, resolve the
//! handler's inputs, invoke it, publish its result and settle the delivery.

mod ack;
mod app;
mod broker;
mod codec;
mod dispatcher;
mod errors;
mod handler;
mod middleware;
mod observer;
mod policy;
mod publisher;
mod resolver;
mod subscription;

pub use ack::Acker;
pub use app::{App, HookError};
pub use broker::{Broker, BrokerBuilder};
pub use codec::{from_payload, to_payload, Codec, Encoded, JsonCodec, APPLICATION_JSON, TEXT_PLAIN};
pub use dispatcher::{DispatcherState, DEAD_LETTER_REASON, ORIGINAL_DESTINATION};
pub use errors::{
    BrokerError, DecodeError, DispatchError, Disposition, EncodeError, ErrorKind, HandlerError,
    PublishError, ResolutionError, SettleError,
};
pub use handler::{handler_fn, FnHandler, Handler, HandlerResult};
pub use middleware::{
    Deduplicate, DispatchResult, Endpoint, LoggingMiddleware, Middleware, Next, PublishMiddleware,
    PublishNext,
};
pub use observer::{ErrorEvent, ErrorObserver, LogObserver};
pub use policy::{AckPolicy, Backoff, BrokerSettings, DispatchSettings, OrderingPolicy, RetryPolicy};
pub use publisher::{BrokerHandle, PublishOptions, Publisher};
pub use resolver::{MessageContext, Provider, ProviderRegistry, ProviderScope, Requirement, SharedValue};
pub use subscription::{Filter, Subscription, SubscriptionBuilder};

pub use brokerline_transport::{
    Capabilities, DeliveryModel, Destination, Envelope, Headers, OutboundMessage, Transport,
    TransportError,
};
