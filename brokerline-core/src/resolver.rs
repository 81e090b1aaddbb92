use crate::ack::Acker;
use crate::codec::{from_payload, Codec};
use crate::errors::{DecodeError, DispatchError, ResolutionError};
use async_trait::async_trait;
use brokerline_transport::Envelope;
use serde::de::DeserializeOwned;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub type SharedValue = Arc<dyn Any + Send + Sync>;

type Extracted = Box<dyn Any + Send>;
type PayloadExtractor = Arc<dyn Fn(&serde_json::Value) -> Result<Extracted, DecodeError> + Send + Sync>;

/// One input a handler declares it needs.
#[derive(Clone)]
pub struct Requirement {
    kind: RequirementKind,
}

#[derive(Clone)]
enum RequirementKind {
    Payload {
        type_name: &'static str,
        extract: PayloadExtractor,
    },
    Header {
        name: String,
        required: bool,
    },
    CorrelationId,
    Dependency {
        type_id: TypeId,
        type_name: &'static str,
    },
}

impl Requirement {
    /// The decoded body, deserialized into `T`.
    pub fn payload<T>() -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        Self {
            kind: RequirementKind::Payload {
                type_name: type_name::<T>(),
                extract: Arc::new(|value: &serde_json::Value| {
                    Ok(Box::new(from_payload::<T>(value)?) as Extracted)
                }),
            },
        }
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self {
            kind: RequirementKind::Header {
                name: name.into(),
                required: true,
            },
        }
    }

    pub fn optional_header(name: impl Into<String>) -> Self {
        Self {
            kind: RequirementKind::Header {
                name: name.into(),
                required: false,
            },
        }
    }

    pub fn correlation_id() -> Self {
        Self {
            kind: RequirementKind::CorrelationId,
        }
    }

    /// A value produced by a registered provider.
    pub fn dependency<T>() -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            kind: RequirementKind::Dependency {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
            },
        }
    }

    pub(crate) fn dependency_type(&self) -> Option<(TypeId, &'static str)> {
        match &self.kind {
            RequirementKind::Dependency { type_id, type_name } => Some((*type_id, *type_name)),
            _ => None,
        }
    }
}

impl fmt::Debug for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RequirementKind::Payload { type_name, .. } => write!(f, "Payload<{type_name}>"),
            RequirementKind::Header { name, required } => {
                write!(f, "Header({name}, required: {required})")
            }
            RequirementKind::CorrelationId => write!(f, "CorrelationId"),
            RequirementKind::Dependency { type_name, .. } => write!(f, "Dependency<{type_name}>"),
        }
    }
}

/// Produces a dependency value for a message.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    async fn provide(&self, envelope: &Envelope) -> Result<SharedValue, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderScope {
    /// Called for every message.
    PerMessage,
    /// Called once per subscription; the result is shared afterwards.
    Subscription,
}

struct ValueProvider(SharedValue);

#[async_trait]
impl Provider for ValueProvider {
    async fn provide(&self, _envelope: &Envelope) -> Result<SharedValue, String> {
        Ok(Arc::clone(&self.0))
    }
}

struct FnProvider<T, F> {
    build: F,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F> Provider for FnProvider<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&Envelope) -> Result<T, String> + Send + Sync + 'static,
{
    async fn provide(&self, envelope: &Envelope) -> Result<SharedValue, String> {
        Ok(Arc::new((self.build)(envelope)?))
    }
}

#[derive(Clone)]
struct Registered {
    provider: Arc<dyn Provider>,
    scope: ProviderScope,
}

/// Providers keyed by the type they produce.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: HashMap<TypeId, Registered>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A constant shared by every message.
    pub fn value<T>(&mut self, value: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.insert::<T>(
            Arc::new(ValueProvider(Arc::new(value))),
            ProviderScope::Subscription,
        )
    }

    /// Built fresh from every envelope.
    pub fn per_message<T, F>(&mut self, build: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Envelope) -> Result<T, String> + Send + Sync + 'static,
    {
        self.insert::<T>(
            Arc::new(FnProvider {
                build,
                _marker: PhantomData,
            }),
            ProviderScope::PerMessage,
        )
    }

    /// Built from the first envelope that needs it, then reused.
    pub fn cached<T, F>(&mut self, build: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Envelope) -> Result<T, String> + Send + Sync + 'static,
    {
        self.insert::<T>(
            Arc::new(FnProvider {
                build,
                _marker: PhantomData,
            }),
            ProviderScope::Subscription,
        )
    }

    /// Register a custom provider producing values of type `T`.
    pub fn register<T, P>(&mut self, provider: P, scope: ProviderScope) -> &mut Self
    where
        T: Send + Sync + 'static,
        P: Provider,
    {
        self.insert::<T>(Arc::new(provider), scope)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub(crate) fn contains_type(&self, type_id: TypeId) -> bool {
        self.entries.contains_key(&type_id)
    }

    /// `self` overlaid with `overrides`; entries in `overrides` win.
    pub(crate) fn merged(&self, overrides: &ProviderRegistry) -> ProviderRegistry {
        let mut entries = self.entries.clone();
        entries.extend(
            overrides
                .entries
                .iter()
                .map(|(type_id, registered)| (*type_id, registered.clone())),
        );
        ProviderRegistry { entries }
    }

    fn insert<T: 'static>(&mut self, provider: Arc<dyn Provider>, scope: ProviderScope) -> &mut Self {
        self.entries
            .insert(TypeId::of::<T>(), Registered { provider, scope });
        self
    }
}

/// Everything a handler asked for, resolved for one envelope.
pub struct MessageContext {
    envelope: Envelope,
    payload: Option<Extracted>,
    headers: HashMap<String, String>,
    dependencies: HashMap<TypeId, SharedValue>,
    acker: Acker,
}

impl MessageContext {
    fn new(envelope: Envelope, acker: Acker) -> Self {
        Self {
            envelope,
            payload: None,
            headers: HashMap::new(),
            dependencies: HashMap::new(),
            acker,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Take the typed payload; `None` if it was not required as `T`.
    pub fn take_payload<T: 'static>(&mut self) -> Option<T> {
        let payload = self.payload.take()?;
        match payload.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(payload) => {
                self.payload = Some(payload);
                None
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
            .or_else(|| self.envelope.header(name))
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.correlation_id()
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let value = self.dependencies.get(&TypeId::of::<T>())?;
        Arc::clone(value).downcast::<T>().ok()
    }

    pub fn acker(&self) -> &Acker {
        &self.acker
    }
}

/// Resolves one handler's requirements.
pub(crate) struct Resolver {
    requirements: Vec<Requirement>,
    providers: ProviderRegistry,
    shared: HashMap<TypeId, OnceCell<SharedValue>>,
}

impl Resolver {
    pub(crate) fn new(requirements: Vec<Requirement>, providers: ProviderRegistry) -> Self {
        let shared = requirements
            .iter()
            .filter_map(Requirement::dependency_type)
            .filter(|(type_id, _)| {
                providers
                    .entries
                    .get(type_id)
                    .is_some_and(|registered| registered.scope == ProviderScope::Subscription)
            })
            .map(|(type_id, _)| (type_id, OnceCell::new()))
            .collect();

        Self {
            requirements,
            providers,
            shared,
        }
    }

    /// Type names of declared dependencies with no provider.
    pub(crate) fn missing_providers(&self) -> Vec<&'static str> {
        self.requirements
            .iter()
            .filter_map(Requirement::dependency_type)
            .filter(|(type_id, _)| !self.providers.contains_type(*type_id))
            .map(|(_, type_name)| type_name)
            .collect()
    }

    pub(crate) async fn resolve(
        &self,
        envelope: Envelope,
        codec: &dyn Codec,
        acker: Acker,
    ) -> Result<MessageContext, DispatchError> {
        let mut context = MessageContext::new(envelope, acker);

        for requirement in &self.requirements {
            match &requirement.kind {
                RequirementKind::Payload { extract, .. } => {
                    let value = context
                        .envelope
                        .decoded_with(|body, content_type| codec.decode(body, content_type))?;
                    context.payload = Some(extract(value)?);
                }
                RequirementKind::Header { name, required } => {
                    match context.envelope.header(name) {
                        Some(value) => {
                            context.headers.insert(name.clone(), value.to_string());
                        }
                        None if *required => {
                            return Err(ResolutionError::MissingHeader(name.clone()).into())
                        }
                        None => {}
                    }
                }
                RequirementKind::CorrelationId => {
                    if context.envelope.correlation_id().is_none() {
                        return Err(ResolutionError::MissingCorrelationId.into());
                    }
                }
                RequirementKind::Dependency { type_id, type_name } => {
                    let value = self
                        .dependency(*type_id, *type_name, &context.envelope)
                        .await?;
                    context.dependencies.insert(*type_id, value);
                }
            }
        }

        Ok(context)
    }

    async fn dependency(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        envelope: &Envelope,
    ) -> Result<SharedValue, ResolutionError> {
        let registered = self
            .providers
            .entries
            .get(&type_id)
            .ok_or(ResolutionError::MissingProvider(type_name))?;

        let build = move || async move {
            registered
                .provider
                .provide(envelope)
                .await
                .map_err(|message| ResolutionError::Provider { type_name, message })
        };

        match self.shared.get(&type_id) {
            Some(cell) => cell.get_or_try_init(build).await.map(Arc::clone),
            None => build().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use brokerline_transport::in_memory::InMemoryTransport;
    use brokerline_transport::{AckHandle, OutboundMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(message: OutboundMessage) -> (Envelope, Acker) {
        let handle = AckHandle::new("orders", uuid::Uuid::new_v4());
        let acker = Acker::new(handle.clone(), Arc::new(InMemoryTransport::new()));
        (Envelope::new(message, handle, 1), acker)
    }

    fn json(body: &str) -> OutboundMessage {
        OutboundMessage::new("orders", body.as_bytes().to_vec())
            .with_content_type("application/json")
    }

    #[tokio::test]
    async fn payload_header_and_dependency_are_resolved() {
        let mut providers = ProviderRegistry::new();
        providers.value(String::from("db"));
        let resolver = Resolver::new(
            vec![
                Requirement::payload::<u32>(),
                Requirement::header("tenant"),
                Requirement::dependency::<String>(),
            ],
            providers,
        );

        let (envelope, acker) = envelope(json("5").with_header("tenant", "acme"));
        let mut context = resolver.resolve(envelope, &JsonCodec, acker).await.unwrap();

        assert_eq!(context.take_payload::<u32>(), Some(5));
        assert_eq!(context.header("tenant"), Some("acme"));
        assert_eq!(context.dependency::<String>().as_deref().map(String::as_str), Some("db"));
    }

    #[tokio::test]
    async fn wrong_payload_type_is_kept() {
        let resolver = Resolver::new(vec![Requirement::payload::<u32>()], ProviderRegistry::new());
        let (envelope, acker) = envelope(json("5"));
        let mut context = resolver.resolve(envelope, &JsonCodec, acker).await.unwrap();

        assert_eq!(context.take_payload::<String>(), None);
        assert_eq!(context.take_payload::<u32>(), Some(5));
    }

    #[tokio::test]
    async fn malformed_body_fails_with_decode_error() {
        let resolver = Resolver::new(vec![Requirement::payload::<u32>()], ProviderRegistry::new());
        let (envelope, acker) = envelope(json("{oops"));
        let result = resolver.resolve(envelope, &JsonCodec, acker).await;
        assert!(matches!(result, Err(DispatchError::Decode(_))));
    }

    #[tokio::test]
    async fn missing_header_and_correlation_id_fail_resolution() {
        let resolver = Resolver::new(vec![Requirement::header("tenant")], ProviderRegistry::new());
        let (envelope_a, acker_a) = envelope(json("1"));
        assert!(matches!(
            resolver.resolve(envelope_a, &JsonCodec, acker_a).await,
            Err(DispatchError::Resolution(ResolutionError::MissingHeader(name))) if name == "tenant"
        ));

        let resolver = Resolver::new(vec![Requirement::correlation_id()], ProviderRegistry::new());
        let (envelope_b, acker_b) = envelope(json("1"));
        assert!(matches!(
            resolver.resolve(envelope_b, &JsonCodec, acker_b).await,
            Err(DispatchError::Resolution(ResolutionError::MissingCorrelationId))
        ));
    }

    #[tokio::test]
    async fn optional_header_may_be_absent() {
        let resolver = Resolver::new(
            vec![Requirement::optional_header("tenant")],
            ProviderRegistry::new(),
        );
        let (envelope, acker) = envelope(json("1"));
        let context = resolver.resolve(envelope, &JsonCodec, acker).await.unwrap();
        assert_eq!(context.header("tenant"), None);
    }

    #[tokio::test]
    async fn cached_provider_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut providers = ProviderRegistry::new();
        {
            let calls = Arc::clone(&calls);
            providers.cached(move |_envelope| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42u64)
            });
        }
        let resolver = Resolver::new(vec![Requirement::dependency::<u64>()], providers);

        for _ in 0..3 {
            let (envelope, acker) = envelope(json("1"));
            let context = resolver.resolve(envelope, &JsonCodec, acker).await.unwrap();
            assert_eq!(context.dependency::<u64>().map(|value| *value), Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_message_provider_sees_each_envelope() {
        let mut providers = ProviderRegistry::new();
        providers.per_message(|envelope: &Envelope| Ok(envelope.message_id().to_string()));
        let resolver = Resolver::new(vec![Requirement::dependency::<String>()], providers);

        let (envelope, acker) = envelope(json("1"));
        let message_id = envelope.message_id().to_string();
        let context = resolver.resolve(envelope, &JsonCodec, acker).await.unwrap();
        assert_eq!(context.dependency::<String>().as_deref(), Some(&message_id));
    }

    #[test]
    fn missing_providers_are_listed() {
        let resolver = Resolver::new(
            vec![Requirement::dependency::<u8>(), Requirement::payload::<u8>()],
            ProviderRegistry::new(),
        );
        assert_eq!(resolver.missing_providers(), vec!["u8"]);
    }
}
