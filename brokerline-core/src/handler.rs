use crate::errors::HandlerError;
use crate::resolver::{MessageContext, Requirement};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;

/// `Some(value)` is published as the reply; `None` means nothing to send.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// User code invoked for each message of a subscription.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Inputs resolved into the [`MessageContext`] before `handle` runs.
    fn requirements(&self) -> Vec<Requirement> {
        Vec::new()
    }

    async fn handle(&self, context: MessageContext) -> HandlerResult;
}

/// Handler built from an async closure taking a typed payload.
pub struct FnHandler<T, F> {
    handler: F,
    _payload: PhantomData<fn(T)>,
}

/// Wrap `|payload: T, context| async { .. }` as a [`Handler`].
///
/// The payload is decoded into `T`; a returned value that serializes to
/// anything but `null` becomes the reply.
pub fn handler_fn<T, R, F, Fut>(handler: F) -> FnHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    FnHandler {
        handler,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<T, R, F, Fut> Handler for FnHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    fn requirements(&self) -> Vec<Requirement> {
        vec![Requirement::payload::<T>()]
    }

    async fn handle(&self, mut context: MessageContext) -> HandlerResult {
        let payload = context.take_payload::<T>().ok_or_else(|| {
            HandlerError::reject(format!("payload {} was not resolved", type_name::<T>()))
        })?;
        let output = (self.handler)(payload, context).await?;
        let value = serde_json::to_value(&output).map_err(|err| {
            HandlerError::reject("handler result could not be serialized").with_source(err)
        })?;
        Ok((!value.is_null()).then_some(value))
    }
}
