use crate::broker::Broker;
use crate::errors::BrokerError;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::info;
use std::future::Future;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

type Hook = Box<dyn Fn() -> BoxFuture<'static, Result<(), HookError>> + Send + Sync>;

/// A broker plus lifecycle hooks around its start and stop.
pub struct App {
    broker: Broker,
    on_startup: Vec<Hook>,
    after_startup: Vec<Hook>,
    on_shutdown: Vec<Hook>,
    after_shutdown: Vec<Hook>,
}

fn hook<F, Fut>(hook: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    Box::new(move || hook().boxed())
}

async fn run_hooks(stage: &'static str, hooks: &[Hook]) -> Result<(), BrokerError> {
    for hook in hooks {
        hook().await.map_err(|err| BrokerError::Hook {
            stage,
            message: err.to_string(),
        })?;
    }
    Ok(())
}

impl App {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            on_startup: Vec::new(),
            after_startup: Vec::new(),
            on_shutdown: Vec::new(),
            after_shutdown: Vec::new(),
        }
    }

    /// Runs before the broker connects.
    pub fn on_startup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.on_startup.push(hook(f));
        self
    }

    /// Runs once every subscription is consuming.
    pub fn after_startup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.after_startup.push(hook(f));
        self
    }

    /// Runs before the broker stops.
    pub fn on_shutdown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.on_shutdown.push(hook(f));
        self
    }

    /// Runs after the transport is closed.
    pub fn after_shutdown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.after_shutdown.push(hook(f));
        self
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut Broker {
        &mut self.broker
    }

    pub async fn start(&mut self) -> Result<(), BrokerError> {
        run_hooks("on_startup", &self.on_startup).await?;
        self.broker.start().await?;
        if let Err(err) = run_hooks("after_startup", &self.after_startup).await {
            self.broker.stop().await?;
            return Err(err);
        }
        info!("application started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), BrokerError> {
        let hooks = run_hooks("on_shutdown", &self.on_shutdown).await;
        self.broker.stop().await?;
        hooks?;
        run_hooks("after_shutdown", &self.after_shutdown).await?;
        info!("application stopped");
        Ok(())
    }

    /// Start, wait for `shutdown` to resolve, then stop.
    pub async fn run<S>(mut self, shutdown: S) -> Result<(), BrokerError>
    where
        S: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}
