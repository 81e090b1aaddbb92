use crate::{
    http::types::{
        BindRequest, PublishRequest, ReceiveRequest, ReceiveResponse, SettleRequest,
        WireDelivery,
    },
    AckHandle, Capabilities, DeliveryToken, Destination, Envelope, OutboundMessage, Transport,
    TransportError,
};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Transport talking to a `brokerline-transport` HTTP server.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    connected: Arc<AtomicBool>,
}

impl HttpTransport {
    pub fn new(base_url: Url, client: Client) -> Self {
        Self {
            client,
            base_url,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::Internal(err.to_string()))
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn post<T>(&self, path: &str, body: &T) -> Result<Response, TransportError>
    where
        T: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| TransportError::Connection(err.to_string()))
    }

    async fn fetch(&self, request: ReceiveRequest) -> Result<Option<WireDelivery>, TransportError> {
        let response = self.post("receive", &request).await?;
        match response.status() {
            StatusCode::OK => {
                let payload = response
                    .json::<ReceiveResponse>()
                    .await
                    .map_err(|err| TransportError::Internal(err.to_string()))?;
                Ok(payload.delivery)
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::SERVICE_UNAVAILABLE => Err(TransportError::NotConnected),
            status => Err(TransportError::Internal(format!(
                "unexpected receive status: {status}"
            ))),
        }
    }

    async fn settle(&self, token: DeliveryToken, requeue: bool, path: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let request = SettleRequest {
            destination: token.destination().to_string(),
            delivery_id: token.delivery_id(),
            requeue,
        };
        let response = self.post(path, &request).await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(TransportError::UnknownDelivery(token.delivery_id())),
            StatusCode::NOT_IMPLEMENTED => Err(TransportError::Unsupported("requeue")),
            status => Err(TransportError::Internal(format!(
                "unexpected {path} status: {status}"
            ))),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities::queue()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn bind(&self, destination: &Destination) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let response = self
            .post(
                "bind",
                &BindRequest {
                    destination: destination.clone(),
                },
            )
            .await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(TransportError::Rejected(destination.name.clone())),
            status => Err(TransportError::Internal(format!(
                "unexpected bind status: {status}"
            ))),
        }
    }

    async fn receive(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError> {
        self.ensure_connected()?;
        let request = ReceiveRequest {
            destination: destination.clone(),
            timeout_ms: Some(timeout.as_millis() as u64),
        };
        let transport = self.clone();
        let mut pending = PendingReceive {
            task: Some(tokio::spawn(async move { transport.fetch(request).await })),
            transport: self.clone(),
            destination: destination.name.clone(),
        };

        let delivery = pending.wait().await?;
        Ok(delivery.map(|delivery| {
            debug!("received delivery {} over http", delivery.delivery_id);
            Envelope::new(
                delivery.message,
                AckHandle::new(destination.name.clone(), delivery.delivery_id),
                delivery.delivery_count,
            )
        }))
    }

    async fn ack(&self, token: DeliveryToken) -> Result<(), TransportError> {
        self.settle(token, false, "ack").await
    }

    async fn nack(&self, token: DeliveryToken, requeue: bool) -> Result<(), TransportError> {
        self.settle(token, requeue, "nack").await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let response = self.post("publish", &PublishRequest { message }).await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(TransportError::Internal(format!(
                "unexpected publish status: {status}"
            ))),
        }
    }
}

/// An in-flight receive request.
///
/// The request runs on its own task so that dropping `receive` cannot cut a
/// response off after the server handed out a delivery. A delivery arriving
/// after the caller gave up is nacked back onto its queue.
struct PendingReceive {
    task: Option<JoinHandle<Result<Option<WireDelivery>, TransportError>>>,
    transport: HttpTransport,
    destination: String,
}

impl PendingReceive {
    async fn wait(&mut self) -> Result<Option<WireDelivery>, TransportError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(None);
        };
        let result = task.await;
        self.task = None;
        result.map_err(|err| TransportError::Internal(err.to_string()))?
    }
}

impl Drop for PendingReceive {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            task.abort();
            return;
        };

        let transport = self.transport.clone();
        let destination = std::mem::take(&mut self.destination);
        runtime.spawn(async move {
            let Ok(Ok(Some(delivery))) = task.await else {
                return;
            };
            debug!(
                "returning delivery {} received after the caller went away",
                delivery.delivery_id
            );
            let request = SettleRequest {
                destination,
                delivery_id: delivery.delivery_id,
                requeue: true,
            };
            match transport.post("nack", &request).await {
                Ok(response) if response.status() == StatusCode::OK => {}
                Ok(response) => warn!(
                    "returning delivery {} failed with status {}",
                    delivery.delivery_id,
                    response.status()
                ),
                Err(err) => warn!("returning delivery {} failed: {}", delivery.delivery_id, err),
            }
        });
    }
}
