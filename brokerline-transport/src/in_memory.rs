use crate::{
    Capabilities, DeliveryToken, Destination, Envelope, OutboundMessage, Transport,
    TransportError, AckHandle,
};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    Acked,
    Requeued,
    Rejected,
}

/// Record of one ack or nack, kept for inspection in tests.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub destination: String,
    pub message_id: String,
    pub delivery_id: Uuid,
    pub kind: SettlementKind,
}

struct Stored {
    message: OutboundMessage,
    delivery_count: u32,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Stored>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct TransportState {
    connected: bool,
    queues: HashMap<String, Queue>,
    inflight: HashMap<Uuid, Stored>,
    settlements: Vec<Settlement>,
    rejected: HashSet<String>,
    receive_failures: u32,
    settle_failures: u32,
}

impl TransportState {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn take_settle_failure(&mut self) -> Result<(), TransportError> {
        if self.settle_failures > 0 {
            self.settle_failures -= 1;
            return Err(TransportError::Connection("injected settlement failure".into()));
        }
        Ok(())
    }

    fn settle(&mut self, token: &DeliveryToken, kind: SettlementKind) -> Result<Stored, TransportError> {
        let stored = self
            .inflight
            .remove(&token.delivery_id())
            .ok_or(TransportError::UnknownDelivery(token.delivery_id()))?;
        self.settlements.push(Settlement {
            destination: token.destination().to_string(),
            message_id: stored.message.message_id.clone(),
            delivery_id: token.delivery_id(),
            kind,
        });
        Ok(stored)
    }
}

/// Process-local queue transport.
///
/// Each destination name is a FIFO queue with competing consumers. Requeued
/// deliveries go back to the front of their queue. Clones share state.
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<Mutex<TransportState>>,
    capabilities: Capabilities,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::queue())
    }

    /// Emulate another delivery model, e.g. a pub/sub backend without requeue.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState::default())),
            capabilities,
        }
    }

    /// Make `bind` fail for the named destination.
    pub fn reject_destination(&self, name: &str) {
        self.state.lock().rejected.insert(name.to_string());
    }

    /// Fail the next `count` receive calls with a connection error.
    pub fn fail_receives(&self, count: u32) {
        self.state.lock().receive_failures = count;
    }

    /// Fail the next `count` ack/nack calls with a connection error.
    pub fn fail_settlements(&self, count: u32) {
        self.state.lock().settle_failures = count;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state.lock().settlements.clone()
    }

    pub fn settlements_for(&self, destination: &str) -> Vec<Settlement> {
        self.state
            .lock()
            .settlements
            .iter()
            .filter(|settlement| settlement.destination == destination)
            .cloned()
            .collect()
    }

    /// Messages waiting on a destination, in delivery order.
    pub fn pending(&self, destination: &str) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .queues
            .get(destination)
            .map(|queue| queue.ready.iter().map(|stored| stored.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.state.lock().inflight.len()
    }

    fn queue_notify(&self, name: &str) -> Arc<Notify> {
        let mut guard = self.state.lock();
        Arc::clone(&guard.queues.entry(name.to_string()).or_default().notify)
    }

    fn try_pop(&self, destination: &Destination) -> Result<Option<Envelope>, TransportError> {
        let mut guard = self.state.lock();
        guard.ensure_connected()?;
        if guard.receive_failures > 0 {
            guard.receive_failures -= 1;
            return Err(TransportError::Connection("injected receive failure".into()));
        }

        let Some(mut stored) = guard
            .queues
            .get_mut(&destination.name)
            .and_then(|queue| queue.ready.pop_front())
        else {
            return Ok(None);
        };

        stored.delivery_count += 1;
        let delivery_id = Uuid::new_v4();
        let envelope = Envelope::new(
            stored.message.clone(),
            AckHandle::new(destination.name.clone(), delivery_id),
            stored.delivery_count,
        );
        guard.inflight.insert(delivery_id, stored);
        Ok(Some(envelope))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.state.lock().connected = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut guard = self.state.lock();
        guard.connected = false;

        // Unsettled deliveries return to their queues, as a broker does when a
        // consumer connection drops.
        let leftovers: Vec<Stored> = guard.inflight.drain().map(|(_, stored)| stored).collect();
        for stored in leftovers {
            let name = stored.message.destination.name.clone();
            guard.queues.entry(name).or_default().ready.push_front(stored);
        }
        Ok(())
    }

    async fn bind(&self, destination: &Destination) -> Result<(), TransportError> {
        let mut guard = self.state.lock();
        guard.ensure_connected()?;
        if guard.rejected.contains(&destination.name) {
            return Err(TransportError::Rejected(destination.name.clone()));
        }
        guard.queues.entry(destination.name.clone()).or_default();
        Ok(())
    }

    async fn receive(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.queue_notify(&destination.name);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.try_pop(destination)? {
                return Ok(Some(envelope));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, token: DeliveryToken) -> Result<(), TransportError> {
        let mut guard = self.state.lock();
        guard.ensure_connected()?;
        guard.take_settle_failure()?;
        guard.settle(&token, SettlementKind::Acked)?;
        Ok(())
    }

    async fn nack(&self, token: DeliveryToken, requeue: bool) -> Result<(), TransportError> {
        if requeue && !self.capabilities.requeue {
            return Err(TransportError::Unsupported("requeue"));
        }

        let notify = {
            let mut guard = self.state.lock();
            guard.ensure_connected()?;
            guard.take_settle_failure()?;
            if !requeue {
                guard.settle(&token, SettlementKind::Rejected)?;
                return Ok(());
            }

            let stored = guard.settle(&token, SettlementKind::Requeued)?;
            let queue = guard
                .queues
                .entry(token.destination().to_string())
                .or_default();
            queue.ready.push_front(stored);
            Arc::clone(&queue.notify)
        };
        notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let notify = {
            let mut guard = self.state.lock();
            let name = message.destination.name.clone();
            debug!("in-memory publish {} to {}", message.message_id, name);
            let queue = guard.queues.entry(name).or_default();
            queue.ready.push_back(Stored {
                message,
                delivery_count: 0,
            });
            Arc::clone(&queue.notify)
        };
        notify.notify_waiters();
        Ok(())
    }
}
