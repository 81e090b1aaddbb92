use brokerline_transport::DeliveryModel;
use std::time::Duration;

/// Who settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// The dispatcher acks on success and nacks on failure.
    #[default]
    Auto,
    /// The handler settles through its `Acker`.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingPolicy {
    /// Any worker may take any envelope.
    #[default]
    Unordered,
    /// Envelopes sharing a partition key are processed one at a time, in
    /// receive order.
    PartitionPinned,
}

/// Exponential delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// Delay before attempt number `attempt`, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let cap = self.max.max(self.initial);
        let nanos = self.initial.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            return cap;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::limited(0)
    }

    pub fn limited(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            backoff: Backoff::none(),
        }
    }

    pub fn endless() -> Self {
        Self {
            max_retries: None,
            backoff: Backoff::none(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Default retry behaviour for a delivery model.
    ///
    /// Queues redeliver through requeue, partitioned logs retry in place with
    /// backoff, pub/sub deliveries are not retried.
    pub fn default_for(model: DeliveryModel) -> Self {
        match model {
            DeliveryModel::Queue => Self::limited(3),
            DeliveryModel::PartitionedLog => Self::limited(3).with_backoff(Backoff::exponential(
                Duration::from_millis(100),
                Duration::from_secs(2),
            )),
            DeliveryModel::PubSub => Self::none(),
        }
    }

    /// Whether another attempt is allowed after `retries` retries so far.
    pub fn allows(&self, retries: u32) -> bool {
        self.max_retries.map_or(true, |max| retries < max)
    }
}

/// Concurrency and resilience knobs of one dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    /// Received but unfinished envelopes; defaults to `workers`.
    pub max_in_flight: Option<usize>,
    pub receive_timeout: Duration,
    pub reconnect: Backoff,
    /// Consecutive ack/nack failures after which the dispatcher gives up.
    pub max_settle_failures: u32,
    /// Consecutive transport failures publishing results or dead letters
    /// after which the dispatcher gives up.
    pub max_publish_failures: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            max_in_flight: None,
            receive_timeout: Duration::from_secs(1),
            reconnect: Backoff::exponential(Duration::from_millis(100), Duration::from_secs(5)),
            max_settle_failures: 3,
            max_publish_failures: 3,
        }
    }
}

impl DispatchSettings {
    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight.unwrap_or(self.workers).max(self.workers())
    }
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Time in-flight handlers get to finish after `stop()`.
    pub grace_period: Duration,
    /// Prefix of the per-broker destination request/reply listens on.
    pub reply_prefix: String,
    /// Defaults for subscriptions that do not override them.
    pub dispatch: DispatchSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            reply_prefix: "brokerline.replies".to_string(),
            dispatch: DispatchSettings::default(),
        }
    }
}
