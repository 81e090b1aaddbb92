use std::path::PathBuf;
use std::time::Duration;

use brokerline_core::{Backoff, BrokerSettings, DispatchSettings, OrderingPolicy, RetryPolicy};
use brokerline_utilities::errors::{RuntimeError, SendableError};
use brokerline_utilities::logger::parse_level;
use clap::{Parser, ValueEnum};
use log::LevelFilter;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportBackend {
    InMemory,
    Http,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Unordered,
    PartitionPinned,
}

impl From<Ordering> for OrderingPolicy {
    fn from(value: Ordering) -> Self {
        match value {
            Ordering::Unordered => OrderingPolicy::Unordered,
            Ordering::PartitionPinned => OrderingPolicy::PartitionPinned,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[arg(long, env = "BROKERLINE_TRANSPORT", value_enum, default_value_t = TransportBackend::InMemory)]
    pub transport: TransportBackend,

    #[arg(long, env = "BROKERLINE_TRANSPORT_URL", default_value = "http://127.0.0.1:7070/")]
    pub transport_url: String,

    #[arg(long, env = "BROKERLINE_WORKERS", default_value_t = 1)]
    pub workers: usize,

    #[arg(long, env = "BROKERLINE_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,

    #[arg(long, env = "BROKERLINE_ORDERING", value_enum, default_value_t = Ordering::Unordered)]
    pub ordering: Ordering,

    /// Leave unset to use the transport's delivery-model default.
    #[arg(long, env = "BROKERLINE_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, env = "BROKERLINE_BACKOFF_INITIAL_MS", default_value_t = 0)]
    pub backoff_initial_ms: u64,

    #[arg(long, env = "BROKERLINE_BACKOFF_MAX_MS", default_value_t = 5000)]
    pub backoff_max_ms: u64,

    #[arg(long, env = "BROKERLINE_RECEIVE_TIMEOUT_MS", default_value_t = 1000)]
    pub receive_timeout_ms: u64,

    #[arg(long, env = "BROKERLINE_GRACE_PERIOD_SECONDS", default_value_t = 5)]
    pub grace_period_seconds: u64,

    #[arg(long, env = "BROKERLINE_DEAD_LETTER")]
    pub dead_letter: Option<String>,

    #[arg(long, env = "BROKERLINE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "BROKERLINE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            workers: self.workers,
            max_in_flight: self.max_in_flight,
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            ..DispatchSettings::default()
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            grace_period: Duration::from_secs(self.grace_period_seconds),
            dispatch: self.dispatch_settings(),
            ..BrokerSettings::default()
        }
    }

    /// `None` when no retry count was configured.
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        let max_retries = self.max_retries?;
        let backoff = if self.backoff_initial_ms == 0 {
            Backoff::none()
        } else {
            Backoff::exponential(
                Duration::from_millis(self.backoff_initial_ms),
                Duration::from_millis(self.backoff_max_ms),
            )
        };
        Some(RetryPolicy::limited(max_retries).with_backoff(backoff))
    }

    pub fn ordering_policy(&self) -> OrderingPolicy {
        self.ordering.into()
    }

    pub fn log_level(&self) -> Result<LevelFilter, RuntimeError> {
        parse_level(&self.log_level)
    }

    fn validate(self) -> Result<Self, SendableError> {
        if self.workers == 0 {
            return Err(RuntimeError::boxed(
                "brokerline.config.workers",
                "--workers must be at least 1",
            ));
        }
        if self.max_in_flight == Some(0) {
            return Err(RuntimeError::boxed(
                "brokerline.config.max_in_flight",
                "--max-in-flight must be at least 1",
            ));
        }
        self.log_level()?;
        Ok(self)
    }
}

pub fn parse_config() -> Result<Config, SendableError> {
    Config::parse().validate()
}

/// Parse an explicit argument list; the first item is the program name.
pub fn from_args<I, T>(args: I) -> Result<Config, SendableError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Config::try_parse_from(args)?.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, SendableError> {
        from_args(std::iter::once("brokerline").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_match_core_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.transport, TransportBackend::InMemory);
        assert_eq!(config.ordering_policy(), OrderingPolicy::Unordered);
        assert!(config.retry_policy().is_none());
        assert_eq!(config.log_level().ok(), Some(LevelFilter::Info));

        let settings = config.broker_settings();
        assert_eq!(settings.grace_period, Duration::from_secs(5));
        assert_eq!(settings.dispatch.workers, 1);
        assert_eq!(settings.dispatch.receive_timeout, Duration::from_secs(1));
    }

    #[test]
    fn flags_convert_into_policies() {
        let config = parse(&[
            "--transport",
            "http",
            "--workers",
            "4",
            "--max-in-flight",
            "8",
            "--ordering",
            "partition-pinned",
            "--max-retries",
            "2",
            "--backoff-initial-ms",
            "50",
            "--backoff-max-ms",
            "400",
            "--dead-letter",
            "orders.dlq",
        ])
        .unwrap();

        assert_eq!(config.transport, TransportBackend::Http);
        assert_eq!(config.ordering_policy(), OrderingPolicy::PartitionPinned);
        assert_eq!(config.dispatch_settings().in_flight_limit(), 8);
        assert_eq!(config.dead_letter.as_deref(), Some("orders.dlq"));
        assert_eq!(
            config.retry_policy(),
            Some(RetryPolicy::limited(2).with_backoff(Backoff::exponential(
                Duration::from_millis(50),
                Duration::from_millis(400)
            )))
        );
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = parse(&["--workers", "0"]).unwrap_err();
        let code = err.downcast_ref::<RuntimeError>().map(RuntimeError::code);
        assert_eq!(code, Some("brokerline.config.workers"));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(parse(&["--log-level", "chatty"]).is_err());
    }
}
