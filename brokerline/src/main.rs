mod orders;

use std::sync::Arc;

use brokerline_config::{Config, TransportBackend, parse_config};
use brokerline_core::{App, Broker, HookError, LogObserver, LoggingMiddleware, Transport};
use brokerline_transport::{http::client::HttpTransport, in_memory::InMemoryTransport};
use brokerline_utilities::{
    errors::{RuntimeError, SendableError},
    startup,
};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup("Brokerline", config.log_level()?, config.log_file.as_deref())?;

    let transport = build_transport(&config)?;
    let mut broker = Broker::builder_shared(transport)
        .settings(config.broker_settings())
        .observer(LogObserver)
        .publish_middleware(LoggingMiddleware)
        .build();
    broker.subscribe(orders::subscription(&config))?;

    let app = App::new(broker)
        .after_startup(|| async {
            info!("Consuming '{}', doubled orders go to '{}'", orders::ORDERS, orders::DOUBLED);
            Ok::<_, HookError>(())
        })
        .on_shutdown(|| async {
            info!("Shutdown signal received. Draining subscriptions...");
            Ok::<_, HookError>(())
        });

    app.run(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
        }
    })
    .await?;

    Ok(())
}

fn build_transport(config: &Config) -> Result<Arc<dyn Transport>, SendableError> {
    match config.transport {
        TransportBackend::Http => {
            let url = reqwest::Url::parse(&config.transport_url).map_err(|err| {
                RuntimeError::boxed("brokerline.transport.invalid_endpoint", err.to_string())
            })?;

            let client = reqwest::Client::builder()
                .build()
                .map_err(|err| RuntimeError::boxed("brokerline.transport.client", err.to_string()))?;

            info!("Using HTTP transport at {}", url);
            Ok(Arc::new(HttpTransport::new(url, client)))
        }
        TransportBackend::InMemory => {
            info!("Using in-memory transport");
            Ok(Arc::new(InMemoryTransport::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerline_core::DeliveryModel;

    #[test]
    fn in_memory_backend_is_a_queue() {
        let config = brokerline_config::from_args(["brokerline"]).unwrap();
        let transport = build_transport(&config).unwrap();
        assert_eq!(transport.capabilities().model, DeliveryModel::Queue);
    }

    #[test]
    fn malformed_endpoint_is_reported_with_code() {
        let config = brokerline_config::from_args([
            "brokerline",
            "--transport",
            "http",
            "--transport-url",
            "not a url",
        ])
        .unwrap();
        let err = build_transport(&config).err().unwrap();
        let code = err.downcast_ref::<RuntimeError>().map(RuntimeError::code);
        assert_eq!(code, Some("brokerline.transport.invalid_endpoint"));
    }
}
