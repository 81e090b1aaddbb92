use brokerline_transport::{http::server::run_server, in_memory::InMemoryTransport, Capabilities};
use brokerline_utilities::{errors::SendableError, logger::parse_level, startup};
use log::info;
use std::{env, net::SocketAddr};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let level = parse_level(&env::var("BROKERLINE_LOG_LEVEL").unwrap_or_else(|_| "info".into()))?;
    startup::startup("Brokerline Transport", level, None)?;

    let addr: SocketAddr = env::var("BROKERLINE_TRANSPORT_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:7070".into())
        .parse()?;

    // Served transports redeliver through requeue like a queue broker.
    let transport = InMemoryTransport::with_capabilities(Capabilities::queue());
    info!("In-memory transport listening on {}", addr);
    run_server(addr, transport).await?;
    Ok(())
}
