use crate::{
    http::types::{
        BindRequest, PublishRequest, ReceiveRequest, ReceiveResponse, SettleRequest, WireDelivery,
    },
    DeliveryToken, Transport, TransportError,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use log::info;
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;

const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

struct AppState<T> {
    transport: Arc<T>,
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

pub fn router<T>(transport: Arc<T>) -> Router
where
    T: Transport,
{
    Router::new()
        .route("/bind", post(bind::<T>))
        .route("/publish", post(publish::<T>))
        .route("/receive", post(receive::<T>))
        .route("/ack", post(ack::<T>))
        .route("/nack", post(nack::<T>))
        .with_state(AppState { transport })
}

pub async fn run_server<T>(addr: SocketAddr, transport: T) -> Result<(), std::io::Error>
where
    T: Transport,
{
    let listener = TcpListener::bind(addr).await?;
    serve(listener, transport).await
}

/// Serve on an already bound listener; the transport is connected first.
pub async fn serve<T>(listener: TcpListener, transport: T) -> Result<(), std::io::Error>
where
    T: Transport,
{
    transport
        .connect()
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    info!("transport server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(Arc::new(transport))).await
}

async fn bind<T>(State(state): State<AppState<T>>, Json(request): Json<BindRequest>) -> Response
where
    T: Transport,
{
    respond(state.transport.bind(&request.destination).await, StatusCode::OK)
}

async fn publish<T>(
    State(state): State<AppState<T>>,
    Json(request): Json<PublishRequest>,
) -> Response
where
    T: Transport,
{
    respond(
        state.transport.publish(request.message).await,
        StatusCode::CREATED,
    )
}

async fn receive<T>(
    State(state): State<AppState<T>>,
    Json(request): Json<ReceiveRequest>,
) -> Response
where
    T: Transport,
{
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_RECEIVE_TIMEOUT);

    match state.transport.receive(&request.destination, timeout).await {
        Ok(Some(envelope)) => json_response(
            StatusCode::OK,
            ReceiveResponse {
                delivery: Some(WireDelivery {
                    delivery_id: envelope.ack_handle().delivery_id(),
                    delivery_count: envelope.delivery_count(),
                    message: envelope.message().clone(),
                }),
            },
        ),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn ack<T>(State(state): State<AppState<T>>, Json(request): Json<SettleRequest>) -> Response
where
    T: Transport,
{
    let token = DeliveryToken::from_wire(request.destination, request.delivery_id);
    respond(state.transport.ack(token).await, StatusCode::OK)
}

async fn nack<T>(State(state): State<AppState<T>>, Json(request): Json<SettleRequest>) -> Response
where
    T: Transport,
{
    let token = DeliveryToken::from_wire(request.destination, request.delivery_id);
    respond(
        state.transport.nack(token, request.requeue).await,
        StatusCode::OK,
    )
}

fn respond(result: Result<(), TransportError>, success: StatusCode) -> Response {
    match result {
        Ok(_) => success.into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: TransportError) -> Response {
    match err {
        TransportError::Rejected(destination) => json_response(
            StatusCode::CONFLICT,
            ErrorResponse::new("rejected", destination),
        ),
        TransportError::UnknownDelivery(id) => {
            json_response(StatusCode::NOT_FOUND, ErrorResponse::unknown_delivery(id))
        }
        TransportError::Unsupported(context) => json_response(
            StatusCode::NOT_IMPLEMENTED,
            ErrorResponse::new("unsupported", context),
        ),
        TransportError::NotConnected => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new("not_connected", "transport is not connected"),
        ),
        TransportError::Connection(message) | TransportError::Internal(message) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::new("internal", message),
        ),
    }
}

fn json_response<P>(status: StatusCode, payload: P) -> Response
where
    P: Serialize,
{
    (status, axum::Json(payload)).into_response()
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl ErrorResponse {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn unknown_delivery(id: uuid::Uuid) -> Self {
        Self::new("unknown_delivery", id.to_string())
    }
}
