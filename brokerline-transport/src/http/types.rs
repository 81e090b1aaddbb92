use crate::{Destination, OutboundMessage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct BindRequest {
    pub destination: Destination,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub message: OutboundMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub destination: Destination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireDelivery {
    pub delivery_id: Uuid,
    pub delivery_count: u32,
    pub message: OutboundMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReceiveResponse {
    pub delivery: Option<WireDelivery>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettleRequest {
    pub destination: String,
    pub delivery_id: Uuid,
    #[serde(default)]
    pub requeue: bool,
}
