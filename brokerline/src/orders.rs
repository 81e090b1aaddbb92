use brokerline_config::Config;
use brokerline_core::{HandlerError, LoggingMiddleware, Subscription, handler_fn};
use log::info;
use serde::{Deserialize, Serialize};

pub const ORDERS: &str = "orders";
pub const DOUBLED: &str = "orders.doubled";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoubledOrder {
    pub id: String,
    pub quantity: i64,
}

pub fn double(order: Order) -> Result<DoubledOrder, HandlerError> {
    let quantity = order.quantity.checked_mul(2).ok_or_else(|| {
        HandlerError::reject(format!("quantity of order {} overflows", order.id))
    })?;
    Ok(DoubledOrder {
        id: order.id,
        quantity,
    })
}

/// Doubles every order and forwards the result to `orders.doubled`.
pub fn subscription(config: &Config) -> Subscription {
    let mut builder = Subscription::builder(ORDERS)
        .name("double-orders")
        .middleware(LoggingMiddleware)
        .ordering(config.ordering_policy())
        .respond_to(DOUBLED)
        .handler(handler_fn(|order: Order, _context| async move {
            info!("doubling order {}", order.id);
            double(order)
        }));

    if let Some(retry) = config.retry_policy() {
        builder = builder.retry(retry);
    }
    if let Some(dead_letter) = &config.dead_letter {
        builder = builder.dead_letter(dead_letter.as_str());
    }
    builder.build()
}
